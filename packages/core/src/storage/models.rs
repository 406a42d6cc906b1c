// Модели записей в хранилище (bincode)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::keys::{OneTimePreKey, SignedPreKey};
use crate::crypto::negotiation::NegotiationResult;
use crate::ids::{ConversationId, DeviceId, SessionId};
use crate::utils::time::is_older_than;

/// Signed prekeys of one device: the published one plus superseded ones
/// still accepted for in-flight handshakes.
#[derive(Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub current: SignedPreKey,
    pub previous: Vec<SignedPreKey>,
    pub next_id: u32,
}

impl SignedPreKeyRecord {
    pub fn new(current: SignedPreKey) -> Self {
        let next_id = current.id.wrapping_add(1);
        Self {
            current,
            previous: Vec::new(),
            next_id,
        }
    }

    pub fn find(&self, id: u32) -> Option<&SignedPreKey> {
        if self.current.id == id {
            return Some(&self.current);
        }
        self.previous.iter().find(|k| k.id == id)
    }

    /// Publishes `replacement`; the old key moves to `previous`.
    pub fn supersede(&mut self, replacement: SignedPreKey, now: i64) {
        let mut old = std::mem::replace(&mut self.current, replacement);
        old.superseded_at = Some(now);
        self.previous.push(old);
        self.next_id = self.current.id.wrapping_add(1);
    }

    /// Drops superseded keys past the retention window. Returns how many.
    pub fn prune(&mut self, now: i64, retention_seconds: i64) -> usize {
        let before = self.previous.len();
        self.previous.retain(|k| {
            let since = k.superseded_at.unwrap_or(k.created_at);
            !is_older_than(since, now, retention_seconds)
        });
        before - self.previous.len()
    }
}

/// One-time prekey pool of one device
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    pub keys: BTreeMap<u32, OneTimePreKey>,
    pub next_id: u32,
}

impl OneTimePreKeyRecord {
    pub fn extend(&mut self, batch: Vec<OneTimePreKey>) {
        for key in batch {
            self.next_id = self.next_id.max(key.id.wrapping_add(1));
            self.keys.insert(key.id, key);
        }
    }

    /// Keys not yet issued in any bundle
    pub fn available(&self) -> usize {
        self.keys.values().filter(|k| !k.used).count()
    }

    /// Unissued ids, lowest first
    pub fn candidates(&self) -> Vec<u32> {
        self.keys.values().filter(|k| !k.used).map(|k| k.id).collect()
    }

    pub fn mark_used(&mut self, id: u32, now: i64) {
        if let Some(key) = self.keys.get_mut(&id) {
            key.used = true;
            key.issued_at.get_or_insert(now);
        }
    }

    /// Drops issued keys whose handshake never arrived within the retention
    /// window. Returns how many.
    pub fn prune_issued(&mut self, now: i64, retention_seconds: i64) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, k| {
            !(k.used && k.issued_at.map_or(true, |at| is_older_than(at, now, retention_seconds)))
        });
        before - self.keys.len()
    }

    /// Removes the private half after the handshake arrived.
    pub fn take(&mut self, id: u32) -> Option<OneTimePreKey> {
        self.keys.remove(&id)
    }
}

/// Unordered device pair of a conversation and who ran X3DH as initiator.
///
/// Each pair owns two endpoint sessions, `initiator -> responder` and the
/// reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPair {
    pub initiator: DeviceId,
    pub responder: DeviceId,
}

impl SessionPair {
    pub fn new(initiator: DeviceId, responder: DeviceId) -> Self {
        Self { initiator, responder }
    }

    pub fn initiator_session(&self, conversation_id: &ConversationId) -> SessionId {
        SessionId::new(conversation_id.clone(), self.initiator.clone(), self.responder.clone())
    }

    pub fn responder_session(&self, conversation_id: &ConversationId) -> SessionId {
        SessionId::new(conversation_id.clone(), self.responder.clone(), self.initiator.clone())
    }

    pub fn involves(&self, device: &DeviceId) -> bool {
        &self.initiator == device || &self.responder == device
    }

    pub fn peer_of(&self, device: &DeviceId) -> Option<&DeviceId> {
        if &self.initiator == device {
            Some(&self.responder)
        } else if &self.responder == device {
            Some(&self.initiator)
        } else {
            None
        }
    }

    pub fn connects(&self, a: &DeviceId, b: &DeviceId) -> bool {
        (&self.initiator == a && &self.responder == b) || (&self.initiator == b && &self.responder == a)
    }
}

/// Encryption state of a conversation as a whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub negotiation: NegotiationResult,
    /// Highest epoch reached by a conversation-wide rotation
    pub epoch: u32,
    pub pairs: Vec<SessionPair>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationRecord {
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .pairs
            .iter()
            .flat_map(|p| [p.initiator.clone(), p.responder.clone()])
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    pub fn has_pair(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.pairs.iter().any(|p| p.connects(a, b))
    }
}
