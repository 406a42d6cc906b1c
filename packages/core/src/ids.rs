//! Identifiers used across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Random v4 UUID identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Registry identifier of a single device.
    DeviceId
);
string_id!(
    /// Owner of one or more devices.
    UserId
);
string_id!(
    /// Conversation (chat) identifier.
    ConversationId
);

/// Composite key of a ratchet session.
///
/// A session belongs to exactly one conversation and connects one local
/// device with one remote device. The reverse direction
/// (`remote -> local`) is a different session owned by the other endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub conversation_id: ConversationId,
    pub local_device: DeviceId,
    pub remote_device: DeviceId,
}

impl SessionId {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        local_device: impl Into<DeviceId>,
        remote_device: impl Into<DeviceId>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            local_device: local_device.into(),
            remote_device: remote_device.into(),
        }
    }

    /// The same pair seen from the other endpoint.
    pub fn reversed(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            local_device: self.remote_device.clone(),
            remote_device: self.local_device.clone(),
        }
    }

    pub fn involves(&self, device: &DeviceId) -> bool {
        &self.local_device == device || &self.remote_device == device
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} -> {}]",
            self.conversation_id, self.local_device, self.remote_device
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_session_ids_do_not_collide_on_concatenation() {
        // "ab" + "c" and "a" + "bc" would collide if ids were joined as strings
        let first = SessionId::new("conv", "ab", "c");
        let second = SessionId::new("conv", "a", "bc");
        assert_ne!(first, second);

        let set: HashSet<_> = [first, second].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_reversed_session_id() {
        let id = SessionId::new("conv", "alice-phone", "bob-laptop");
        let reversed = id.reversed();
        assert_eq!(reversed.local_device, DeviceId::from("bob-laptop"));
        assert_eq!(reversed.reversed(), id);
        assert!(id.involves(&DeviceId::from("bob-laptop")));
        assert!(!id.involves(&DeviceId::from("carol-tablet")));
    }
}
