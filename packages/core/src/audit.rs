//! Health / compatibility auditor
//!
//! Только чтение: отчёты строятся по записям устройств и возможностям
//! primitive suite. Состояние сессий и ключей не затрагивается.
//!
//! ```text
//! Device ──▶ quantum_readiness ──┐
//!        ──▶ verification_status ├──▶ DeviceAudit
//!                                │
//! [Device] ──▶ negotiate_supported ──▶ compatibility_score(a, b) ──▶ ConversationAudit
//! ```

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::crypto::algorithm::{AlgorithmId, Classification};
use crate::crypto::negotiation::{negotiate_supported, NegotiationResult};
use crate::crypto::suites::PrimitiveSuite;
use crate::ids::DeviceId;
use crate::registry::Device;
use crate::utils::time::is_older_than;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuantumReadiness {
    pub declares_quantum: bool,
    pub declares_hybrid: bool,
    /// The engine can run at least one declared hybrid or quantum algorithm
    pub engine_supported: bool,
    pub ready: bool,
    /// Highest-priority declared algorithm the engine can run
    pub best_algorithm: Option<AlgorithmId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationStatus {
    Current,
    VerificationNeeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAudit {
    pub device_id: DeviceId,
    pub readiness: QuantumReadiness,
    pub verification: VerificationStatus,
    pub encryption_version: u8,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairScore {
    pub a: DeviceId,
    pub b: DeviceId,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationAudit {
    pub devices: Vec<DeviceAudit>,
    /// `None` when the active devices share no runnable algorithm
    pub negotiated: Option<NegotiationResult>,
    /// Pairwise scores for the negotiated algorithm
    pub pair_scores: Vec<PairScore>,
    pub quantum_ready: bool,
}

pub struct CompatibilityAuditor<'a> {
    suite: &'a PrimitiveSuite,
    config: &'a Config,
}

impl<'a> CompatibilityAuditor<'a> {
    pub fn new(suite: &'a PrimitiveSuite, config: &'a Config) -> Self {
        Self { suite, config }
    }

    pub fn quantum_readiness(&self, device: &Device) -> QuantumReadiness {
        let declares_quantum = device.supports_quantum();
        let declares_hybrid = device.supports_hybrid();
        let engine_supported = device
            .capabilities
            .iter()
            .any(|a| a.is_quantum_resistant() && self.suite.supports(*a));
        let best_algorithm = device
            .capabilities
            .iter()
            .copied()
            .find(|a| self.suite.supports(*a));

        QuantumReadiness {
            declares_quantum,
            declares_hybrid,
            engine_supported,
            ready: (declares_quantum || declares_hybrid) && engine_supported,
            best_algorithm,
        }
    }

    /// 0-100 score of running `candidate` between `a` and `b`.
    ///
    /// Security weighs 70%, inverse performance cost 30%. Zero when either
    /// device lacks the candidate or the engine cannot run it.
    pub fn compatibility_score(&self, a: &Device, b: &Device, candidate: AlgorithmId) -> u8 {
        if !a.capabilities.contains(&candidate)
            || !b.capabilities.contains(&candidate)
            || !self.suite.supports(candidate)
        {
            return 0;
        }
        let security = u32::from(candidate.security_weight());
        let speed = 100 - u32::from(candidate.performance_cost().min(100));
        ((7 * security + 3 * speed) / 10) as u8
    }

    pub fn verification_status(&self, device: &Device, now: i64) -> VerificationStatus {
        match device.capabilities_verified_at {
            Some(at) if !is_older_than(at, now, self.config.capability_reverification_seconds) => {
                VerificationStatus::Current
            }
            _ => VerificationStatus::VerificationNeeded,
        }
    }

    pub fn audit_device(&self, device: &Device, now: i64) -> DeviceAudit {
        let audit = DeviceAudit {
            device_id: device.device_id.clone(),
            readiness: self.quantum_readiness(device),
            verification: self.verification_status(device, now),
            encryption_version: device.encryption_version,
            revoked: device.is_revoked(),
        };
        debug!(
            target: "audit",
            device = %device.device_id,
            ready = audit.readiness.ready,
            verification = ?audit.verification,
            "Device audited"
        );
        audit
    }

    /// Revoked devices are audited but left out of negotiation and scoring.
    pub fn audit_conversation(&self, devices: &[Device], now: i64) -> ConversationAudit {
        let audits: Vec<DeviceAudit> = devices.iter().map(|d| self.audit_device(d, now)).collect();
        let active: Vec<&Device> = devices.iter().filter(|d| !d.is_revoked()).collect();

        let supported = self.suite.supported_algorithms();
        let negotiated = negotiate_supported(active.iter().map(|d| &d.capabilities), &supported).ok();

        let mut pair_scores = Vec::new();
        if let Some(result) = negotiated {
            for (i, a) in active.iter().enumerate() {
                for b in &active[i + 1..] {
                    pair_scores.push(PairScore {
                        a: a.device_id.clone(),
                        b: b.device_id.clone(),
                        score: self.compatibility_score(a, b, result.algorithm),
                    });
                }
            }
        }
        let quantum_ready = negotiated.map_or(false, |n| n.classification != Classification::Classical);

        info!(
            target: "audit",
            devices = devices.len(),
            algorithm = ?negotiated.map(|n| n.algorithm),
            quantum_ready,
            "Conversation audited"
        );
        ConversationAudit {
            devices: audits,
            negotiated,
            pair_scores,
            quantum_ready,
        }
    }
}
