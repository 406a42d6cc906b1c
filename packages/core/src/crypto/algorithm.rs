//! Algorithm identifiers
//!
//! Closed set of key-agreement algorithms the engine can negotiate. Every
//! property (priority, classification, KEM parameter set, protocol version,
//! audit weights) is an exhaustive `match`, so a new variant cannot be added
//! without wiring it into negotiation and primitive dispatch.
//!
//! ```text
//! priority  identifier                  classification  KEM        X25519
//! --------  --------------------------  --------------  ---------  ------
//!   0       ML-KEM-1024                 quantum         1024       -
//!   1       ML-KEM-768                  quantum         768        -
//!   2       ML-KEM-512                  quantum         512        -
//!   3       HYBRID-X25519-ML-KEM-1024   hybrid          1024       yes
//!   4       HYBRID-X25519-ML-KEM-768    hybrid          768        yes
//!   5       Curve25519                  classical       -          yes
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::CryptoError;

/// Capability list of a device (duplicates collapse, unknown ids are dropped)
pub type CapabilitySet = BTreeSet<AlgorithmId>;

/// Declaration order is priority order: `Ord` sorts the preferred algorithm first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlgorithmId {
    MlKem1024,
    MlKem768,
    MlKem512,
    HybridX25519MlKem1024,
    HybridX25519MlKem768,
    Curve25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Classical,
    Hybrid,
    Quantum,
}

/// ML-KEM parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KemLevel {
    MlKem512,
    MlKem768,
    MlKem1024,
}

impl KemLevel {
    pub const ALL: [KemLevel; 3] = [KemLevel::MlKem512, KemLevel::MlKem768, KemLevel::MlKem1024];

    pub fn as_str(&self) -> &'static str {
        match self {
            KemLevel::MlKem512 => "ML-KEM-512",
            KemLevel::MlKem768 => "ML-KEM-768",
            KemLevel::MlKem1024 => "ML-KEM-1024",
        }
    }
}

impl fmt::Display for KemLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AlgorithmId {
    /// All algorithms, highest priority first
    pub const ALL: [AlgorithmId; 6] = [
        AlgorithmId::MlKem1024,
        AlgorithmId::MlKem768,
        AlgorithmId::MlKem512,
        AlgorithmId::HybridX25519MlKem1024,
        AlgorithmId::HybridX25519MlKem768,
        AlgorithmId::Curve25519,
    ];

    /// Minimum acceptable classical scheme
    pub const FALLBACK: AlgorithmId = AlgorithmId::Curve25519;

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmId::MlKem1024 => "ML-KEM-1024",
            AlgorithmId::MlKem768 => "ML-KEM-768",
            AlgorithmId::MlKem512 => "ML-KEM-512",
            AlgorithmId::HybridX25519MlKem1024 => "HYBRID-X25519-ML-KEM-1024",
            AlgorithmId::HybridX25519MlKem768 => "HYBRID-X25519-ML-KEM-768",
            AlgorithmId::Curve25519 => "Curve25519",
        }
    }

    /// Lower is preferred
    pub fn priority(&self) -> u8 {
        match self {
            AlgorithmId::MlKem1024 => 0,
            AlgorithmId::MlKem768 => 1,
            AlgorithmId::MlKem512 => 2,
            AlgorithmId::HybridX25519MlKem1024 => 3,
            AlgorithmId::HybridX25519MlKem768 => 4,
            AlgorithmId::Curve25519 => 5,
        }
    }

    pub fn classification(&self) -> Classification {
        match self {
            AlgorithmId::MlKem1024 | AlgorithmId::MlKem768 | AlgorithmId::MlKem512 => {
                Classification::Quantum
            }
            AlgorithmId::HybridX25519MlKem1024 | AlgorithmId::HybridX25519MlKem768 => {
                Classification::Hybrid
            }
            AlgorithmId::Curve25519 => Classification::Classical,
        }
    }

    pub fn kem_level(&self) -> Option<KemLevel> {
        match self {
            AlgorithmId::MlKem1024 | AlgorithmId::HybridX25519MlKem1024 => Some(KemLevel::MlKem1024),
            AlgorithmId::MlKem768 | AlgorithmId::HybridX25519MlKem768 => Some(KemLevel::MlKem768),
            AlgorithmId::MlKem512 => Some(KemLevel::MlKem512),
            AlgorithmId::Curve25519 => None,
        }
    }

    /// Whether the X3DH Diffie-Hellman triple participates in the handshake
    pub fn uses_classical_dh(&self) -> bool {
        match self.classification() {
            Classification::Classical | Classification::Hybrid => true,
            Classification::Quantum => false,
        }
    }

    /// Hybrid or quantum
    pub fn is_quantum_resistant(&self) -> bool {
        self.kem_level().is_some()
    }

    /// Protocol major version a device negotiating this algorithm speaks
    pub fn protocol_version(&self) -> u8 {
        match self.classification() {
            Classification::Classical => 1,
            Classification::Hybrid => 2,
            Classification::Quantum => 3,
        }
    }

    /// Relative security strength (0-100) used by the auditor
    pub fn security_weight(&self) -> u8 {
        match self {
            AlgorithmId::MlKem1024 => 100,
            AlgorithmId::MlKem768 => 90,
            AlgorithmId::MlKem512 => 80,
            AlgorithmId::HybridX25519MlKem1024 => 95,
            AlgorithmId::HybridX25519MlKem768 => 88,
            AlgorithmId::Curve25519 => 60,
        }
    }

    /// Relative handshake cost (0-100, higher is slower/larger)
    pub fn performance_cost(&self) -> u8 {
        match self {
            AlgorithmId::MlKem1024 => 45,
            AlgorithmId::MlKem768 => 35,
            AlgorithmId::MlKem512 => 25,
            AlgorithmId::HybridX25519MlKem1024 => 55,
            AlgorithmId::HybridX25519MlKem768 => 45,
            AlgorithmId::Curve25519 => 10,
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "ML-KEM-1024" | "KYBER1024" => Ok(AlgorithmId::MlKem1024),
            "ML-KEM-768" | "KYBER768" => Ok(AlgorithmId::MlKem768),
            "ML-KEM-512" | "KYBER512" => Ok(AlgorithmId::MlKem512),
            "HYBRID-X25519-ML-KEM-1024" => Ok(AlgorithmId::HybridX25519MlKem1024),
            "HYBRID" | "HYBRID-X25519-ML-KEM-768" => Ok(AlgorithmId::HybridX25519MlKem768),
            "CURVE25519" | "X25519" => Ok(AlgorithmId::Curve25519),
            _ => Err(CryptoError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Builds a capability set from declared identifiers, skipping unknown ones.
pub fn parse_capabilities<I, T>(declared: I) -> CapabilitySet
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    declared
        .into_iter()
        .filter_map(|id| match id.as_ref().parse::<AlgorithmId>() {
            Ok(algorithm) => Some(algorithm),
            Err(_) => {
                tracing::debug!(
                    target: "crypto::negotiation",
                    identifier = %id.as_ref(),
                    "Ignoring unknown algorithm identifier"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_order_matches_priority() {
        let mut sorted = AlgorithmId::ALL.to_vec();
        sorted.sort_by_key(|a| a.priority());
        assert_eq!(sorted, AlgorithmId::ALL.to_vec());

        let set: CapabilitySet = AlgorithmId::ALL.iter().rev().copied().collect();
        assert_eq!(set.iter().next(), Some(&AlgorithmId::MlKem1024));
    }

    #[test]
    fn test_parse_identifiers() {
        assert_eq!("ML-KEM-768".parse::<AlgorithmId>().unwrap(), AlgorithmId::MlKem768);
        assert_eq!("HYBRID".parse::<AlgorithmId>().unwrap(), AlgorithmId::HybridX25519MlKem768);
        assert_eq!("curve25519".parse::<AlgorithmId>().unwrap(), AlgorithmId::Curve25519);
        assert!("RSA-4096".parse::<AlgorithmId>().is_err());

        for algorithm in AlgorithmId::ALL {
            assert_eq!(algorithm.as_str().parse::<AlgorithmId>().unwrap(), algorithm);
        }
    }

    #[test]
    fn test_unknown_capabilities_are_ignored() {
        let caps = parse_capabilities(["ML-KEM-512", "RSA-2048", "Curve25519", "ML-KEM-512"]);
        assert_eq!(caps.len(), 2);
        assert!(caps.contains(&AlgorithmId::MlKem512));
        assert!(caps.contains(&AlgorithmId::Curve25519));
    }

    #[test]
    fn test_classification_and_versions() {
        assert_eq!(AlgorithmId::MlKem512.classification(), Classification::Quantum);
        assert_eq!(AlgorithmId::HybridX25519MlKem1024.classification(), Classification::Hybrid);
        assert_eq!(AlgorithmId::Curve25519.classification(), Classification::Classical);

        assert_eq!(AlgorithmId::Curve25519.protocol_version(), 1);
        assert_eq!(AlgorithmId::HybridX25519MlKem768.protocol_version(), 2);
        assert_eq!(AlgorithmId::MlKem1024.protocol_version(), 3);

        assert!(!AlgorithmId::MlKem768.uses_classical_dh());
        assert!(AlgorithmId::HybridX25519MlKem768.uses_classical_dh());
        assert_eq!(AlgorithmId::HybridX25519MlKem768.kem_level(), Some(KemLevel::MlKem768));
    }
}
