//! Algorithm negotiation
//!
//! Pure functions: the highest-priority algorithm present in every capability
//! set wins. Nothing here performs I/O, so results are deterministic and
//! symmetric in the order of the inputs.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::algorithm::{AlgorithmId, CapabilitySet, Classification};
use crate::error::{E2eeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationResult {
    pub algorithm: AlgorithmId,
    pub classification: Classification,
    /// A participant declared a hybrid or quantum algorithm, yet the selected
    /// one is classical.
    pub quantum_fallback: bool,
}

impl NegotiationResult {
    fn select(sets: &[&CapabilitySet], supported: Option<&CapabilitySet>) -> Result<Self> {
        if sets.is_empty() {
            return Err(E2eeError::NoCommonAlgorithm);
        }

        let algorithm = AlgorithmId::ALL
            .iter()
            .copied()
            .filter(|candidate| supported.map_or(true, |s| s.contains(candidate)))
            .find(|candidate| sets.iter().all(|set| set.contains(candidate)))
            .ok_or(E2eeError::NoCommonAlgorithm)?;

        let declared_quantum = sets
            .iter()
            .any(|set| set.iter().any(|a| a.is_quantum_resistant()));
        let classification = algorithm.classification();
        let quantum_fallback = declared_quantum && classification == Classification::Classical;

        if quantum_fallback {
            warn!(
                target: "crypto::negotiation",
                algorithm = %algorithm,
                participants = sets.len(),
                "Quantum-capable participant fell back to a classical algorithm"
            );
        } else {
            debug!(
                target: "crypto::negotiation",
                algorithm = %algorithm,
                classification = ?classification,
                participants = sets.len(),
                "Negotiated algorithm"
            );
        }

        Ok(Self {
            algorithm,
            classification,
            quantum_fallback,
        })
    }
}

/// Pairwise negotiation.
pub fn negotiate(local: &CapabilitySet, remote: &CapabilitySet) -> Result<NegotiationResult> {
    NegotiationResult::select(&[local, remote], None)
}

/// Negotiation across any number of devices: the candidate must be in every set.
pub fn negotiate_all<'a, I>(sets: I) -> Result<NegotiationResult>
where
    I: IntoIterator<Item = &'a CapabilitySet>,
{
    let sets: Vec<&CapabilitySet> = sets.into_iter().collect();
    NegotiationResult::select(&sets, None)
}

/// Like [`negotiate_all`], restricted to what the local primitive suite can execute.
pub fn negotiate_supported<'a, I>(sets: I, supported: &CapabilitySet) -> Result<NegotiationResult>
where
    I: IntoIterator<Item = &'a CapabilitySet>,
{
    let sets: Vec<&CapabilitySet> = sets.into_iter().collect();
    NegotiationResult::select(&sets, Some(supported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::algorithm::parse_capabilities;

    #[test]
    fn test_highest_common_quantum_level_wins() {
        let local = parse_capabilities(["ML-KEM-1024", "ML-KEM-768", "Curve25519"]);
        let remote = parse_capabilities(["ML-KEM-768", "ML-KEM-512", "Curve25519"]);

        let result = negotiate(&local, &remote).unwrap();
        assert_eq!(result.algorithm, AlgorithmId::MlKem768);
        assert_eq!(result.classification, Classification::Quantum);
        assert!(!result.quantum_fallback);
    }

    #[test]
    fn test_disjoint_sets_fail() {
        let local = parse_capabilities(["Curve25519"]);
        let remote = parse_capabilities(["ML-KEM-1024"]);
        assert_eq!(negotiate(&local, &remote), Err(E2eeError::NoCommonAlgorithm));
        assert_eq!(negotiate_all(std::iter::empty()), Err(E2eeError::NoCommonAlgorithm));
    }

    #[test]
    fn test_fallback_is_explicit() {
        let local = parse_capabilities(["HYBRID", "Curve25519"]);
        let remote = parse_capabilities(["Curve25519"]);

        let result = negotiate(&local, &remote).unwrap();
        assert_eq!(result.algorithm, AlgorithmId::Curve25519);
        assert!(result.quantum_fallback);
        assert_eq!(negotiate(&remote, &local).unwrap(), result);
    }

    #[test]
    fn test_support_filter_records_fallback() {
        let local = parse_capabilities(["ML-KEM-768", "Curve25519"]);
        let remote = parse_capabilities(["ML-KEM-768", "Curve25519"]);
        let classical_only = parse_capabilities(["Curve25519"]);

        let result = negotiate_supported([&local, &remote], &classical_only).unwrap();
        assert_eq!(result.algorithm, AlgorithmId::Curve25519);
        assert!(result.quantum_fallback);
    }

    #[test]
    fn test_conversation_wide_intersection() {
        let a = parse_capabilities(["ML-KEM-1024", "ML-KEM-768"]);
        let b = parse_capabilities(["ML-KEM-768", "ML-KEM-512"]);
        let c = parse_capabilities(["ML-KEM-768", "HYBRID"]);

        let result = negotiate_all([&a, &b, &c]).unwrap();
        assert_eq!(result.algorithm, AlgorithmId::MlKem768);

        let d = parse_capabilities(["ML-KEM-512"]);
        assert_eq!(negotiate_all([&a, &b, &c, &d]), Err(E2eeError::NoCommonAlgorithm));
    }
}
