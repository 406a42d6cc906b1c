//! Negotiation properties: symmetry, maximality, empty intersections.

use construct_e2ee::crypto::algorithm::{parse_capabilities, AlgorithmId, CapabilitySet, Classification};
use construct_e2ee::crypto::negotiation::{negotiate, negotiate_all, negotiate_supported};
use construct_e2ee::E2eeError;
use proptest::prelude::*;

fn capability_set() -> impl Strategy<Value = CapabilitySet> {
    proptest::sample::subsequence(AlgorithmId::ALL.to_vec(), 0..=AlgorithmId::ALL.len())
        .prop_map(|algorithms| algorithms.into_iter().collect())
}

proptest! {
    #[test]
    fn negotiation_is_symmetric(a in capability_set(), b in capability_set()) {
        prop_assert_eq!(negotiate(&a, &b), negotiate(&b, &a));
    }

    #[test]
    fn negotiation_picks_best_common_algorithm(a in capability_set(), b in capability_set()) {
        let common: CapabilitySet = a.intersection(&b).copied().collect();
        match negotiate(&a, &b) {
            Ok(result) => {
                prop_assert!(common.contains(&result.algorithm));
                prop_assert_eq!(Some(&result.algorithm), common.iter().next());
                prop_assert_eq!(result.classification, result.algorithm.classification());
            }
            Err(err) => {
                prop_assert_eq!(err, E2eeError::NoCommonAlgorithm);
                prop_assert!(common.is_empty());
            }
        }
    }

    #[test]
    fn group_negotiation_ignores_order(
        a in capability_set(),
        b in capability_set(),
        c in capability_set(),
    ) {
        prop_assert_eq!(negotiate_all([&a, &b, &c]), negotiate_all([&c, &a, &b]));
    }
}

#[test]
fn test_highest_shared_quantum_level() {
    let local = parse_capabilities(["ML-KEM-1024", "ML-KEM-768", "Curve25519"]);
    let remote = parse_capabilities(["ML-KEM-768", "ML-KEM-512", "Curve25519"]);

    let result = negotiate(&local, &remote).unwrap();
    assert_eq!(result.algorithm, AlgorithmId::MlKem768);
    assert_eq!(result.classification, Classification::Quantum);
    assert!(!result.quantum_fallback);
}

#[test]
fn test_hybrid_beats_classical() {
    let local = parse_capabilities(["HYBRID", "Curve25519"]);
    let remote = parse_capabilities(["HYBRID-X25519-ML-KEM-768", "Curve25519", "RSA-4096"]);

    let result = negotiate(&local, &remote).unwrap();
    assert_eq!(result.algorithm, AlgorithmId::HybridX25519MlKem768);
    assert_eq!(result.classification, Classification::Hybrid);
}

#[test]
fn test_classical_fallback_is_flagged() {
    let quantum = parse_capabilities(["ML-KEM-1024", "Curve25519"]);
    let classical = parse_capabilities(["Curve25519"]);

    let result = negotiate(&quantum, &classical).unwrap();
    assert_eq!(result.algorithm, AlgorithmId::Curve25519);
    assert!(result.quantum_fallback);
    assert_eq!(negotiate(&classical, &quantum).unwrap(), result);
}

#[test]
fn test_disjoint_sets_fail() {
    let quantum_only = parse_capabilities(["ML-KEM-768"]);
    let classical = parse_capabilities(["Curve25519"]);
    assert_eq!(negotiate(&quantum_only, &classical), Err(E2eeError::NoCommonAlgorithm));
}

#[test]
fn test_engine_support_limits_the_choice() {
    let caps = parse_capabilities(["ML-KEM-768", "Curve25519"]);
    let classical_engine = parse_capabilities(["Curve25519"]);

    let result = negotiate_supported([&caps, &caps], &classical_engine).unwrap();
    assert_eq!(result.algorithm, AlgorithmId::Curve25519);
    assert!(result.quantum_fallback);
}
