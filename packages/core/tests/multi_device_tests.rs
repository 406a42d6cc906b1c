//! Multi-device fan-out: setup, sharing, rotation, migration, removal.

use construct_e2ee::crypto::algorithm::parse_capabilities;
use construct_e2ee::crypto::messaging::KeyRetention;
use construct_e2ee::registry::TrustState;
use construct_e2ee::storage::{ConversationRecord, SessionPair};
use construct_e2ee::utils::time::current_timestamp;
use construct_e2ee::{
    AlgorithmId, Config, ConversationId, Device, DeviceId, DeviceRegistry, E2eeEngine, E2eeError, MemoryDeviceRegistry,
    MemoryKeyStore, PrimitiveSuite, SessionManager,
};

type Manager = SessionManager<MemoryKeyStore, MemoryDeviceRegistry>;

fn manager(suite: PrimitiveSuite) -> Manager {
    let config = Config {
        one_time_prekey_batch: 8,
        ..Config::default()
    };
    let engine = E2eeEngine::new(suite, config, MemoryKeyStore::new());
    SessionManager::new(engine, MemoryDeviceRegistry::new())
}

async fn join(manager: &Manager, conversation: &ConversationId, device: &str, user: &str, caps: &[&str]) -> Device {
    let device = Device::new(
        device,
        user,
        parse_capabilities(caps.iter().copied()),
        current_timestamp(),
    );
    manager.registry().register_device(device.clone()).await;
    manager
        .registry()
        .add_participant(conversation, &device.device_id)
        .await;
    device
}

async fn record(manager: &Manager, conversation: &ConversationId) -> ConversationRecord {
    manager.conversation(conversation).await.unwrap().unwrap()
}

fn find_pair<'a>(record: &'a ConversationRecord, a: &str, b: &str) -> &'a SessionPair {
    record
        .pairs
        .iter()
        .find(|p| p.connects(&DeviceId::from(a), &DeviceId::from(b)))
        .unwrap()
}

/// Sends `text` from the initiator endpoint of `pair` and returns what the responder reads.
async fn relay(manager: &Manager, conversation: &ConversationId, pair: &SessionPair, text: &[u8]) -> Vec<u8> {
    let engine = manager.engine();
    let envelope = engine
        .encrypt(&pair.initiator_session(conversation), text)
        .await
        .unwrap();
    engine
        .decrypt(&pair.responder_session(conversation), &envelope)
        .await
        .unwrap()
}

async fn classical_trio(manager: &Manager, conversation: &ConversationId) -> Vec<Device> {
    vec![
        join(manager, conversation, "alice-phone", "alice", &["Curve25519"]).await,
        join(manager, conversation, "alice-laptop", "alice", &["Curve25519"]).await,
        join(manager, conversation, "bob-phone", "bob", &["Curve25519"]).await,
    ]
}

#[tokio::test]
async fn test_setup_builds_full_mesh() {
    let manager = manager(PrimitiveSuite::classical_only());
    let conversation = ConversationId::from("team");
    let devices = classical_trio(&manager, &conversation).await;

    let result = manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("bob-phone"))
        .await
        .unwrap();
    assert_eq!(result.negotiation.algorithm, AlgorithmId::Curve25519);
    assert_eq!(result.created_sessions.len(), 6);
    assert!(result.failed_devices.is_empty());

    let record = record(&manager, &conversation).await;
    assert_eq!(record.pairs.len(), 3);
    assert_eq!(record.epoch, 0);

    // The initiating device runs X3DH in its pairs, the smaller id elsewhere
    assert_eq!(find_pair(&record, "bob-phone", "alice-phone").initiator, DeviceId::from("bob-phone"));
    assert_eq!(find_pair(&record, "alice-phone", "alice-laptop").initiator, DeviceId::from("alice-laptop"));

    for pair in &record.pairs {
        assert_eq!(relay(&manager, &conversation, pair, b"hi").await, b"hi");
    }
    for device in &devices {
        let stored = manager.registry().get_device(&device.device_id).await.unwrap();
        assert_eq!(stored.encryption_version, 1);
        assert!(stored.identity_fingerprint.is_some());
    }
}

#[tokio::test]
async fn test_setup_without_common_algorithm_fails_whole_conversation() {
    let manager = manager(PrimitiveSuite::default());
    let conversation = ConversationId::from("split");
    let devices = vec![
        join(&manager, &conversation, "q", "alice", &["ML-KEM-768"]).await,
        join(&manager, &conversation, "c", "bob", &["Curve25519"]).await,
    ];

    let result = manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("q"))
        .await;
    assert_eq!(result, Err(E2eeError::NoCommonAlgorithm));
    assert!(manager.conversation(&conversation).await.unwrap().is_none());
    assert!(!manager.engine().has_identity(&DeviceId::from("q")).await.unwrap());
}

#[tokio::test]
async fn test_revoked_devices_are_reported() {
    let manager = manager(PrimitiveSuite::classical_only());
    let conversation = ConversationId::from("team");
    let mut devices = classical_trio(&manager, &conversation).await;
    devices[1].trust = TrustState::Revoked;

    let result = manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
        .await
        .unwrap();
    assert_eq!(result.created_sessions.len(), 2);
    assert_eq!(result.failed_devices.len(), 1);
    assert_eq!(
        result.failed_devices[0].error,
        E2eeError::DeviceRevoked(DeviceId::from("alice-laptop"))
    );

    let refused = manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-laptop"))
        .await;
    assert_eq!(refused, Err(E2eeError::DeviceRevoked(DeviceId::from("alice-laptop"))));
}

#[tokio::test]
async fn test_rotation_preserving_keys() {
    let manager = manager(PrimitiveSuite::classical_only());
    let conversation = ConversationId::from("team");
    let devices = classical_trio(&manager, &conversation).await;
    manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
        .await
        .unwrap();

    let pair = find_pair(&record(&manager, &conversation).await, "alice-phone", "bob-phone").clone();
    let engine = manager.engine();
    let in_flight = engine
        .encrypt(&pair.initiator_session(&conversation), b"sent before rotation")
        .await
        .unwrap();
    let late = engine
        .encrypt(&pair.initiator_session(&conversation), b"arrives after deactivation")
        .await
        .unwrap();

    let result = manager
        .rotate_conversation_keys(&conversation, KeyRetention::Preserve)
        .await
        .unwrap();
    assert_eq!(result.new_epoch, 1);
    assert_eq!(result.rotated_devices.len(), 3);
    assert!(result.failed_devices.is_empty());
    assert_eq!(record(&manager, &conversation).await.epoch, 1);

    let responder = pair.responder_session(&conversation);
    assert_eq!(engine.decrypt(&responder, &in_flight).await.unwrap(), b"sent before rotation");
    assert_eq!(relay(&manager, &conversation, &pair, b"new epoch").await, b"new epoch");

    assert!(manager.deactivate_old_keys(&DeviceId::from("bob-phone")).await.unwrap() > 0);
    assert_eq!(
        engine.decrypt(&responder, &late).await,
        Err(E2eeError::KeysDeactivated { epoch: 0 })
    );
}

#[tokio::test]
async fn test_rotation_discarding_keys() {
    let manager = manager(PrimitiveSuite::classical_only());
    let conversation = ConversationId::from("team");
    let devices = classical_trio(&manager, &conversation).await;
    manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
        .await
        .unwrap();

    let pair = find_pair(&record(&manager, &conversation).await, "alice-laptop", "bob-phone").clone();
    let in_flight = manager
        .engine()
        .encrypt(&pair.initiator_session(&conversation), b"stale")
        .await
        .unwrap();

    let result = manager
        .rotate_conversation_keys(&conversation, KeyRetention::Discard)
        .await
        .unwrap();
    assert_eq!(result.new_epoch, 1);

    assert_eq!(
        manager
            .engine()
            .decrypt(&pair.responder_session(&conversation), &in_flight)
            .await,
        Err(E2eeError::KeysDeactivated { epoch: 0 })
    );
    assert_eq!(relay(&manager, &conversation, &pair, b"fresh").await, b"fresh");

    let again = manager
        .rotate_conversation_keys(&conversation, KeyRetention::Discard)
        .await
        .unwrap();
    assert_eq!(again.new_epoch, 2);
}

#[tokio::test]
async fn test_rotation_without_setup_fails() {
    let manager = manager(PrimitiveSuite::classical_only());
    let result = manager
        .rotate_conversation_keys(&ConversationId::from("nowhere"), KeyRetention::Discard)
        .await;
    assert!(matches!(result, Err(E2eeError::KeyMaterialMissing(_))));
}

#[tokio::test]
async fn test_new_device_joins_without_disturbing_others() {
    let manager = manager(PrimitiveSuite::classical_only());
    let conversation = ConversationId::from("pair");
    let devices = vec![
        join(&manager, &conversation, "alice-phone", "alice", &["Curve25519"]).await,
        join(&manager, &conversation, "bob-phone", "bob", &["Curve25519"]).await,
    ];
    manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
        .await
        .unwrap();

    let existing = find_pair(&record(&manager, &conversation).await, "alice-phone", "bob-phone").clone();
    relay(&manager, &conversation, &existing, b"warm up").await;
    let before = manager
        .engine()
        .session_snapshot(&existing.initiator_session(&conversation))
        .await
        .unwrap();

    join(&manager, &conversation, "alice-tablet", "alice", &["Curve25519"]).await;
    let result = manager
        .share_keys_to_new_device(&"alice".into(), &DeviceId::from("alice-tablet"))
        .await
        .unwrap();
    assert_eq!(result.shared_conversations, vec![conversation.clone()]);
    assert!(result.failed_conversations.is_empty());

    let record = record(&manager, &conversation).await;
    assert_eq!(record.pairs.len(), 3);
    for peer in ["alice-phone", "bob-phone"] {
        let pair = find_pair(&record, "alice-tablet", peer);
        assert_eq!(relay(&manager, &conversation, pair, b"from the tablet").await, b"from the tablet");
    }

    let after = manager
        .engine()
        .session_snapshot(&existing.initiator_session(&conversation))
        .await
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_new_device_without_conversation_algorithm_is_reported() {
    let manager = manager(PrimitiveSuite::default());
    let conversation = ConversationId::from("pair");
    let devices = vec![
        join(&manager, &conversation, "alice-phone", "alice", &["Curve25519"]).await,
        join(&manager, &conversation, "bob-phone", "bob", &["Curve25519"]).await,
    ];
    manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
        .await
        .unwrap();

    join(&manager, &conversation, "alice-watch", "alice", &["ML-KEM-512"]).await;
    let result = manager
        .share_keys_to_new_device(&"alice".into(), &DeviceId::from("alice-watch"))
        .await
        .unwrap();
    assert!(result.shared_conversations.is_empty());
    assert_eq!(result.failed_conversations.len(), 1);
    assert_eq!(result.failed_conversations[0].error, E2eeError::NoCommonAlgorithm);
    assert_eq!(record(&manager, &conversation).await.pairs.len(), 1);
}

#[tokio::test]
async fn test_sharing_to_foreign_device_is_rejected() {
    let manager = manager(PrimitiveSuite::classical_only());
    let conversation = ConversationId::from("pair");
    join(&manager, &conversation, "bob-phone", "bob", &["Curve25519"]).await;

    let result = manager
        .share_keys_to_new_device(&"alice".into(), &DeviceId::from("bob-phone"))
        .await;
    assert!(matches!(result, Err(E2eeError::Crypto(_))));
}

#[tokio::test]
async fn test_remove_device_destroys_its_sessions() {
    let manager = manager(PrimitiveSuite::classical_only());
    let conversation = ConversationId::from("team");
    let devices = classical_trio(&manager, &conversation).await;
    manager
        .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
        .await
        .unwrap();
    let lost = find_pair(&record(&manager, &conversation).await, "alice-phone", "bob-phone").clone();

    let bob = DeviceId::from("bob-phone");
    let result = manager.remove_device(&bob).await.unwrap();
    assert_eq!(result.removed_sessions.len(), 4);

    let record = record(&manager, &conversation).await;
    assert_eq!(record.pairs.len(), 1);
    assert!(!record.devices().contains(&bob));
    assert!(!manager.engine().has_identity(&bob).await.unwrap());

    let stored = manager.registry().get_device(&bob).await.unwrap();
    assert!(stored.is_revoked());
    assert!(stored.revoked_at.is_some());

    let session = lost.initiator_session(&conversation);
    assert_eq!(
        manager.engine().encrypt(&session, b"gone").await,
        Err(E2eeError::SessionNotFound(session.clone()))
    );
    assert!(matches!(
        manager.share_keys_to_new_device(&"bob".into(), &bob).await,
        Err(E2eeError::DeviceRevoked(_))
    ));
}

#[cfg(feature = "post-quantum")]
mod post_quantum {
    use super::*;

    #[tokio::test]
    async fn test_group_negotiates_highest_common_level() {
        let manager = manager(PrimitiveSuite::default());
        let conversation = ConversationId::from("quantum");
        let devices = vec![
            join(&manager, &conversation, "alice-phone", "alice", &["ML-KEM-1024", "ML-KEM-768", "Curve25519"]).await,
            join(&manager, &conversation, "alice-laptop", "alice", &["ML-KEM-768", "Curve25519"]).await,
            join(&manager, &conversation, "bob-phone", "bob", &["ML-KEM-768", "ML-KEM-512", "Curve25519"]).await,
        ];

        let result = manager
            .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
            .await
            .unwrap();
        assert_eq!(result.negotiation.algorithm, AlgorithmId::MlKem768);
        assert!(!result.negotiation.quantum_fallback);
        assert_eq!(result.created_sessions.len(), 6);

        let record = record(&manager, &conversation).await;
        let pair = find_pair(&record, "alice-laptop", "bob-phone");
        assert_eq!(relay(&manager, &conversation, pair, b"post-quantum").await, b"post-quantum");

        let stored = manager.registry().get_device(&DeviceId::from("bob-phone")).await.unwrap();
        assert_eq!(stored.encryption_version, 3);

        let rotated = manager
            .rotate_conversation_keys(&conversation, KeyRetention::Discard)
            .await
            .unwrap();
        assert!(rotated.failed_devices.is_empty());
        assert_eq!(relay(&manager, &conversation, pair, b"epoch one").await, b"epoch one");
    }

    #[tokio::test]
    async fn test_group_without_classical_fallback_agrees_on_ml_kem_768() {
        let manager = manager(PrimitiveSuite::default());
        let conversation = ConversationId::from("quantum-only");
        let devices = vec![
            join(&manager, &conversation, "alice-phone", "alice", &["ML-KEM-1024", "ML-KEM-768"]).await,
            join(&manager, &conversation, "bob-phone", "bob", &["ML-KEM-768", "ML-KEM-512"]).await,
            join(&manager, &conversation, "carol-laptop", "carol", &["ML-KEM-768", "HYBRID"]).await,
        ];

        let result = manager
            .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("alice-phone"))
            .await
            .unwrap();
        assert_eq!(result.negotiation.algorithm, AlgorithmId::MlKem768);
        assert!(result.failed_devices.is_empty());
        assert_eq!(result.created_sessions.len(), 6);

        let record = record(&manager, &conversation).await;
        let pair = find_pair(&record, "bob-phone", "carol-laptop");
        assert_eq!(relay(&manager, &conversation, pair, b"no curve").await, b"no curve");
    }

    #[tokio::test]
    async fn test_migration_to_classical_against_quantum_only_peer() {
        let manager = manager(PrimitiveSuite::default());
        let conversation = ConversationId::from("strict");
        let devices = vec![
            join(&manager, &conversation, "phone", "alice", &["ML-KEM-768"]).await,
            join(&manager, &conversation, "tablet", "bob", &["ML-KEM-768", "Curve25519"]).await,
        ];
        manager
            .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("phone"))
            .await
            .unwrap();

        let result = manager
            .migrate_device(&DeviceId::from("tablet"), parse_capabilities(["Curve25519"]), true)
            .await
            .unwrap();
        assert!(result.migrated.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].peer, DeviceId::from("phone"));
        assert_eq!(result.failed[0].error, E2eeError::NoCommonAlgorithm);

        let stored = manager.registry().get_device(&DeviceId::from("tablet")).await.unwrap();
        assert_eq!(stored.capabilities, parse_capabilities(["ML-KEM-768", "Curve25519"]));
        assert_eq!(stored.encryption_version, 3);

        // No silent downgrade: the existing quantum sessions stay in place
        let record = record(&manager, &conversation).await;
        let pair = find_pair(&record, "phone", "tablet");
        let snapshot = manager
            .engine()
            .session_snapshot(&pair.responder_session(&conversation))
            .await
            .unwrap();
        assert_eq!(snapshot.algorithm, AlgorithmId::MlKem768);
        assert_eq!(snapshot.epoch, 0);
        assert_eq!(relay(&manager, &conversation, pair, b"still here").await, b"still here");
    }

    #[tokio::test]
    async fn test_upgrade_migration_preserves_in_flight_messages() {
        let manager = manager(PrimitiveSuite::default());
        let conversation = ConversationId::from("upgrade");
        let devices = vec![
            join(&manager, &conversation, "phone", "alice", &["ML-KEM-768", "Curve25519"]).await,
            join(&manager, &conversation, "laptop", "alice", &["Curve25519"]).await,
        ];
        let setup = manager
            .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("phone"))
            .await
            .unwrap();
        assert_eq!(setup.negotiation.algorithm, AlgorithmId::Curve25519);
        assert!(setup.negotiation.quantum_fallback);

        let pair = find_pair(&record(&manager, &conversation).await, "phone", "laptop").clone();
        let engine = manager.engine();
        let first = engine
            .encrypt(&pair.initiator_session(&conversation), b"classical 1")
            .await
            .unwrap();
        let second = engine
            .encrypt(&pair.initiator_session(&conversation), b"classical 2")
            .await
            .unwrap();

        let laptop = DeviceId::from("laptop");
        let result = manager
            .migrate_device(&laptop, parse_capabilities(["ML-KEM-768", "Curve25519"]), true)
            .await
            .unwrap();
        assert!(result.failed.is_empty());
        assert_eq!(result.migrated.len(), 1);
        assert_eq!(result.migrated[0].negotiation.algorithm, AlgorithmId::MlKem768);
        assert_eq!(result.migrated[0].epoch, 1);

        let stored = manager.registry().get_device(&laptop).await.unwrap();
        assert_eq!(stored.encryption_version, 3);
        assert!(stored.supports_quantum());

        let responder = pair.responder_session(&conversation);
        assert_eq!(engine.decrypt(&responder, &first).await.unwrap(), b"classical 1");
        assert_eq!(relay(&manager, &conversation, &pair, b"quantum").await, b"quantum");

        assert!(manager.deactivate_old_keys(&laptop).await.unwrap() > 0);
        assert_eq!(
            engine.decrypt(&responder, &second).await,
            Err(E2eeError::KeysDeactivated { epoch: 0 })
        );
    }

    #[tokio::test]
    async fn test_migration_without_preserving_keys() {
        let manager = manager(PrimitiveSuite::default());
        let conversation = ConversationId::from("upgrade");
        let devices = vec![
            join(&manager, &conversation, "phone", "alice", &["HYBRID", "Curve25519"]).await,
            join(&manager, &conversation, "laptop", "alice", &["Curve25519"]).await,
        ];
        manager
            .setup_conversation_encryption(&conversation, &devices, &DeviceId::from("phone"))
            .await
            .unwrap();

        let pair = find_pair(&record(&manager, &conversation).await, "phone", "laptop").clone();
        let in_flight = manager
            .engine()
            .encrypt(&pair.initiator_session(&conversation), b"lost")
            .await
            .unwrap();

        let result = manager
            .migrate_device(&DeviceId::from("laptop"), parse_capabilities(["HYBRID", "Curve25519"]), false)
            .await
            .unwrap();
        assert_eq!(result.migrated[0].negotiation.algorithm, AlgorithmId::HybridX25519MlKem768);

        assert_eq!(
            manager
                .engine()
                .decrypt(&pair.responder_session(&conversation), &in_flight)
                .await,
            Err(E2eeError::KeysDeactivated { epoch: 0 })
        );
        assert_eq!(relay(&manager, &conversation, &pair, b"hybrid").await, b"hybrid");
    }
}
