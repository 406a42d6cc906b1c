//! X3DH (Extended Triple Diffie-Hellman) with KEM extensions
//!
//! Реализация протокола установки ключей из Signal Protocol, расширенная
//! ML-KEM инкапсуляциями для hybrid и quantum алгоритмов.
//!
//! ## Ключи
//!
//! ### Инициатор
//! - **IK_A**: Identity Key (долгосрочный)
//! - **EK_A**: Ephemeral Key (одноразовый, для каждой сессии)
//!
//! ### Получатель
//! - **IK_B**, **IK_B_kem**: Identity Keys
//! - **SPK_B**, **SPK_B_kem**: Signed Prekeys (подписаны Ed25519 ключом B)
//! - **OPK_B**: One-Time Prekey (опционально)
//!
//! ## Входной материал по классификации
//!
//! ```text
//! classical: DH(IK_A, SPK_B) || DH(EK_A, IK_B) || DH(EK_A, SPK_B) [|| DH(EK_A, OPK_B)]
//! hybrid:    <classical>     || KEM(SPK_B_kem) || KEM(IK_B_kem)
//! quantum:   KEM(IK_B_kem)   || KEM(SPK_B_kem) [|| DH(EK_A, OPK_B)]
//!
//! SK = HKDF-SHA256(salt = 0^32, ikm, info = "X3DH Root Key" || algorithm)
//! ```
//!
//! Без OPK handshake продолжается с пониженной forward secrecy: это не
//! ошибка, а отдельный путь, отражённый в [`ForwardSecrecy::Reduced`].

use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::crypto::algorithm::{AlgorithmId, CapabilitySet, Classification, KemLevel};
use crate::crypto::handshake::{
    ForwardSecrecy, HandshakeMessage, KemPreKeyPublic, PreKeyBundle, RatchetSeed, Role,
    SharedSecretMaterial,
};
use crate::crypto::keys::{EphemeralKey, IdentityKey, OneTimePreKey, SignedPreKey};
use crate::crypto::negotiation::{negotiate_supported, NegotiationResult};
use crate::crypto::provider::SecretBytes;
use crate::crypto::suites::PrimitiveSuite;
use crate::error::{E2eeError, Result};
use crate::utils::time::is_older_than;

const ROOT_KEY_INFO: &[u8] = b"X3DH Root Key";
const QUANTUM_SECRET_INFO: &[u8] = b"X3DH Quantum Secret";
const ROOT_KEY_SALT: [u8; 32] = [0u8; 32];

/// Stateless protocol object; all key material is passed per call.
pub struct X3DHProtocol<'a> {
    suite: &'a PrimitiveSuite,
    config: &'a Config,
}

/// KEM public keys an initiator needs for a hybrid or quantum agreement
struct InitiatorKemKeys<'b> {
    level: KemLevel,
    remote_identity: &'b KemPreKeyPublic,
    remote_signed_prekey: &'b KemPreKeyPublic,
    local_identity: Vec<u8>,
}

impl InitiatorKemKeys<'_> {
    fn require<'c>(keys: &'c Option<Self>) -> Result<&'c Self> {
        keys.as_ref()
            .ok_or_else(|| E2eeError::KeyMaterialMissing("KEM keys for negotiated algorithm".to_string()))
    }
}

/// Secret inputs gathered from one side of the agreement
#[derive(Default)]
struct SecretInput {
    ikm: Zeroizing<Vec<u8>>,
    kem: Zeroizing<Vec<u8>>,
}

impl SecretInput {
    fn push_dh(&mut self, secret: SecretBytes) {
        self.ikm.extend_from_slice(&secret);
    }

    fn push_kem(&mut self, secret: SecretBytes) {
        self.ikm.extend_from_slice(&secret);
        self.kem.extend_from_slice(&secret);
    }
}

impl<'a> X3DHProtocol<'a> {
    pub fn new(suite: &'a PrimitiveSuite, config: &'a Config) -> Self {
        Self { suite, config }
    }

    /// Checks every signature in the bundle and the signed prekey's age.
    pub fn verify_bundle(&self, bundle: &PreKeyBundle, now: i64) -> Result<()> {
        self.suite
            .classic
            .verify(
                &bundle.signing_key,
                &bundle.signed_prekey.public_key,
                &bundle.signed_prekey.signature,
            )
            .map_err(|e| {
                debug!(target: "crypto::x3dh", device_id = %bundle.device_id, error = %e, "Signed prekey signature rejected");
                E2eeError::InvalidBundle(format!(
                    "signed prekey {} of device {}: {}",
                    bundle.signed_prekey.id, bundle.device_id, e
                ))
            })?;

        for kem_key in bundle
            .quantum_identity_keys
            .iter()
            .chain(bundle.quantum_signed_prekeys.iter())
        {
            self.suite
                .classic
                .verify(&bundle.signing_key, &kem_key.public_key, &kem_key.signature)
                .map_err(|e| {
                    E2eeError::InvalidBundle(format!(
                        "{} key of device {}: {}",
                        kem_key.level, bundle.device_id, e
                    ))
                })?;
        }

        if is_older_than(
            bundle.signed_prekey.created_at,
            now,
            self.config.signed_prekey_max_age_seconds,
        ) {
            return Err(E2eeError::InvalidBundle(format!(
                "signed prekey {} of device {} is stale",
                bundle.signed_prekey.id, bundle.device_id
            )));
        }

        trace!(target: "crypto::x3dh", device_id = %bundle.device_id, "Bundle signatures verified");
        Ok(())
    }

    /// Uses the bundle's conversation-wide result when present, otherwise
    /// negotiates pairwise.
    pub fn select_algorithm(
        &self,
        local_capabilities: &CapabilitySet,
        bundle: &PreKeyBundle,
    ) -> Result<NegotiationResult> {
        let supported = self.suite.supported_algorithms();
        match bundle.negotiated {
            Some(negotiated) => {
                let algorithm = negotiated.algorithm;
                if !supported.contains(&algorithm) {
                    return Err(E2eeError::UnsupportedAlgorithm(algorithm));
                }
                if !local_capabilities.contains(&algorithm) || !bundle.capabilities.contains(&algorithm) {
                    return Err(E2eeError::InvalidBundle(format!(
                        "negotiated algorithm {} is not declared by both devices",
                        algorithm
                    )));
                }
                Ok(negotiated)
            }
            None => negotiate_supported([local_capabilities, &bundle.capabilities], &supported),
        }
    }

    pub fn perform_as_initiator(
        &self,
        identity: &IdentityKey,
        ephemeral: EphemeralKey,
        bundle: &PreKeyBundle,
        now: i64,
    ) -> Result<SharedSecretMaterial> {
        debug!(
            target: "crypto::x3dh",
            local = %identity.device_id,
            remote = %bundle.device_id,
            "Starting X3DH as initiator"
        );

        self.verify_bundle(bundle, now)?;
        let negotiation = self.select_algorithm(&identity.capabilities, bundle)?;
        let algorithm = negotiation.algorithm;

        let kem_keys = match algorithm.kem_level() {
            Some(level) => Some(self.initiator_kem_keys(identity, bundle, level)?),
            None => None,
        };

        let mut input = SecretInput::default();
        let mut identity_ciphertext = None;
        let mut signed_prekey_ciphertext = None;
        let opk = bundle.one_time_prekey.as_ref();

        match negotiation.classification {
            Classification::Classical => {
                self.push_classical_initiator(&mut input, identity, &ephemeral, bundle)?;
            }
            Classification::Hybrid => {
                let kem = InitiatorKemKeys::require(&kem_keys)?;
                self.push_classical_initiator(&mut input, identity, &ephemeral, bundle)?;
                let (ct, ss) = self.suite.kem.encapsulate(kem.level, &kem.remote_signed_prekey.public_key)?;
                input.push_kem(ss);
                signed_prekey_ciphertext = Some(ct);
                let (ct, ss) = self.suite.kem.encapsulate(kem.level, &kem.remote_identity.public_key)?;
                input.push_kem(ss);
                identity_ciphertext = Some(ct);
            }
            Classification::Quantum => {
                let kem = InitiatorKemKeys::require(&kem_keys)?;
                let (ct, ss) = self.suite.kem.encapsulate(kem.level, &kem.remote_identity.public_key)?;
                input.push_kem(ss);
                identity_ciphertext = Some(ct);
                let (ct, ss) = self.suite.kem.encapsulate(kem.level, &kem.remote_signed_prekey.public_key)?;
                input.push_kem(ss);
                signed_prekey_ciphertext = Some(ct);
                if let Some(opk) = opk {
                    input.push_dh(self.suite.classic.dh(&ephemeral.private_key, &opk.public_key)?);
                }
            }
        }

        let (root_key, quantum_secret) = self.finish(&input, algorithm)?;
        let forward_secrecy = if opk.is_some() {
            ForwardSecrecy::Full
        } else {
            warn!(
                target: "crypto::x3dh",
                remote = %bundle.device_id,
                algorithm = %algorithm,
                "No one-time prekey in bundle, agreement has reduced forward secrecy"
            );
            ForwardSecrecy::Reduced
        };

        let handshake = HandshakeMessage {
            initiator_device: identity.device_id.clone(),
            responder_device: bundle.device_id.clone(),
            negotiation,
            initiator_identity_key: identity.dh_public.clone(),
            initiator_kem_identity_key: kem_keys.as_ref().map(|kem| kem.local_identity.clone()),
            ephemeral_key: ephemeral.public_key.clone(),
            signed_prekey_id: bundle.signed_prekey.id,
            one_time_prekey_id: opk.map(|k| k.id),
            identity_ciphertext,
            signed_prekey_ciphertext,
            epoch: 0,
        };

        debug!(
            target: "crypto::x3dh",
            algorithm = %algorithm,
            signed_prekey_id = bundle.signed_prekey.id,
            one_time_prekey_id = ?handshake.one_time_prekey_id,
            "X3DH initiator agreement complete"
        );

        Ok(SharedSecretMaterial {
            role: Role::Initiator,
            local_device: identity.device_id.clone(),
            remote_device: bundle.device_id.clone(),
            root_key,
            quantum_secret,
            negotiation,
            one_time_prekey_used: opk.is_some(),
            forward_secrecy,
            remote_identity_key: bundle.identity_key.clone(),
            remote_kem_identity_key: kem_keys.map(|kem| kem.remote_identity.public_key.clone()),
            handshake: Some(handshake),
            epoch: 0,
            seed: RatchetSeed::Initiator {
                ephemeral_private: ephemeral.private_key,
                ephemeral_public: ephemeral.public_key,
            },
        })
    }

    /// Mirrors [`Self::perform_as_initiator`] with the responder's private keys.
    /// The caller has already looked up (and consumed) the prekeys the handshake names.
    pub fn perform_as_responder(
        &self,
        identity: &IdentityKey,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
        handshake: &HandshakeMessage,
    ) -> Result<SharedSecretMaterial> {
        let negotiation = handshake.negotiation;
        let algorithm = negotiation.algorithm;

        debug!(
            target: "crypto::x3dh",
            local = %identity.device_id,
            remote = %handshake.initiator_device,
            algorithm = %algorithm,
            "Starting X3DH as responder"
        );

        if !self.suite.supports(algorithm) {
            return Err(E2eeError::UnsupportedAlgorithm(algorithm));
        }
        if !identity.capabilities.contains(&algorithm) {
            return Err(E2eeError::InvalidEnvelope(format!(
                "handshake uses {} which device {} never declared",
                algorithm, identity.device_id
            )));
        }
        if signed_prekey.id != handshake.signed_prekey_id {
            return Err(E2eeError::KeyMaterialMissing(format!(
                "signed prekey {} of device {}",
                handshake.signed_prekey_id, identity.device_id
            )));
        }
        if one_time_prekey.map(|k| k.id) != handshake.one_time_prekey_id {
            return Err(E2eeError::BundleExhausted(format!(
                "one-time prekey {:?} of device {}",
                handshake.one_time_prekey_id, identity.device_id
            )));
        }

        let mut input = SecretInput::default();
        match negotiation.classification {
            Classification::Classical => {
                self.push_classical_responder(&mut input, identity, signed_prekey, one_time_prekey, handshake)?;
            }
            Classification::Hybrid => {
                let level = kem_level(algorithm)?;
                self.push_classical_responder(&mut input, identity, signed_prekey, one_time_prekey, handshake)?;
                input.push_kem(self.decapsulate_signed_prekey(level, signed_prekey, handshake)?);
                input.push_kem(self.decapsulate_identity(level, identity, handshake)?);
            }
            Classification::Quantum => {
                let level = kem_level(algorithm)?;
                input.push_kem(self.decapsulate_identity(level, identity, handshake)?);
                input.push_kem(self.decapsulate_signed_prekey(level, signed_prekey, handshake)?);
                if let Some(opk) = one_time_prekey {
                    input.push_dh(self.suite.classic.dh(&opk.private_key, &handshake.ephemeral_key)?);
                }
            }
        }

        if algorithm.kem_level().is_some() && handshake.initiator_kem_identity_key.is_none() {
            return Err(E2eeError::InvalidEnvelope(
                "handshake lacks the initiator KEM identity key".to_string(),
            ));
        }

        let (root_key, quantum_secret) = self.finish(&input, algorithm)?;
        let forward_secrecy = if one_time_prekey.is_some() {
            ForwardSecrecy::Full
        } else {
            ForwardSecrecy::Reduced
        };

        debug!(
            target: "crypto::x3dh",
            algorithm = %algorithm,
            forward_secrecy = ?forward_secrecy,
            "X3DH responder agreement complete"
        );

        Ok(SharedSecretMaterial {
            role: Role::Responder,
            local_device: identity.device_id.clone(),
            remote_device: handshake.initiator_device.clone(),
            root_key,
            quantum_secret,
            negotiation,
            one_time_prekey_used: one_time_prekey.is_some(),
            forward_secrecy,
            remote_identity_key: handshake.initiator_identity_key.clone(),
            remote_kem_identity_key: handshake.initiator_kem_identity_key.clone(),
            handshake: None,
            epoch: handshake.epoch,
            seed: RatchetSeed::Responder {
                remote_ephemeral: handshake.ephemeral_key.clone(),
            },
        })
    }

    fn initiator_kem_keys<'b>(
        &self,
        identity: &IdentityKey,
        bundle: &'b PreKeyBundle,
        level: KemLevel,
    ) -> Result<InitiatorKemKeys<'b>> {
        let remote_ik = bundle.quantum_identity_key(level).ok_or_else(|| {
            E2eeError::BundleExhausted(format!("{} identity key of device {}", level, bundle.device_id))
        })?;
        let remote_spk = bundle.quantum_signed_prekey(level).ok_or_else(|| {
            E2eeError::BundleExhausted(format!("{} signed prekey of device {}", level, bundle.device_id))
        })?;
        let local = identity.kem_key(level).ok_or_else(|| {
            E2eeError::KeyMaterialMissing(format!("{} identity key of device {}", level, identity.device_id))
        })?;
        Ok(InitiatorKemKeys {
            level,
            remote_identity: remote_ik,
            remote_signed_prekey: remote_spk,
            local_identity: local.public_key.clone(),
        })
    }

    fn push_classical_initiator(
        &self,
        input: &mut SecretInput,
        identity: &IdentityKey,
        ephemeral: &EphemeralKey,
        bundle: &PreKeyBundle,
    ) -> Result<()> {
        let spk = &bundle.signed_prekey.public_key;
        input.push_dh(self.suite.classic.dh(&identity.dh_private, spk)?);
        input.push_dh(self.suite.classic.dh(&ephemeral.private_key, &bundle.identity_key)?);
        input.push_dh(self.suite.classic.dh(&ephemeral.private_key, spk)?);
        if let Some(opk) = &bundle.one_time_prekey {
            input.push_dh(self.suite.classic.dh(&ephemeral.private_key, &opk.public_key)?);
        }
        Ok(())
    }

    fn push_classical_responder(
        &self,
        input: &mut SecretInput,
        identity: &IdentityKey,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
        handshake: &HandshakeMessage,
    ) -> Result<()> {
        let ek = &handshake.ephemeral_key;
        input.push_dh(
            self.suite
                .classic
                .dh(&signed_prekey.private_key, &handshake.initiator_identity_key)?,
        );
        input.push_dh(self.suite.classic.dh(&identity.dh_private, ek)?);
        input.push_dh(self.suite.classic.dh(&signed_prekey.private_key, ek)?);
        if let Some(opk) = one_time_prekey {
            input.push_dh(self.suite.classic.dh(&opk.private_key, ek)?);
        }
        Ok(())
    }

    fn decapsulate_identity(
        &self,
        level: KemLevel,
        identity: &IdentityKey,
        handshake: &HandshakeMessage,
    ) -> Result<SecretBytes> {
        let key = identity.kem_key(level).ok_or_else(|| {
            E2eeError::KeyMaterialMissing(format!("{} identity key of device {}", level, identity.device_id))
        })?;
        let ciphertext = handshake.identity_ciphertext.as_deref().ok_or_else(|| {
            E2eeError::InvalidEnvelope("handshake lacks the identity KEM ciphertext".to_string())
        })?;
        Ok(self.suite.kem.decapsulate(level, &key.private_key, ciphertext)?)
    }

    fn decapsulate_signed_prekey(
        &self,
        level: KemLevel,
        signed_prekey: &SignedPreKey,
        handshake: &HandshakeMessage,
    ) -> Result<SecretBytes> {
        let key = signed_prekey.kem_prekey(level).ok_or_else(|| {
            E2eeError::KeyMaterialMissing(format!("{} signed prekey {}", level, signed_prekey.id))
        })?;
        let ciphertext = handshake.signed_prekey_ciphertext.as_deref().ok_or_else(|| {
            E2eeError::InvalidEnvelope("handshake lacks the signed prekey KEM ciphertext".to_string())
        })?;
        Ok(self.suite.kem.decapsulate(level, &key.private_key, ciphertext)?)
    }

    fn finish(&self, input: &SecretInput, algorithm: AlgorithmId) -> Result<(SecretBytes, Option<SecretBytes>)> {
        let root_key = self.suite.classic.hkdf_derive_key(
            &ROOT_KEY_SALT,
            &input.ikm,
            &info(ROOT_KEY_INFO, algorithm),
            self.config.key_length,
        )?;

        let quantum_secret = if input.kem.is_empty() {
            None
        } else {
            Some(self.suite.classic.hkdf_derive_key(
                &ROOT_KEY_SALT,
                &input.kem,
                &info(QUANTUM_SECRET_INFO, algorithm),
                self.config.key_length,
            )?)
        };

        Ok((root_key, quantum_secret))
    }
}

fn kem_level(algorithm: AlgorithmId) -> Result<KemLevel> {
    algorithm
        .kem_level()
        .ok_or(E2eeError::UnsupportedAlgorithm(algorithm))
}

fn info(label: &[u8], algorithm: AlgorithmId) -> Vec<u8> {
    let mut info = label.to_vec();
    info.extend_from_slice(algorithm.as_str().as_bytes());
    info
}
