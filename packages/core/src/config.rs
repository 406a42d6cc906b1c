//! Engine configuration.
//!
//! All protocol limits and policy knobs live here so nothing is hard-coded in
//! the protocol modules. A `Config` is built once by the embedding process and
//! handed to [`crate::engine::E2eeEngine::new`]; there is no global instance.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // CRYPTOGRAPHIC PARAMETERS
    // ============================================

    /// Symmetric key length (root, chain and message keys), bytes
    pub key_length: usize,

    /// ChaCha20Poly1305 nonce length, bytes
    pub chacha_nonce_length: usize,

    /// Largest plaintext accepted by `encrypt`, bytes
    pub max_payload_size: usize,

    // ============================================
    // DOUBLE RATCHET PARAMETERS
    // ============================================

    /// Skip window per receiving chain (DoS protection)
    pub max_skipped_messages: u32,

    /// Maximum age of cached skipped message keys, seconds.
    /// Default: 7 days
    pub max_skipped_message_age_seconds: i64,

    /// How many superseded remote ratchet keys are remembered so that late
    /// replays on old chains are reported as `AlreadyDecrypted`
    pub previous_chain_memory: usize,

    /// How long to wait for a session's exclusive lock before `SessionBusy`
    pub session_lock_timeout: Duration,

    /// Lifetime of retired (pre-rotation) receiving keys.
    /// `None`: retired keys stay until `deactivate_old_keys` is called.
    pub retired_key_grace: Option<Duration>,

    // ============================================
    // PREKEY PARAMETERS
    // ============================================

    /// A signed prekey older than this is no longer put into bundles and is
    /// rejected by initiators. Default: 30 days
    pub signed_prekey_max_age_seconds: i64,

    /// How long a superseded signed prekey remains usable for in-flight
    /// handshakes. Default: 7 days
    pub signed_prekey_retention_seconds: i64,

    /// Size of a one-time prekey batch created by `provision_device`
    pub one_time_prekey_batch: u32,

    /// How long an issued one-time prekey waits for its handshake before the
    /// private half is dropped. Default: 7 days
    pub one_time_prekey_retention_seconds: i64,

    // ============================================
    // AUDIT PARAMETERS
    // ============================================

    /// Capability declarations older than this are flagged
    /// `verification_needed`. Default: 30 days
    pub capability_reverification_seconds: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_length: 32,
            chacha_nonce_length: 12,
            max_payload_size: 64 * 1024,

            max_skipped_messages: 500,
            max_skipped_message_age_seconds: 7 * 24 * 60 * 60, // 7 days
            previous_chain_memory: 32,
            session_lock_timeout: Duration::from_secs(2),
            retired_key_grace: None,

            signed_prekey_max_age_seconds: 30 * 24 * 60 * 60, // 30 days
            signed_prekey_retention_seconds: 7 * 24 * 60 * 60, // 7 days
            one_time_prekey_batch: 100,
            one_time_prekey_retention_seconds: 7 * 24 * 60 * 60, // 7 days

            capability_reverification_seconds: 30 * 24 * 60 * 60, // 30 days
        }
    }
}

impl Config {
    /// Default configuration with overrides from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(parsed) = lookup("MAX_SKIPPED_MESSAGES").and_then(|v| v.parse().ok()) {
            config.max_skipped_messages = parsed;
        }

        if let Some(parsed) = lookup("MAX_SKIPPED_MESSAGE_AGE_SECONDS").and_then(|v| v.parse().ok()) {
            config.max_skipped_message_age_seconds = parsed;
        }

        if let Some(parsed) = lookup("SESSION_LOCK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.session_lock_timeout = Duration::from_millis(parsed);
        }

        if let Some(parsed) = lookup("SIGNED_PREKEY_MAX_AGE_SECONDS").and_then(|v| v.parse().ok()) {
            config.signed_prekey_max_age_seconds = parsed;
        }

        if let Some(parsed) = lookup("ONE_TIME_PREKEY_RETENTION_SECONDS").and_then(|v| v.parse().ok()) {
            config.one_time_prekey_retention_seconds = parsed;
        }

        if let Some(parsed) = lookup("CAPABILITY_REVERIFICATION_SECONDS").and_then(|v| v.parse().ok()) {
            config.capability_reverification_seconds = parsed;
        }

        if let Some(parsed) = lookup("RETIRED_KEY_GRACE_SECONDS").and_then(|v| v.parse().ok()) {
            config.retired_key_grace = Some(Duration::from_secs(parsed));
        }

        config
    }

    /// Cap on the whole skipped-key cache of one session
    pub fn skipped_cache_capacity(&self) -> usize {
        self.max_skipped_messages as usize * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_skipped_messages, 500);
        assert_eq!(config.key_length, 32);
        assert_eq!(config.chacha_nonce_length, 12);
        assert!(config.retired_key_grace.is_none());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MAX_SKIPPED_MESSAGES", "64"),
            ("SESSION_LOCK_TIMEOUT_MS", "250"),
            ("RETIRED_KEY_GRACE_SECONDS", "3600"),
            ("SIGNED_PREKEY_MAX_AGE_SECONDS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.max_skipped_messages, 64);
        assert_eq!(config.session_lock_timeout, Duration::from_millis(250));
        assert_eq!(config.retired_key_grace, Some(Duration::from_secs(3600)));
        // Unparseable values keep the default
        assert_eq!(
            config.signed_prekey_max_age_seconds,
            Config::default().signed_prekey_max_age_seconds
        );
    }
}
