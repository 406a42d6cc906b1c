// Construct Messenger E2EE
// Multi-device end-to-end encryption engine: X3DH, Double Ratchet, ML-KEM negotiation

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod audit;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod ids;
pub mod manager;
pub mod registry;
pub mod storage;
pub mod utils;

// Re-exports для удобства
pub use audit::CompatibilityAuditor;
pub use config::Config;
pub use crypto::{AlgorithmId, CapabilitySet, Classification, NegotiationResult, PrimitiveSuite};
pub use engine::E2eeEngine;
pub use error::{E2eeError, Result};
pub use ids::{ConversationId, DeviceId, SessionId, UserId};
pub use manager::SessionManager;
pub use registry::{Device, DeviceRegistry, MemoryDeviceRegistry};
pub use storage::{KeyStore, MemoryKeyStore};
