//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              engine / manager (multi-device layer)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┼─────────────┐
//!                ▼             ▼             ▼
//! ┌──────────────────┐ ┌──────────────┐ ┌──────────────────────┐
//! │   negotiation    │ │  handshake   │ │      messaging       │
//! │  - capability ∩  │ │  - X3DH      │ │  - Double Ratchet    │
//! │  - priority      │ │  - ML-KEM    │ │  - epochs / rotation │
//! └──────────────────┘ └──────────────┘ └──────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          PrimitiveSuite (CryptoProvider + KemProvider)      │
//! │  - X25519, Ed25519, ChaCha20-Poly1305, HKDF-SHA256          │
//! │  - ML-KEM-512 / 768 / 1024 (feature `post-quantum`)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Модули
//!
//! - [`algorithm`]: закрытый набор алгоритмов и их свойства
//! - [`negotiation`]: выбор общего алгоритма
//! - [`provider`]: traits для crypto-agility
//! - [`suites`]: реализации providers
//! - [`keys`]: identity / signed / one-time prekeys
//! - [`handshake`]: X3DH (classical, hybrid, quantum)
//! - [`messaging`]: Double Ratchet и формат конверта

pub mod algorithm;
pub mod negotiation;
pub mod provider;
pub mod suites;

pub mod handshake;
pub mod keys;
pub mod messaging;

pub use algorithm::{AlgorithmId, CapabilitySet, Classification, KemLevel};
pub use negotiation::NegotiationResult;
pub use provider::{CryptoProvider, KemProvider};
pub use suites::PrimitiveSuite;
