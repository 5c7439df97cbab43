//! # pulse-core
//!
//! Core abstractions for the Pulse instance-trigger control plane.
//!
//! This crate provides the foundational types and helpers used across all
//! Pulse components:
//!
//! - **Identifiers**: Strongly-typed IDs for instances and deliveries
//! - **Canonical JSON**: Key-sorted serialization for signature hashing
//! - **Request Verification**: Ed25519 detached-signature checks with
//!   timestamp freshness
//! - **Trigger Tokens**: Short-lived EdDSA JWTs minted per dispatch
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `pulse-core` is the only crate allowed to define shared primitives.
//! It has no knowledge of persistence, queues, or HTTP routing.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod encoding;
pub mod error;
pub mod id;
pub mod jwks;
pub mod observability;
pub mod signature;
pub mod token;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::canonical_json::{payload_hash, to_canonical_bytes, to_canonical_string};
    pub use crate::encoding::{decode_base64_flexible, encode_base64_url};
    pub use crate::error::{Error, Result};
    pub use crate::id::{DeliveryId, InstanceId};
    pub use crate::signature::{SignatureBlock, SignatureError, verify_signed_request};
    pub use crate::token::{MintedTriggerToken, PrivateKeyRing, TriggerTokenClaims};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{DeliveryId, InstanceId};
pub use observability::{LogFormat, init_logging};
pub use signature::{SignatureBlock, SignatureError};
pub use token::{MintedTriggerToken, PrivateKeyRing, TriggerTokenClaims};
