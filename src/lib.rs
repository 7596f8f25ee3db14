//! KMS Service - policy-gated PKCS#11 key management
//!
//! This service gates key operations performed by a PKCS#11 hardware
//! security module behind a per-request authorization check. Key
//! creation, rotation, deletion, and AES encrypt/decrypt are exposed over
//! a REST API; every request runs against a session leased from a fixed
//! pool of authenticated HSM sessions and is evaluated against a stored,
//! default-deny policy document before the module is touched.
//!
//! Key features:
//! - Bounded pool of logged-in PKCS#11 sessions with scoped leases
//! - Default-deny policy evaluation per (key identifier, caller role)
//! - AES-256 key lifecycle with CBC-PAD encrypt/decrypt and fresh IVs

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod auth;
pub mod handlers;
pub mod pkcs11;
pub mod policy;
pub mod pool;
pub mod server;
pub mod store;

pub use pkcs11::HsmContext;
pub use policy::{Policy, Principal, Statement};
pub use pool::{Lease, Pool};
pub use store::{MemoryPolicyStore, PgPolicyStore, PolicyStore};
