//! Core types shared across all coapt crates.
//!
//! Defines the run configuration consumed by the harness, the immutable
//! [`ProtocolProfile`] that distinguishes plain from secured transport, the
//! DTLS credentials loader, and the shared error type.

pub mod config;
pub mod credentials;
pub mod error;
pub mod profile;

pub use config::{RunConfig, DEFAULT_BOARD};
pub use credentials::DtlsCredentials;
pub use error::CoaptError;
pub use profile::{ProtocolProfile, Transport, SECURED_SETUP_MESSAGES};
