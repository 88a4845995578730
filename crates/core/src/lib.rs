//! Domain types shared by the Calibra client, storage and mock backend.
//!
//! Nothing in this crate performs I/O: it holds the credential / lock / draft models,
//! the canonicalization rules behind autosave fingerprints, and the secret store contract.

pub mod calibration;
pub mod drafts;
pub mod errors;
pub mod locks;
pub mod secrets;
pub mod session;

pub use errors::{Error, Result};
