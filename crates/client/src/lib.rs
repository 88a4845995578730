//! Calibra lab client.
//!
//! Talks to the lab API on behalf of a single user session:
//!
//! - [`ApiClient`]: authenticated request pipeline with single-flight token refresh
//! - [`RecordLock`]: advisory edit lock with heartbeat and best-effort release
//! - [`AutosaveController`]: debounced, fingerprint-deduplicated draft persistence

pub mod autosave;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod locks;
pub mod refresh;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use autosave::{AutosaveController, DraftEndpoints};
pub use client::{ApiClient, ApiClientBuilder};
pub use config::ClientConfig;
pub use credentials::CredentialStore;
pub use error::{ApiRetryClass, ClientError, Result};
pub use locks::RecordLock;
pub use refresh::{RefreshFailure, RefreshGate, RefreshTicket};
pub use session::{LoginSurface, NoopLoginSurface};
pub use transport::{ApiRequest, ApiResponse, Delivery, HttpTransport, Method, Transport};
