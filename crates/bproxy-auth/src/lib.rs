//! Account credentials for bproxy: on-disk storage, OAuth exchange and
//! refresh, the rotating credential pool, and the per-identity access
//! serializer.
//!
//! This crate owns all shared mutable state around upstream identities. The
//! exchange engine and the HTTP surface sit above it.

pub mod callback;
pub mod credential;
pub mod oauth;
pub mod pool;
pub mod serializer;
pub mod store;

pub use callback::{CallbackOutcome, CallbackRegistry, AUTH_WAIT_SECS};
pub use credential::{Credential, Profile, TokenSet};
pub use oauth::{generate_state, OAuthClient, OAuthConfig, OAuthError, TokenRefresher};
pub use pool::{AcquireError, CredentialPool};
pub use serializer::{AccessGuard, AccessSerializer};
pub use store::{CredentialStore, StoreError};
