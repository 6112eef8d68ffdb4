//! Session state and sign-in gating.
//!
//! This module provides:
//! - `CredentialStore`: the current session, persisted through a `SessionStorage`
//! - `ReturnIntentTracker`: where to send the user after sign-in
//! - `SessionGate`: the run / prompt / redirect / fallback decision for gated actions
//! - `SignInFlow`: completing sign-in and sign-out
//!
//! Sessions survive restarts through a file in the cache directory or the OS
//! keychain. Return intents live in memory only.

pub mod credentials;
pub mod error;
pub mod flow;
pub mod gate;
pub mod intent;
pub mod session;
pub mod storage;
pub mod store;

pub use credentials::KeyringStorage;
pub use error::AuthError;
pub use flow::SignInFlow;
pub use gate::{AuthPrompt, GateOutcome, Policy, PolicyMode, RouteDecision, SessionGate};
pub use intent::{ReturnIntent, ReturnIntentTracker};
pub use session::{Session, UserSnapshot};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
pub use store::{CredentialStore, Subscription};
