//! Client-side session handling: credential storage, transparent token
//! refresh, and sign-in gating for user actions.
//!
//! The pieces are wired together explicitly:
//!
//! - [`auth::CredentialStore`] owns the session and is shared by cloning
//! - [`api::RefreshCoordinator`] sends authenticated requests and renews
//!   the session on 401
//! - [`auth::SessionGate`] decides what a gated action does when signed out
//! - [`auth::ReturnIntentTracker`] and [`auth::SignInFlow`] bring the user
//!   back to where they were after sign-in

pub mod api;
pub mod auth;
pub mod config;
pub mod navigation;

pub use config::Config;
