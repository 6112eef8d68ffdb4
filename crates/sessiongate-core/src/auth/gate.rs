//! Sign-in gating for user actions and protected routes.
//!
//! Callers invoke [`SessionGate::authorize`] from their own event handlers.
//! The gate checks the credential store once, then either runs the action or
//! takes exactly one of the unauthenticated branches named by the [`Policy`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use super::{AuthError, CredentialStore, ReturnIntentTracker};
use crate::navigation::{NavigationState, Navigator};

/// Default sign-in entry point
pub const DEFAULT_SIGN_IN_PATH: &str = "/login";

/// What to do when an action needs a session and there is none.
pub enum Policy<'a> {
    /// Ask the caller to show an inline sign-in prompt.
    Prompt,
    /// Remember the current location and hand off to the sign-in page.
    Redirect,
    /// Run the given function instead of the action.
    Fallback(Box<dyn FnOnce() + 'a>),
}

impl<'a> Policy<'a> {
    pub fn fallback(f: impl FnOnce() + 'a) -> Self {
        Policy::Fallback(Box::new(f))
    }

    pub fn mode(&self) -> PolicyMode {
        match self {
            Policy::Prompt => PolicyMode::Prompt,
            Policy::Redirect => PolicyMode::Redirect,
            Policy::Fallback(_) => PolicyMode::Fallback,
        }
    }
}

impl fmt::Debug for Policy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Policy::{}", self.mode())
    }
}

/// Policy names, for policies chosen by configuration rather than code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    Prompt,
    Redirect,
    Fallback,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyMode::Prompt => write!(f, "prompt"),
            PolicyMode::Redirect => write!(f, "redirect"),
            PolicyMode::Fallback => write!(f, "fallback"),
        }
    }
}

impl FromStr for PolicyMode {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(PolicyMode::Prompt),
            "redirect" => Ok(PolicyMode::Redirect),
            "fallback" => Ok(PolicyMode::Fallback),
            other => Err(AuthError::Validation(format!("unknown policy mode: {:?}", other))),
        }
    }
}

/// Everything an inline sign-in prompt needs to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrompt {
    pub intent: String,
    pub title: String,
    pub message: String,
    /// Where the prompt was raised, for the sign-in link's return path
    pub from: String,
}

/// Which branch [`SessionGate::authorize`] took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Authenticated; the action ran.
    Proceeded,
    /// The caller should show this prompt. The action was not queued.
    Prompt(AuthPrompt),
    /// Intent captured and navigation handed to the sign-in page.
    Redirected { to: String },
    /// The fallback ran.
    FellBack,
}

/// Result of guarding a protected route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    Redirect { to: String },
}

/// The message shown on the sign-in page for a gated action.
pub fn sign_in_message(intent: &str) -> String {
    format!("Please sign in to {}.", intent.to_lowercase())
}

pub struct SessionGate {
    store: CredentialStore,
    intents: ReturnIntentTracker,
    navigator: Arc<dyn Navigator>,
    sign_in_path: String,
}

impl SessionGate {
    pub fn new(
        store: CredentialStore,
        intents: ReturnIntentTracker,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            store,
            intents,
            navigator,
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
        }
    }

    pub fn with_sign_in_path(mut self, path: &str) -> Self {
        self.sign_in_path = path.to_string();
        self
    }

    pub fn sign_in_path(&self) -> &str {
        &self.sign_in_path
    }

    /// Run `action` if signed in, otherwise apply `policy`.
    ///
    /// Exactly one of the action, the prompt, the redirect or the fallback
    /// happens per call. The authentication check is a single synchronous
    /// read and is not repeated while dispatching.
    ///
    /// # Errors
    ///
    /// [`AuthError::Validation`] when `intent` is blank. Nothing runs in that
    /// case, authenticated or not.
    pub fn authorize<F>(
        &self,
        intent: &str,
        action: F,
        policy: Policy<'_>,
    ) -> Result<GateOutcome, AuthError>
    where
        F: FnOnce(),
    {
        if intent.trim().is_empty() {
            return Err(AuthError::Validation(
                "intent description must not be empty".to_string(),
            ));
        }

        if self.store.is_authenticated() {
            action();
            return Ok(GateOutcome::Proceeded);
        }

        debug!(intent, mode = %policy.mode(), "Sign-in required");
        let outcome = match policy {
            Policy::Prompt => GateOutcome::Prompt(AuthPrompt {
                intent: intent.to_string(),
                title: format!("Sign in to {}", intent),
                message: sign_in_message(intent),
                from: self.navigator.current_path(),
            }),
            Policy::Redirect => {
                let from = self.navigator.current_path();
                let message = sign_in_message(intent);
                self.intents.capture(&from, Some(message.clone()));
                self.navigator.navigate(
                    &self.sign_in_path,
                    Some(NavigationState {
                        from,
                        message: Some(message),
                    }),
                );
                GateOutcome::Redirected {
                    to: self.sign_in_path.clone(),
                }
            }
            Policy::Fallback(fallback) => {
                fallback();
                GateOutcome::FellBack
            }
        };
        Ok(outcome)
    }

    /// Guard a protected route: allow it, or remember it and send the user
    /// to sign in.
    pub fn guard_route(&self, path: &str) -> RouteDecision {
        if self.store.is_authenticated() {
            return RouteDecision::Allow;
        }

        debug!(path, "Protected route requires sign-in");
        self.intents.capture(path, None);
        self.navigator.navigate(
            &self.sign_in_path,
            Some(NavigationState {
                from: path.to_string(),
                message: None,
            }),
        );
        RouteDecision::Redirect {
            to: self.sign_in_path.clone(),
        }
    }
}
