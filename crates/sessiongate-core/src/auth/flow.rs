use std::sync::Arc;

use tracing::info;

use super::{CredentialStore, ReturnIntentTracker, Session};
use crate::navigation::Navigator;

/// Default landing path after sign-in when no intent was captured
pub const DEFAULT_LANDING_PATH: &str = "/";

/// Finishes a sign-in (or sign-out) and sends the user where they belong.
pub struct SignInFlow {
    store: CredentialStore,
    intents: ReturnIntentTracker,
    navigator: Arc<dyn Navigator>,
    landing_path: String,
}

impl SignInFlow {
    pub fn new(
        store: CredentialStore,
        intents: ReturnIntentTracker,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            store,
            intents,
            navigator,
            landing_path: DEFAULT_LANDING_PATH.to_string(),
        }
    }

    pub fn with_landing_path(mut self, path: &str) -> Self {
        self.landing_path = path.to_string();
        self
    }

    /// Store the new session and resume the captured intent, if any.
    ///
    /// Returns the path navigated to.
    pub fn complete(&self, session: Session) -> String {
        let user = session.user().map(|u| u.display_name.clone());
        self.store.set_session(session);

        let path = match self.intents.consume() {
            Some(intent) => intent.path,
            None => self.landing_path.clone(),
        };
        info!(user = ?user, path = %path, "Sign-in complete");
        self.navigator.navigate(&path, None);
        path
    }

    /// Drop the session and any pending return intent, then go to the
    /// landing path.
    pub fn sign_out(&self) {
        self.store.clear();
        let _ = self.intents.consume();
        info!("Signed out");
        self.navigator.navigate(&self.landing_path, None);
    }
}
