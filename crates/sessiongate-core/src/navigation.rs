//! Navigation capability consumed by the gate and the sign-in flow.

use std::sync::{Mutex, PoisonError};

/// State handed to the destination of a navigation, mirroring what a
/// sign-in page needs to show and where it should send the user back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationState {
    pub from: String,
    pub message: Option<String>,
}

/// Something that knows the current location and can move elsewhere.
pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;
    fn navigate(&self, path: &str, state: Option<NavigationState>);
}

/// In-memory navigator that records every navigation it performs.
#[derive(Debug)]
pub struct MemoryNavigator {
    current: Mutex<String>,
    history: Mutex<Vec<(String, Option<NavigationState>)>>,
}

impl MemoryNavigator {
    pub fn new(start: &str) -> Self {
        Self {
            current: Mutex::new(start.to_string()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Move without recording, as if the user followed a link.
    pub fn visit(&self, path: &str) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = path.to_string();
    }

    /// Every navigation performed through [`Navigator::navigate`], oldest first.
    pub fn history(&self) -> Vec<(String, Option<NavigationState>)> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Navigator for MemoryNavigator {
    fn current_path(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn navigate(&self, path: &str, state: Option<NavigationState>) {
        self.visit(path);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((path.to_string(), state));
    }
}
