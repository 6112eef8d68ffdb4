use std::sync::{Mutex, PoisonError};

use sessiongate_core::navigation::{NavigationState, Navigator};

/// Navigator for the terminal: "navigating" prints where we went.
pub struct TerminalNavigator {
    current: Mutex<String>,
}

impl TerminalNavigator {
    pub fn new(start: &str) -> Self {
        Self {
            current: Mutex::new(start.to_string()),
        }
    }

    /// Set the current location without announcing it.
    pub fn visit(&self, path: &str) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = path.to_string();
    }
}

impl Navigator for TerminalNavigator {
    fn current_path(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn navigate(&self, path: &str, state: Option<NavigationState>) {
        self.visit(path);
        println!("-> {}", path);
        if let Some(message) = state.and_then(|s| s.message) {
            println!("   {}", message);
        }
    }
}
