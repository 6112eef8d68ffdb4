use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Where the user was headed when sign-in got in the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnIntent {
    pub path: String,
    pub message: Option<String>,
}

/// Remembers a single return intent across one sign-in round trip.
///
/// In memory only. At most one intent is live; a new capture replaces it.
#[derive(Debug, Clone, Default)]
pub struct ReturnIntentTracker {
    slot: Arc<Mutex<Option<ReturnIntent>>>,
}

impl ReturnIntentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&self, path: &str, message: Option<String>) {
        debug!(path, "Return intent captured");
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(ReturnIntent {
            path: path.to_string(),
            message,
        });
    }

    /// Take the captured intent, leaving nothing behind.
    pub fn consume(&self) -> Option<ReturnIntent> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Look at the captured intent without consuming it (for rendering a
    /// sign-in page message).
    pub fn peek(&self) -> Option<ReturnIntent> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_is_one_shot() {
        let tracker = ReturnIntentTracker::new();
        tracker.capture("/cart", Some("Please sign in to view cart.".to_string()));

        assert_eq!(
            tracker.consume(),
            Some(ReturnIntent {
                path: "/cart".to_string(),
                message: Some("Please sign in to view cart.".to_string()),
            })
        );
        assert_eq!(tracker.consume(), None);
    }

    #[test]
    fn test_last_capture_wins() {
        let tracker = ReturnIntentTracker::new();
        tracker.capture("/cart", None);
        tracker.capture("/wishlist", Some("second".to_string()));

        let intent = tracker.consume().unwrap();
        assert_eq!(intent.path, "/wishlist");
        assert_eq!(intent.message.as_deref(), Some("second"));
    }

    #[test]
    fn test_peek_leaves_intent_in_place() {
        let tracker = ReturnIntentTracker::new();
        assert_eq!(tracker.peek(), None);

        tracker.capture("/orders", None);
        assert_eq!(tracker.peek().map(|i| i.path), Some("/orders".to_string()));
        assert!(tracker.consume().is_some());
    }

    #[test]
    fn test_clones_share_the_slot() {
        let tracker = ReturnIntentTracker::new();
        let other = tracker.clone();
        tracker.capture("/checkout", None);
        assert!(other.consume().is_some());
        assert!(tracker.consume().is_none());
    }
}
