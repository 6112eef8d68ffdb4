//! The credential store: sole owner of the current session.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::{debug, warn};

use super::session::{Session, UserSnapshot};
use super::storage::{SessionStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY};

type Listener = Arc<dyn Fn(Option<&Session>) + Send + Sync>;

struct StoreInner {
    current: RwLock<Option<Arc<Session>>>,
    storage: Arc<dyn SessionStorage>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: Mutex<u64>,
    // Held across swap + persist + notify so notifications follow mutation order
    mutation: Mutex<()>,
}

/// Holds the current session and tells subscribers when it changes.
///
/// Cloning is cheap and every clone shares the same session. Reads are
/// synchronous and never block on I/O.
///
/// Listeners run synchronously while the store is mid-mutation and must not
/// call [`set_session`](Self::set_session) or [`clear`](Self::clear) themselves.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    /// Open the store, rehydrating any session persisted in `storage`.
    ///
    /// This is the only time the store reads from storage.
    pub fn open(storage: Arc<dyn SessionStorage>) -> Self {
        let current = rehydrate(storage.as_ref()).map(Arc::new);
        debug!(authenticated = current.is_some(), "Credential store opened");

        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(current),
                storage,
                listeners: Mutex::new(Vec::new()),
                next_listener_id: Mutex::new(0),
                mutation: Mutex::new(()),
            }),
        }
    }

    /// The current session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    /// The current access credential, if a session exists.
    pub fn access_credential(&self) -> Option<String> {
        self.session().map(|s| s.access_credential().to_string())
    }

    pub fn user(&self) -> Option<UserSnapshot> {
        self.session().and_then(|s| s.user().cloned())
    }

    /// Replace the whole session.
    pub fn set_session(&self, session: Session) {
        self.replace(Some(session));
    }

    /// Drop the session (log out).
    pub fn clear(&self) {
        self.replace(None);
    }

    /// Atomically derive the next session from the current one.
    ///
    /// `change` sees the session as it is at swap time; no other mutation can
    /// interleave between that read and the write. Returns the session that
    /// is stored afterwards.
    ///
    /// Returning a session equal to the current one (or `None` while logged
    /// out) leaves the store untouched: nothing is persisted and no listener
    /// is called.
    pub fn update<F>(&self, change: F) -> Option<Arc<Session>>
    where
        F: FnOnce(Option<&Session>) -> Option<Session>,
    {
        let _mutation = self
            .inner
            .mutation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.session();
        let next = change(current.as_deref());
        if next.as_ref() == current.as_deref() {
            return current;
        }

        let next = next.map(Arc::new);
        self.swap_locked(next.clone());
        next
    }

    fn replace(&self, next: Option<Session>) {
        let _mutation = self
            .inner
            .mutation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.swap_locked(next.map(Arc::new));
    }

    fn swap_locked(&self, next: Option<Arc<Session>>) {
        {
            let mut current = self
                .inner
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *current = next.clone();
        }
        debug!(authenticated = next.is_some(), "Session replaced");

        if let Err(e) = persist(self.inner.storage.as_ref(), next.as_deref()) {
            warn!(error = %e, "Failed to persist session");
        }

        // Snapshot so listeners can subscribe or unsubscribe while being notified
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(next.as_deref());
        }
    }

    /// Register a listener called with the new session after every change.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&Session>) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self
                .inner
                .next_listener_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }
}

/// Handle returned by [`CredentialStore::subscribe`].
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

fn rehydrate(storage: &dyn SessionStorage) -> Option<Session> {
    let access = match storage.get(ACCESS_TOKEN_KEY) {
        Ok(Some(access)) if !access.is_empty() => access,
        Ok(_) => return None,
        Err(e) => {
            warn!(error = %e, "Failed to read stored session");
            return None;
        }
    };

    let refresh = storage.get(REFRESH_TOKEN_KEY).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read stored refresh credential");
        None
    });

    let user = match storage.get(USER_KEY) {
        Ok(Some(raw)) => serde_json::from_str::<UserSnapshot>(&raw)
            .map_err(|e| warn!(error = %e, "Discarding unreadable stored user snapshot"))
            .ok(),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Failed to read stored user snapshot");
            None
        }
    };

    Session::new(access, refresh, user).ok()
}

fn persist(storage: &dyn SessionStorage, session: Option<&Session>) -> anyhow::Result<()> {
    let Some(session) = session else {
        return erase(storage);
    };

    if let Err(e) = write_session(storage, session) {
        // A half-written session could pair credentials and a user from
        // different sign-ins on the next start
        if let Err(cleanup) = erase(storage) {
            warn!(error = %cleanup, "Failed to erase partially persisted session");
        }
        return Err(e);
    }
    Ok(())
}

fn write_session(storage: &dyn SessionStorage, session: &Session) -> anyhow::Result<()> {
    // Nothing rehydrates without an access credential, so it goes last
    storage.remove(ACCESS_TOKEN_KEY)?;
    match session.refresh_credential() {
        Some(refresh) => storage.set(REFRESH_TOKEN_KEY, refresh)?,
        None => storage.remove(REFRESH_TOKEN_KEY)?,
    }
    match session.user() {
        Some(user) => storage.set(USER_KEY, &serde_json::to_string(user)?)?,
        None => storage.remove(USER_KEY)?,
    }
    storage.set(ACCESS_TOKEN_KEY, session.access_credential())
}

/// Remove every session key, attempting all of them even if one fails.
fn erase(storage: &dyn SessionStorage) -> anyhow::Result<()> {
    let access = storage.remove(ACCESS_TOKEN_KEY).or_else(|e| {
        // An empty access credential is never rehydrated
        storage.set(ACCESS_TOKEN_KEY, "").map_err(|_| e)
    });
    let refresh = storage.remove(REFRESH_TOKEN_KEY);
    let user = storage.remove(USER_KEY);
    access.and(refresh).and(user)
}
