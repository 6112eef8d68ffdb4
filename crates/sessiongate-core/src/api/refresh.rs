//! Transparent access-credential renewal for authenticated calls.
//!
//! Every authenticated request goes through [`RefreshCoordinator::send`]. When
//! the backend answers 401, the coordinator renews the session through the
//! [`Refresher`] and replays the request once. Requests that hit a 401 while a
//! renewal is in flight wait on that same renewal; there is never more than
//! one outstanding call to the refresh endpoint.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::transport::{ApiRequest, ApiResponse, ResponseClass, Transport};
use super::ApiError;
use crate::auth::{CredentialStore, Session};

/// Credentials issued by the refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    #[serde(rename = "access")]
    pub access_credential: String,
    /// Present only when the backend rotates refresh credentials
    #[serde(rename = "refresh", default)]
    pub refresh_credential: Option<String>,
}

/// Exchanges a refresh credential for a new access credential.
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, refresh_credential: &str) -> Result<TokenGrant, ApiError>;
}

/// A request on its way through the coordinator.
///
/// Carries the retry marker and the session the last attempt was sent
/// with, so the caller's request is never modified.
#[derive(Debug)]
pub struct RequestContext<'a> {
    request: &'a ApiRequest,
    session: Option<Arc<Session>>,
    retried: bool,
}

impl<'a> RequestContext<'a> {
    pub fn new(request: &'a ApiRequest) -> Self {
        Self {
            request,
            session: None,
            retried: false,
        }
    }

    pub fn request(&self) -> &ApiRequest {
        self.request
    }

    /// The session whose access credential the last attempt carried.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn credential(&self) -> Option<&str> {
        self.session.as_deref().map(Session::access_credential)
    }

    pub fn retried(&self) -> bool {
        self.retried
    }

    fn attach(&mut self, session: Option<Arc<Session>>) {
        self.session = session;
    }

    fn mark_retried(&mut self) {
        self.retried = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Renewed,
    /// The refresh was refused or unusable; the session was cleared
    Failed,
    /// The session it started from was signed out or replaced meanwhile
    Superseded,
}

/// The one in-flight refresh, shared by everyone waiting on it.
struct PendingRefresh {
    generation: u64,
    outcome: Shared<BoxFuture<'static, RefreshOutcome>>,
}

#[derive(Default)]
struct RefreshSlot {
    pending: Option<PendingRefresh>,
    generation: u64,
}

pub struct RefreshCoordinator {
    store: CredentialStore,
    transport: Arc<dyn Transport>,
    refresher: Arc<dyn Refresher>,
    slot: Arc<Mutex<RefreshSlot>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: CredentialStore,
        transport: Arc<dyn Transport>,
        refresher: Arc<dyn Refresher>,
    ) -> Self {
        Self {
            store,
            transport,
            refresher,
            slot: Arc::new(Mutex::new(RefreshSlot::default())),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Send an authenticated request, renewing the session once if needed.
    ///
    /// Returns the response for 2xx and for statuses that have nothing to do
    /// with the session (404, 500, ...); callers decide what those mean.
    ///
    /// # Errors
    ///
    /// - [`ApiError::SessionExpired`] if the renewal failed (the session is
    ///   cleared), the request's sign-in was replaced by another one before
    ///   it could be replayed, or the replayed request was rejected again
    /// - [`ApiError::PermissionDenied`] on 403, without any renewal
    /// - transport errors unchanged
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.send_with_session(request).await.map(|(response, _)| response)
    }

    /// Like [`send`](Self::send), also returning the session the answering
    /// attempt was sent with.
    ///
    /// Callers that write the response back into the store use it to check
    /// the store still holds that sign-in.
    pub async fn send_with_session(
        &self,
        request: &ApiRequest,
    ) -> Result<(ApiResponse, Option<Arc<Session>>), ApiError> {
        let mut ctx = RequestContext::new(request);

        loop {
            ctx.attach(self.store.session());
            let response = self.transport.send(ctx.request(), ctx.credential()).await?;

            match response.class() {
                ResponseClass::AuthExpired if !ctx.retried() => {
                    debug!(path = %request.path, "Access credential rejected, renewing");
                    self.renew(ctx.session()).await?;
                    ctx.mark_retried();
                }
                ResponseClass::AuthExpired => {
                    warn!(path = %request.path, "Renewed credential rejected");
                    return Err(ApiError::SessionExpired);
                }
                ResponseClass::Forbidden => {
                    let body = ApiError::truncate_body(&response.body);
                    return Err(ApiError::PermissionDenied(body));
                }
                ResponseClass::Ok | ResponseClass::Other => {
                    return Ok((response, ctx.session().cloned()));
                }
            }
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, RefreshSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure the session has moved past `stale`, joining or starting
    /// the shared refresh.
    ///
    /// Succeeds only if the store then holds a session the request may be
    /// replayed with: a renewal of `stale`, or any session when `stale` was
    /// sent without one.
    async fn renew(&self, stale: Option<&Arc<Session>>) -> Result<(), ApiError> {
        let outcome = {
            let mut slot = self.lock_slot();
            let in_flight = slot.pending.as_ref().map(|p| p.outcome.clone());
            match in_flight {
                Some(outcome) => outcome,
                None => {
                    let Some(current) = self.store.session() else {
                        return Err(ApiError::SessionExpired);
                    };
                    let unchanged = stale
                        .is_some_and(|s| s.access_credential() == current.access_credential());
                    if !unchanged {
                        // A refresh that finished after this request was sent
                        // already replaced the credential, or the request went
                        // out before anyone signed in; just replay.
                        return match stale {
                            Some(stale) if !current.same_sign_in(stale) => {
                                Err(ApiError::SessionExpired)
                            }
                            _ => Ok(()),
                        };
                    }

                    slot.generation += 1;
                    let generation = slot.generation;
                    let outcome = self.start_refresh(generation);
                    slot.pending = Some(PendingRefresh {
                        generation,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };

        match outcome.await {
            RefreshOutcome::Renewed => match (self.store.session(), stale) {
                (Some(current), Some(stale)) if !current.same_sign_in(stale) => {
                    Err(ApiError::SessionExpired)
                }
                (Some(_), _) => Ok(()),
                (None, _) => Err(ApiError::SessionExpired),
            },
            RefreshOutcome::Failed | RefreshOutcome::Superseded => Err(ApiError::SessionExpired),
        }
    }

    fn start_refresh(&self, generation: u64) -> Shared<BoxFuture<'static, RefreshOutcome>> {
        let store = self.store.clone();
        let refresher = Arc::clone(&self.refresher);
        let slot = Arc::clone(&self.slot);

        async move {
            let outcome = run_refresh(&store, refresher.as_ref()).await;

            // The store is settled before the slot empties, so a late 401
            // finding no pending refresh always sees the final credential.
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.pending.as_ref().map(|p| p.generation) == Some(generation) {
                slot.pending = None;
            }
            outcome
        }
        .boxed()
        .shared()
    }
}

async fn run_refresh(store: &CredentialStore, refresher: &dyn Refresher) -> RefreshOutcome {
    let Some(started) = store.session() else {
        return RefreshOutcome::Superseded;
    };

    let grant = match started.refresh_credential() {
        Some(refresh_credential) => match refresher.refresh(refresh_credential).await {
            Ok(grant) => Some(grant),
            Err(e) => {
                warn!(error = %e, "Session refresh failed");
                None
            }
        },
        None => {
            warn!("No refresh credential, session cannot be renewed");
            None
        }
    };

    let mut outcome = RefreshOutcome::Superseded;
    store.update(|current| {
        let current = current?;
        if !current.same_sign_in(&started) {
            // Someone signed in while the refresh was in flight; theirs stands
            return Some(current.clone());
        }

        let renewed = grant.and_then(|grant| {
            current
                .renewed(grant.access_credential, grant.refresh_credential)
                .map_err(|e| warn!(error = %e, "Refresh endpoint returned an unusable credential"))
                .ok()
        });
        outcome = match renewed {
            Some(_) => RefreshOutcome::Renewed,
            None => RefreshOutcome::Failed,
        };
        renewed
    });

    match outcome {
        RefreshOutcome::Renewed => info!("Session renewed"),
        RefreshOutcome::Failed => info!("Session could not be renewed, signed out"),
        RefreshOutcome::Superseded => debug!("Session changed during refresh, result discarded"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::*;
    use crate::auth::{MemoryStorage, Session, UserSnapshot};

    /// Accepts only the credential it was told is current.
    struct FakeBackend {
        valid: Mutex<String>,
        forbidden: bool,
        sends: AtomicUsize,
    }

    impl FakeBackend {
        fn new(valid: &str) -> Arc<Self> {
            Arc::new(Self {
                valid: Mutex::new(valid.to_string()),
                forbidden: false,
                sends: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeBackend {
        async fn send(
            &self,
            request: &ApiRequest,
            credential: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.forbidden {
                return Ok(ApiResponse::new(StatusCode::FORBIDDEN, "not a vendor"));
            }
            if request.path == "/missing/" {
                return Ok(ApiResponse::new(StatusCode::NOT_FOUND, "nope"));
            }
            if credential == Some(self.valid.lock().unwrap().as_str()) {
                Ok(ApiResponse::new(StatusCode::OK, r#"{"ok":true}"#))
            } else {
                Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "token_not_valid"))
            }
        }
    }

    struct FakeRefresher {
        grant: Option<TokenGrant>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl FakeRefresher {
        fn issuing(access: &str, refresh: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                grant: Some(TokenGrant {
                    access_credential: access.to_string(),
                    refresh_credential: refresh.map(str::to_string),
                }),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                grant: None,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Refresher for FakeRefresher {
        async fn refresh(&self, refresh_credential: &str) -> Result<TokenGrant, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(refresh_credential.to_string());
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.grant.clone().ok_or(ApiError::Unauthorized)
        }
    }

    fn store_with(access: &str) -> CredentialStore {
        let store = CredentialStore::open(Arc::new(MemoryStorage::new()));
        let user = UserSnapshot::new(1, "a@example.com", "A", "", false);
        store.set_session(Session::new(access, Some("r1".to_string()), Some(user)).unwrap());
        store
    }

    #[tokio::test]
    async fn test_valid_credential_needs_no_refresh() {
        let store = store_with("fresh");
        let backend = FakeBackend::new("fresh");
        let refresher = FakeRefresher::issuing("unused", None);
        let coordinator = RefreshCoordinator::new(store, backend.clone(), refresher.clone());

        let response = coordinator.send(&ApiRequest::get("/orders/cart/")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_credential_refreshes_and_replays_once() {
        let store = store_with("stale");
        let backend = FakeBackend::new("fresh");
        let refresher = FakeRefresher::issuing("fresh", None);
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), refresher.clone());

        let response = coordinator.send(&ApiRequest::get("/orders/cart/")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(backend.sends.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*refresher.seen.lock().unwrap(), vec!["r1".to_string()]);

        let session = store.session().unwrap();
        assert_eq!(session.access_credential(), "fresh");
        assert_eq!(session.refresh_credential(), Some("r1"));
        assert_eq!(session.user().map(|u| u.id), Some(1));
    }

    #[tokio::test]
    async fn test_rotated_refresh_credential_is_stored() {
        let store = store_with("stale");
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            FakeBackend::new("fresh"),
            FakeRefresher::issuing("fresh", Some("r2")),
        );

        coordinator.send(&ApiRequest::get("/accounts/profile/")).await.unwrap();
        assert_eq!(store.session().unwrap().refresh_credential(), Some("r2"));
    }

    #[tokio::test]
    async fn test_forbidden_never_refreshes() {
        let store = store_with("fresh");
        let backend = Arc::new(FakeBackend {
            valid: Mutex::new("fresh".to_string()),
            forbidden: true,
            sends: AtomicUsize::new(0),
        });
        let refresher = FakeRefresher::issuing("other", None);
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), refresher.clone());

        let result = coordinator.send(&ApiRequest::get("/vendors/analytics/")).await;

        assert_eq!(result, Err(ApiError::PermissionDenied("not a vendor".to_string())));
        assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        let store = store_with("fresh");
        let refresher = FakeRefresher::issuing("other", None);
        let coordinator =
            RefreshCoordinator::new(store, FakeBackend::new("fresh"), refresher.clone());

        let response = coordinator.send(&ApiRequest::get("/missing/")).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_session() {
        let store = store_with("stale");
        let backend = FakeBackend::new("fresh");
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), FakeRefresher::failing());

        let result = coordinator.send(&ApiRequest::get("/orders/cart/")).await;

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert!(!store.is_authenticated());
        assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_after_renewal_is_session_expired() {
        let store = store_with("stale");
        // The backend never accepts what the refresher issues
        let backend = FakeBackend::new("something-else");
        let refresher = FakeRefresher::issuing("fresh", None);
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), refresher.clone());

        let result = coordinator.send(&ApiRequest::get("/orders/cart/")).await;

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert_eq!(backend.sends.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn test_missing_refresh_credential_fails_without_calling_endpoint() {
        let store = CredentialStore::open(Arc::new(MemoryStorage::new()));
        store.set_session(Session::new("stale", None, None).unwrap());
        let refresher = FakeRefresher::issuing("fresh", None);
        let coordinator =
            RefreshCoordinator::new(store.clone(), FakeBackend::new("fresh"), refresher.clone());

        let result = coordinator.send(&ApiRequest::get("/orders/cart/")).await;

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn test_logged_out_request_does_not_refresh() {
        let store = CredentialStore::open(Arc::new(MemoryStorage::new()));
        let refresher = FakeRefresher::issuing("fresh", None);
        let coordinator =
            RefreshCoordinator::new(store, FakeBackend::new("fresh"), refresher.clone());

        let result = coordinator.send(&ApiRequest::get("/orders/cart/")).await;

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_caller_request_is_not_modified() {
        let store = store_with("stale");
        let coordinator = RefreshCoordinator::new(
            store,
            FakeBackend::new("fresh"),
            FakeRefresher::issuing("fresh", None),
        );
        let request = ApiRequest::post("/orders/cart/items/", serde_json::json!({"product": 4}));
        let before = request.clone();

        coordinator.send(&request).await.unwrap();
        assert_eq!(request, before);
    }

    fn bob() -> Session {
        let user = UserSnapshot::new(2, "bob@example.com", "Bob", "", false);
        Session::new("bob-access", Some("bob-refresh".to_string()), Some(user)).unwrap()
    }

    /// Signs the first user out and the second in once the refresh is under way.
    async fn switch_to_bob(store: &CredentialStore) {
        tokio::time::sleep(Duration::from_millis(1)).await;
        store.clear();
        store.set_session(bob());
    }

    #[tokio::test]
    async fn test_renewal_is_dropped_when_another_user_signs_in() {
        let store = store_with("stale");
        let backend = FakeBackend::new("fresh");
        let refresher = FakeRefresher::issuing("fresh", Some("r2"));
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), refresher.clone());

        let request = ApiRequest::get("/orders/cart/");
        let (result, ()) = futures::join!(coordinator.send(&request), switch_to_bob(&store));

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        // Never replayed under the new user's credential
        assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
        assert_eq!(store.session().as_deref(), Some(&bob()));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_a_newer_sign_in() {
        let store = store_with("stale");
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            FakeBackend::new("fresh"),
            FakeRefresher::failing(),
        );

        let request = ApiRequest::get("/orders/cart/");
        let (result, ()) = futures::join!(coordinator.send(&request), switch_to_bob(&store));

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert_eq!(store.session().as_deref(), Some(&bob()));
    }

    #[tokio::test]
    async fn test_unusable_grant_signs_out_once() {
        let store = store_with("stale");
        let sign_outs = Arc::new(AtomicUsize::new(0));
        let counter = sign_outs.clone();
        let _subscription = store.subscribe(move |session| {
            if session.is_none() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            FakeBackend::new("fresh"),
            FakeRefresher::issuing("", None),
        );

        let result = coordinator.send(&ApiRequest::get("/orders/cart/")).await;

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert!(!store.is_authenticated());
        assert_eq!(sign_outs.load(Ordering::SeqCst), 1);
    }

    /// Rejects the first user's credential and signs the second user in
    /// while doing so.
    struct SwitchingBackend {
        store: CredentialStore,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl Transport for SwitchingBackend {
        async fn send(
            &self,
            _request: &ApiRequest,
            credential: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if credential == Some("bob-access") {
                return Ok(ApiResponse::new(StatusCode::OK, "{}"));
            }
            self.store.set_session(bob());
            Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, "token_not_valid"))
        }
    }

    #[tokio::test]
    async fn test_request_is_not_replayed_for_another_sign_in() {
        let store = store_with("alice-access");
        let backend = Arc::new(SwitchingBackend {
            store: store.clone(),
            sends: AtomicUsize::new(0),
        });
        let refresher = FakeRefresher::issuing("fresh", None);
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), refresher.clone());

        let result = coordinator.send(&ApiRequest::get("/orders/cart/")).await;

        assert_eq!(result, Err(ApiError::SessionExpired));
        assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.session().as_deref(), Some(&bob()));
    }

    #[tokio::test]
    async fn test_send_with_session_reports_the_answering_session() {
        let store = store_with("stale");
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            FakeBackend::new("fresh"),
            FakeRefresher::issuing("fresh", None),
        );

        let (response, session) = coordinator
            .send_with_session(&ApiRequest::get("/orders/cart/"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(session.map(|s| s.access_credential().to_string()), Some("fresh".to_string()));
    }

    #[test]
    fn test_token_grant_parsing() {
        let grant: TokenGrant = serde_json::from_str(r#"{"access":"a2"}"#).unwrap();
        assert_eq!(grant.access_credential, "a2");
        assert_eq!(grant.refresh_credential, None);

        let grant: TokenGrant = serde_json::from_str(r#"{"access":"a2","refresh":"r2"}"#).unwrap();
        assert_eq!(grant.refresh_credential.as_deref(), Some("r2"));
    }
}
