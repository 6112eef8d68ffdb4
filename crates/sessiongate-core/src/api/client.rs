//! API client for the backend's token and account endpoints.
//!
//! Login and token refresh talk to the transport directly. Everything else
//! goes through the [`RefreshCoordinator`] so an expired access credential is
//! renewed before the caller sees a failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::refresh::{RefreshCoordinator, Refresher, TokenGrant};
use super::transport::{ApiRequest, HttpTransport, Transport};
use super::ApiError;
use crate::auth::{CredentialStore, Session, UserSnapshot};

// ============================================================================
// Constants
// ============================================================================

/// Obtain an access/refresh credential pair
const TOKEN_PATH: &str = "/token/";

/// Exchange a refresh credential for a new access credential
const TOKEN_REFRESH_PATH: &str = "/token/refresh/";

/// The signed-in user's profile
const PROFILE_PATH: &str = "/accounts/profile/";

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    id: i64,
    email: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    is_vendor: bool,
}

impl ProfileResponse {
    fn to_snapshot(&self) -> UserSnapshot {
        UserSnapshot::new(self.id, &self.email, &self.first_name, &self.last_name, self.is_vendor)
    }
}

/// The backend's refresh endpoint.
pub struct TokenEndpoint {
    transport: Arc<dyn Transport>,
}

impl TokenEndpoint {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Refresher for TokenEndpoint {
    async fn refresh(&self, refresh_credential: &str) -> Result<TokenGrant, ApiError> {
        let request =
            ApiRequest::post(TOKEN_REFRESH_PATH, json!({ "refresh": refresh_credential }));
        let response = self.transport.send(&request, None).await?.error_for_status()?;
        response.json()
    }
}

pub struct ApiClient {
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    /// Create a client for the backend at `base_url`.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        store: CredentialStore,
    ) -> Result<Self, ApiError> {
        let transport = HttpTransport::new(base_url, timeout)?;
        Ok(Self::with_transport(Arc::new(transport), store))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, store: CredentialStore) -> Self {
        let endpoint = Arc::new(TokenEndpoint::new(Arc::clone(&transport)));
        let coordinator = RefreshCoordinator::new(store, Arc::clone(&transport), endpoint);
        Self {
            transport,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Sign in with email and password.
    ///
    /// Returns the new session without storing it; hand it to
    /// [`SignInFlow::complete`](crate::auth::SignInFlow::complete).
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let request = ApiRequest::post(TOKEN_PATH, json!({ "email": email, "password": password }));
        let grant: TokenGrant = self
            .transport
            .send(&request, None)
            .await?
            .error_for_status()?
            .json()?;

        let profile: ProfileResponse = self
            .transport
            .send(&ApiRequest::get(PROFILE_PATH), Some(&grant.access_credential))
            .await?
            .error_for_status()?
            .json()?;
        info!(user_id = profile.id, "Login successful");

        Session::new(
            grant.access_credential,
            grant.refresh_credential,
            Some(profile.to_snapshot()),
        )
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Fetch the signed-in user's profile.
    pub async fn fetch_profile(&self) -> Result<UserSnapshot, ApiError> {
        let profile: ProfileResponse = self.get_json(PROFILE_PATH).await?;
        Ok(profile.to_snapshot())
    }

    /// Fetch the profile and store it as the session's user snapshot.
    ///
    /// # Errors
    ///
    /// [`ApiError::SessionExpired`] if the session the profile was fetched
    /// with was signed out or replaced before it arrived; the store is left
    /// untouched.
    pub async fn refresh_profile(&self) -> Result<UserSnapshot, ApiError> {
        let request = ApiRequest::get(PROFILE_PATH);
        let (response, fetched_with) = self.coordinator.send_with_session(&request).await?;
        let profile: ProfileResponse = response.error_for_status()?.json()?;
        let user = profile.to_snapshot();
        let Some(fetched_with) = fetched_with else {
            return Err(ApiError::SessionExpired);
        };

        let mut attached = false;
        self.coordinator.store().update(|current| {
            let current = current?;
            if !current.same_sign_in(&fetched_with) {
                return Some(current.clone());
            }
            attached = true;
            Some(current.with_user(user.clone()))
        });
        if !attached {
            debug!("Session changed while the profile was loading");
            return Err(ApiError::SessionExpired);
        }
        debug!(user_id = user.id, "User snapshot updated");
        Ok(user)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(&ApiRequest::get(path)).await
    }

    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let body = serde_json::to_value(body).map_err(|e| ApiError::Validation(e.to_string()))?;
        self.send_json(&ApiRequest::post(path, body)).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        self.coordinator.send(request).await?.error_for_status()?.json()
    }
}
