use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::AuthError;

/// Identity projection cached next to the credentials.
///
/// Replaced wholesale on login, refresh and logout; nothing edits it in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub is_vendor: bool,
}

impl UserSnapshot {
    /// Build a snapshot, falling back to the email when no name is set.
    pub fn new(id: i64, email: &str, first_name: &str, last_name: &str, is_vendor: bool) -> Self {
        let full_name = format!("{} {}", first_name.trim(), last_name.trim());
        let full_name = full_name.trim();
        let display_name = if full_name.is_empty() {
            email.to_string()
        } else {
            full_name.to_string()
        };

        Self {
            id,
            email: email.to_string(),
            display_name,
            is_vendor,
        }
    }
}

static NEXT_SIGN_IN: AtomicU64 = AtomicU64::new(1);

/// An authenticated session: an opaque access credential, an optional
/// refresh credential and the user it belongs to.
///
/// A `Session` always carries a non-empty access credential; "logged out"
/// is the absence of a session, never an empty one.
///
/// Every [`Session::new`] starts a new sign-in. [`renewed`](Self::renewed)
/// and [`with_user`](Self::with_user) stay within it, see
/// [`same_sign_in`](Self::same_sign_in). Equality compares credentials and
/// user only.
#[derive(Debug, Clone)]
pub struct Session {
    access_credential: String,
    refresh_credential: Option<String>,
    user: Option<UserSnapshot>,
    sign_in: u64,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.access_credential == other.access_credential
            && self.refresh_credential == other.refresh_credential
            && self.user == other.user
    }
}

impl Eq for Session {}

impl Session {
    pub fn new(
        access_credential: impl Into<String>,
        refresh_credential: Option<String>,
        user: Option<UserSnapshot>,
    ) -> Result<Self, AuthError> {
        let access_credential = access_credential.into();
        if access_credential.is_empty() {
            return Err(AuthError::Validation(
                "session access credential must not be empty".to_string(),
            ));
        }

        Ok(Self {
            access_credential,
            refresh_credential: refresh_credential.filter(|r| !r.is_empty()),
            user,
            sign_in: NEXT_SIGN_IN.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn access_credential(&self) -> &str {
        &self.access_credential
    }

    pub fn refresh_credential(&self) -> Option<&str> {
        self.refresh_credential.as_deref()
    }

    pub fn user(&self) -> Option<&UserSnapshot> {
        self.user.as_ref()
    }

    /// A new session carrying a renewed access credential.
    ///
    /// The refresh credential is kept unless the endpoint rotated it; the
    /// user snapshot always carries over.
    pub fn renewed(
        &self,
        access_credential: String,
        refresh_credential: Option<String>,
    ) -> Result<Self, AuthError> {
        let renewed = Self::new(
            access_credential,
            refresh_credential.or_else(|| self.refresh_credential.clone()),
            self.user.clone(),
        )?;
        Ok(Self {
            sign_in: self.sign_in,
            ..renewed
        })
    }

    /// Whether `other` descends from the same sign-in as this session,
    /// however many renewals apart.
    pub fn same_sign_in(&self, other: &Session) -> bool {
        self.sign_in == other.sign_in
    }

    /// A new session with the given user snapshot.
    pub fn with_user(&self, user: UserSnapshot) -> Self {
        Self {
            access_credential: self.access_credential.clone(),
            refresh_credential: self.refresh_credential.clone(),
            user: Some(user),
            sign_in: self.sign_in,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserSnapshot {
        UserSnapshot::new(7, "ada@example.com", "Ada", "Lovelace", false)
    }

    #[test]
    fn test_empty_access_credential_rejected() {
        assert!(Session::new("", None, None).is_err());
        assert!(Session::new("abc", None, None).is_ok());
    }

    #[test]
    fn test_empty_refresh_credential_treated_as_absent() {
        let session = Session::new("abc", Some(String::new()), None).unwrap();
        assert_eq!(session.refresh_credential(), None);
    }

    #[test]
    fn test_renewed_keeps_refresh_and_user() {
        let session = Session::new("old", Some("r1".to_string()), Some(user())).unwrap();
        let renewed = session.renewed("new".to_string(), None).unwrap();

        assert_eq!(renewed.access_credential(), "new");
        assert_eq!(renewed.refresh_credential(), Some("r1"));
        assert_eq!(renewed.user(), Some(&user()));
    }

    #[test]
    fn test_renewed_takes_rotated_refresh() {
        let session = Session::new("old", Some("r1".to_string()), None).unwrap();
        let renewed = session.renewed("new".to_string(), Some("r2".to_string())).unwrap();
        assert_eq!(renewed.refresh_credential(), Some("r2"));
    }

    #[test]
    fn test_same_sign_in_survives_renewal() {
        let session = Session::new("old", Some("r1".to_string()), None).unwrap();
        let renewed = session.renewed("new".to_string(), None).unwrap();
        let rotated = session.renewed("new".to_string(), Some("r2".to_string())).unwrap();
        let with_user = rotated.with_user(user());

        assert!(session.same_sign_in(&renewed));
        assert!(session.same_sign_in(&rotated));
        assert!(session.same_sign_in(&with_user));
    }

    #[test]
    fn test_each_new_session_is_its_own_sign_in() {
        let first = Session::new("a1", Some("r1".to_string()), None).unwrap();
        let second = Session::new("a1", Some("r1".to_string()), None).unwrap();

        // Equal contents, different sign-ins
        assert_eq!(first, second);
        assert!(!first.same_sign_in(&second));
        assert!(first.same_sign_in(&first.clone()));
    }

    #[test]
    fn test_display_name_falls_back_to_email() {
        assert_eq!(user().display_name, "Ada Lovelace");
        assert_eq!(UserSnapshot::new(1, "x@y.z", "Ada", "", false).display_name, "Ada");
        assert_eq!(UserSnapshot::new(1, "x@y.z", " ", "", true).display_name, "x@y.z");
    }
}
