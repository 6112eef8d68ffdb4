//! Authenticated access to the backend REST API.
//!
//! This module provides the `RefreshCoordinator`, the single path for
//! authenticated calls, and the `ApiClient` built on top of it for the
//! token and account endpoints.
//!
//! The backend issues JWT access/refresh pairs. A 401 means the access
//! credential expired and is renewed once; a 403 is a permission failure and
//! is reported as is.

pub mod client;
pub mod error;
pub mod refresh;
pub mod transport;

pub use client::{ApiClient, TokenEndpoint};
pub use error::{ApiError, ErrorKind};
pub use refresh::{RefreshCoordinator, Refresher, RequestContext, TokenGrant};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ResponseClass, Transport};
