//! Errors returned when acquiring tokens
//!
//! Every flow returns an [`AuthError`]. Callers branch on the variant:
//!
//! * [`AuthError::Client`]: the request was malformed. No network call was
//!   made, and retrying the same request will fail the same way.
//! * [`AuthError::Service`]: the identity service or the network failed.
//!   [`ServiceError::kind()`] says whether a retry may help.
//! * [`AuthError::InteractionRequired`]: a token cannot be obtained silently.
//!   Fall back to an interactive flow.
//! * [`AuthError::Cancelled`]: the caller cancelled the request.

use std::{error, fmt};

use kagi_clock::DurationSecs;
use kagi_oauth2::{AuthorityError, InvalidRedirectUri};
use kagi_tokens::{exchange::TokenRequestError, transport::TransportError};
use thiserror::Error;

/// The error code for a request that timed out before a response arrived
pub const REQUEST_TIMEOUT: &str = "request_timeout";
/// The error code for a request that failed before a response arrived
pub const REQUEST_FAILED: &str = "request_failed";
/// The error code for a response that could not be understood
pub const INVALID_RESPONSE: &str = "invalid_response";
/// The error code for a device code that expired before the user approved it
pub const EXPIRED_TOKEN: &str = "expired_token";

/// An error acquiring a token
#[derive(Debug, Error)]
pub enum AuthError {
    /// The request was invalid
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The identity service could not issue a token
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// A token cannot be obtained without user interaction
    #[error("user interaction required: {0}")]
    InteractionRequired(#[from] InteractionReason),
    /// The request was cancelled by the caller
    #[error("request was cancelled")]
    Cancelled,
}

impl AuthError {
    /// The service error, if this error came from the identity service
    ///
    /// Includes an `invalid_grant` error that caused interaction to be
    /// required.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(e) | Self::InteractionRequired(InteractionReason::InvalidGrant(e)) => Some(e),
            _ => None,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Service(e) if e.kind() == ServiceErrorKind::Transient)
    }
}

/// The request was invalid and was not sent
#[derive(Debug, Error)]
pub enum ClientError {
    /// The authority is malformed or not trusted
    #[error("invalid authority")]
    InvalidAuthority(#[from] AuthorityError),
    /// The redirect URI is missing or malformed
    #[error("invalid redirect URI")]
    InvalidRedirectUri(#[from] InvalidRedirectUri),
    /// The authorization code is empty
    #[error("authorization code cannot be empty")]
    MissingAuthorizationCode,
    /// The refresh token is empty
    #[error("refresh token cannot be empty")]
    MissingRefreshToken,
    /// No scopes other than the reserved OpenID Connect scopes were requested
    #[error("at least one scope must be requested")]
    EmptyScopes,
    /// The client id is empty
    #[error("client id cannot be empty")]
    MissingClientId,
}

/// How a service error should be handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The service or network was unavailable; retrying later may succeed
    Transient,
    /// The grant was rejected and will not become valid again
    InvalidGrant,
    /// The client is misconfigured or not permitted to use the grant
    Configuration,
    /// Any other error
    Other,
}

/// An error reported by the identity service, or a failure to reach it
#[derive(Debug, Error)]
#[error("identity service error `{error}` (status: {status:?})")]
pub struct ServiceError {
    /// The HTTP status, if a response was received
    pub status: Option<u16>,
    /// The OAuth2 error code
    pub error: String,
    /// A human readable description
    pub error_description: Option<String>,
    /// Service-specific numeric error codes
    pub error_codes: Vec<i64>,
    /// A more specific classification of the error
    pub suberror: Option<String>,
    /// The correlation id of the request
    pub correlation_id: Option<String>,
    /// The service's trace identifier
    pub trace_id: Option<String>,
    /// How long the service asked the client to wait
    pub retry_after: Option<DurationSecs>,
    /// The underlying failure, when no response was received
    #[source]
    pub source: Option<Box<dyn error::Error + Send + Sync + 'static>>,
}

impl ServiceError {
    /// An error without a response
    pub fn without_response(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status: None,
            error: error.into(),
            error_description: Some(description.into()),
            error_codes: Vec::new(),
            suberror: None,
            correlation_id: None,
            trace_id: None,
            retry_after: None,
            source: None,
        }
    }

    /// Converts a token endpoint failure
    pub fn from_token_request(error: TokenRequestError, correlation_id: &str) -> Self {
        let mut converted = match error {
            TokenRequestError::Service {
                status,
                response,
                retry_after,
            } => Self {
                status: Some(status),
                error: response.error,
                error_description: response.error_description,
                error_codes: response.error_codes,
                suberror: response.suberror,
                correlation_id: response.correlation_id,
                trace_id: response.trace_id,
                retry_after,
                source: None,
            },
            TokenRequestError::RequestSend(error) => Self::from_transport(error),
            TokenRequestError::TokenBodyError { status, source } => {
                let mut e = Self::without_response(INVALID_RESPONSE, "token response could not be parsed");
                e.status = Some(status);
                e.source = Some(Box::new(source));
                e
            }
            TokenRequestError::ExpiredOnArrival { status } => {
                let mut e = Self::without_response(INVALID_RESPONSE, "token response carried no access token lifetime");
                e.status = Some(status);
                e
            }
        };

        if converted.correlation_id.is_none() {
            converted.correlation_id = Some(correlation_id.to_owned());
        }
        converted
    }

    /// Converts a failure to reach the service
    ///
    /// Timeouts are reported with status `408`.
    pub fn from_transport(error: TransportError) -> Self {
        let (code, status) = if error.is_timeout() {
            (REQUEST_TIMEOUT, Some(408))
        } else {
            (REQUEST_FAILED, None)
        };
        let mut e = Self::without_response(code, error.to_string());
        e.status = status;
        e.source = Some(Box::new(error));
        e
    }

    /// Classifies the error
    pub fn kind(&self) -> ServiceErrorKind {
        match self.error.as_str() {
            "invalid_grant" => return ServiceErrorKind::InvalidGrant,
            "invalid_client" | "unauthorized_client" => return ServiceErrorKind::Configuration,
            "temporarily_unavailable" | REQUEST_TIMEOUT | REQUEST_FAILED => {
                return ServiceErrorKind::Transient
            }
            _ => {}
        }

        match self.status {
            Some(408) | Some(429) | Some(500..=599) => ServiceErrorKind::Transient,
            _ => ServiceErrorKind::Other,
        }
    }
}

/// Why a token could not be obtained silently
#[derive(Debug, Error)]
pub enum InteractionReason {
    /// No account was supplied
    #[error("no account or interaction required")]
    NoAccount,
    /// The cache holds no refresh token for the account
    #[error("no refresh token is cached for the account")]
    NoRefreshToken,
    /// The service rejected the cached refresh token
    #[error("the refresh token was rejected")]
    InvalidGrant(#[source] ServiceError),
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::InvalidGrant => "invalid grant",
            Self::Configuration => "configuration",
            Self::Other => "other",
        })
    }
}
