//! Exchanges grants for tokens at an OAuth2 token endpoint

use kagi_clock::{Clock, DurationSecs};
use kagi_oauth2::{pkce::CodeVerifierRef, Scope};
use thiserror::Error;
use url::Url;

use crate::{
    entries::CredentialSet,
    transport::{HttpRequest, HttpResponse, HttpTransport, TransportError},
    AuthorizationCodeRef, ClientIdRef, ClientSecretRef, DeviceCodeRef, RefreshTokenRef,
};

pub mod dto;

pub use dto::{DeviceCodeInfo, ErrorResponse};

/// The grant type for polling with a device code
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// The credential being exchanged for tokens
#[derive(Clone, Copy, Debug)]
pub enum Grant<'a> {
    /// An authorization code received at the redirect URI
    AuthorizationCode {
        /// The code
        code: &'a AuthorizationCodeRef,
        /// The redirect URI the code was delivered to, exactly as sent to
        /// the authorization endpoint
        redirect_uri: &'a str,
        /// The PKCE verifier for the code challenge sent with the
        /// authorization request
        code_verifier: Option<&'a CodeVerifierRef>,
    },
    /// A refresh token
    RefreshToken {
        /// The refresh token
        refresh_token: &'a RefreshTokenRef,
    },
    /// A device code that the user has been asked to approve
    DeviceCode {
        /// The device code
        device_code: &'a DeviceCodeRef,
    },
}

impl Grant<'_> {
    /// The OAuth2 `grant_type`
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken { .. } => "refresh_token",
            Self::DeviceCode { .. } => DEVICE_CODE_GRANT_TYPE,
        }
    }
}

/// A token endpoint request
#[derive(Clone, Copy, Debug)]
pub struct TokenRequest<'a> {
    /// The requesting client
    pub client_id: &'a ClientIdRef,
    /// The client secret, for confidential clients
    pub client_secret: Option<&'a ClientSecretRef>,
    /// The scopes to request, sent as given
    pub scope: &'a Scope,
    /// The grant being exchanged
    pub grant: Grant<'a>,
    /// Sent as `client-request-id` so the service can correlate its logs
    pub correlation_id: Option<&'a str>,
    /// Added to the token endpoint's query string
    pub extra_query_parameters: &'a [(String, String)],
}

impl TokenRequest<'_> {
    /// The form-encoded request body
    pub fn form_body(&self) -> String {
        let mut body = url::form_urlencoded::Serializer::new(String::new());
        body.append_pair("grant_type", self.grant.grant_type())
            .append_pair("client_id", self.client_id.as_str());

        if let Some(secret) = self.client_secret {
            body.append_pair("client_secret", secret.as_str());
        }

        if !self.scope.is_empty() {
            body.append_pair("scope", &self.scope.to_string());
        }

        match self.grant {
            Grant::AuthorizationCode {
                code,
                redirect_uri,
                code_verifier,
            } => {
                body.append_pair("code", code.as_str())
                    .append_pair("redirect_uri", redirect_uri);
                if let Some(verifier) = code_verifier {
                    body.append_pair("code_verifier", verifier.as_str());
                }
            }
            Grant::RefreshToken { refresh_token } => {
                body.append_pair("refresh_token", refresh_token.as_str());
            }
            Grant::DeviceCode { device_code } => {
                body.append_pair("device_code", device_code.as_str());
            }
        }

        body.append_pair("client_info", "1");
        body.finish()
    }

    /// The complete HTTP request for `endpoint`
    pub fn to_http_request(&self, endpoint: &Url) -> HttpRequest {
        let mut url = endpoint.clone();
        append_query(&mut url, self.extra_query_parameters);
        with_correlation(HttpRequest::post_form(url, self.form_body()), self.correlation_id)
    }
}

fn append_query(url: &mut Url, params: &[(String, String)]) {
    if !params.is_empty() {
        let mut query = url.query_pairs_mut();
        for (k, v) in params {
            query.append_pair(k, v);
        }
    }
}

fn with_correlation(request: HttpRequest, correlation_id: Option<&str>) -> HttpRequest {
    match correlation_id {
        Some(id) => request
            .with_header("client-request-id", id)
            .with_header("return-client-request-id", "true"),
        None => request,
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The authority answered with an error
    #[error("authority rejected request with status {status}: {response}")]
    Service {
        /// The HTTP status
        status: u16,
        /// The OAuth2 error body
        response: ErrorResponse,
        /// How long the service asked the client to wait, if it said
        retry_after: Option<DurationSecs>,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError {
        /// The HTTP status of the response that carried the body
        status: u16,
        /// The deserialization failure
        #[source]
        source: serde_json::Error,
    },
    /// The authority issued an access token with no lifetime left
    #[error("authority issued an access token that is already expired")]
    ExpiredOnArrival {
        /// The HTTP status of the response that carried the token
        status: u16,
    },
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[from] TransportError),
}

impl TokenRequestError {
    /// The OAuth2 error code, if the authority supplied one
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Service { response, .. } => Some(&response.error),
            _ => None,
        }
    }
}

/// Turns a non-`2xx` response into a service error
///
/// A body that is not an OAuth2 error is kept as the description.
pub(crate) fn service_error(resp: &HttpResponse) -> TokenRequestError {
    let mut response = serde_json::from_slice::<ErrorResponse>(&resp.body).unwrap_or_else(|_| ErrorResponse {
        error: "unknown_error".to_owned(),
        error_description: Some(String::from_utf8_lossy(&resp.body).into_owned()).filter(|s| !s.is_empty()),
        ..ErrorResponse::default()
    });

    if response.correlation_id.is_none() {
        response.correlation_id = resp.header("client-request-id").map(ToOwned::to_owned);
    }

    let retry_after = resp
        .header("Retry-After")
        .and_then(|v| v.trim().parse().ok())
        .map(DurationSecs);

    tracing::debug!(
        http.status_code = resp.status,
        error = %response.error,
        error_codes = ?response.error_codes,
        "authority returned an error"
    );

    TokenRequestError::Service {
        status: resp.status,
        response,
        retry_after,
    }
}

/// Sends a token request and converts the response into credentials
///
/// Relative lifetimes are made absolute using `clock` at the time the
/// response is received.
#[tracing::instrument(
    skip_all,
    fields(
        token_url = %endpoint,
        grant_type = request.grant.grant_type(),
        client_id = %request.client_id,
    ),
)]
pub async fn exchange<T, C>(
    transport: &T,
    endpoint: &Url,
    request: &TokenRequest<'_>,
    clock: &C,
) -> Result<CredentialSet, TokenRequestError>
where
    T: HttpTransport + ?Sized,
    C: Clock,
{
    tracing::trace!("requesting token from authority");

    let resp = transport.send(request.to_http_request(endpoint)).await?;

    tracing::debug!(
        http.status_code = resp.status,
        "received token response from issuing authority"
    );

    if !resp.is_success() {
        return Err(service_error(&resp));
    }

    let received_at = clock.now();
    let body: dto::TokenResponse = serde_json::from_slice(&resp.body).map_err(|source| {
        TokenRequestError::TokenBodyError {
            status: resp.status,
            source,
        }
    })?;

    if body.expires_in == DurationSecs(0) {
        tracing::warn!(http.status_code = resp.status, "authority issued a token with no lifetime");
        return Err(TokenRequestError::ExpiredOnArrival { status: resp.status });
    }

    let mut credentials = CredentialSet::new(
        body.access_token,
        received_at,
        body.expires_in,
        body.ext_expires_in,
    );

    if let Some(token_type) = body.token_type {
        credentials.token_type = token_type;
    }
    credentials.refresh_token = body.refresh_token;
    credentials.id_token = body.id_token;
    credentials.client_info = body.client_info;
    credentials.family_id = body.foci;
    credentials.granted_scope = body.scope.as_deref().and_then(|s| match Scope::try_from(s) {
        Ok(scope) => Some(scope),
        Err(error) => {
            tracing::warn!(
                error = %error,
                "ignoring malformed granted scope"
            );
            None
        }
    });

    tracing::info!(
        has_id_token = credentials.id_token.is_some(),
        has_refresh_token = credentials.refresh_token.is_some(),
        lifetime = body.expires_in.0,
        expiry = credentials.expires_on.0,
        "received new tokens"
    );

    Ok(credentials)
}

/// Starts a device code authorization
#[tracing::instrument(
    err,
    skip_all,
    fields(device_code_url = %endpoint, client_id = %client_id),
)]
pub async fn request_device_code<T>(
    transport: &T,
    endpoint: &Url,
    client_id: &ClientIdRef,
    scope: &Scope,
    correlation_id: Option<&str>,
    extra_query_parameters: &[(String, String)],
) -> Result<DeviceCodeInfo, TokenRequestError>
where
    T: HttpTransport + ?Sized,
{
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    body.append_pair("client_id", client_id.as_str())
        .append_pair("scope", &scope.to_string());

    let mut url = endpoint.clone();
    append_query(&mut url, extra_query_parameters);

    let req = with_correlation(HttpRequest::post_form(url, body.finish()), correlation_id);
    let resp = transport.send(req).await?;

    if !resp.is_success() {
        return Err(service_error(&resp));
    }

    let info: DeviceCodeInfo =
        serde_json::from_slice(&resp.body).map_err(|source| TokenRequestError::TokenBodyError {
            status: resp.status,
            source,
        })?;
    tracing::info!(
        expires_in = info.expires_in.0,
        interval = info.interval.0,
        "received device code"
    );
    Ok(info)
}
