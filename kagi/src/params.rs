//! Per-call inputs and outputs of the token flows

use std::{fmt, sync::Arc};

use kagi_clock::UnixTime;
use kagi_oauth2::{pkce::CodeVerifier, Authority, Scope};
use kagi_tokens::{
    exchange::DeviceCodeInfo, AccessToken, Account, AccessTokenEntry, AuthorizationCode, ClientId,
    ClientSecret, IdToken, RefreshToken,
};
use tokio_util::sync::CancellationToken;

use crate::ClientConfig;

/// Receives the code the user must enter during a device code flow
#[derive(Clone)]
pub struct DeviceCodeCallback(Arc<dyn Fn(&DeviceCodeInfo) + Send + Sync>);

impl DeviceCodeCallback {
    /// Wraps a function to be called once the device code is issued
    pub fn new(f: impl Fn(&DeviceCodeInfo) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, info: &DeviceCodeInfo) {
        (self.0)(info)
    }
}

impl fmt::Debug for DeviceCodeCallback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("DeviceCodeCallback")
    }
}

/// The grant-specific part of a request
#[derive(Clone, Debug)]
pub enum RequestGrant {
    /// Redeem an authorization code
    AuthorizationCode {
        /// The code delivered to the redirect URI
        code: AuthorizationCode,
        /// The PKCE verifier used when requesting the code
        code_verifier: Option<CodeVerifier>,
    },
    /// Use the cache, refreshing if needed
    Silent,
    /// Redeem a refresh token obtained outside this library
    RefreshToken {
        /// The refresh token
        refresh_token: RefreshToken,
    },
    /// Have the user approve a device code on another device
    DeviceCode {
        /// Receives the code to show the user
        callback: DeviceCodeCallback,
    },
}

/// Everything a flow needs to run one request
#[derive(Clone, Debug)]
pub struct AuthenticationRequestParameters {
    /// The requesting client
    pub client_id: ClientId,
    /// The client secret, for confidential clients
    pub client_secret: Option<ClientSecret>,
    /// The authority to request tokens from
    pub authority: Authority,
    /// The redirect URI
    pub redirect_uri: Option<String>,
    /// The requested scopes
    pub scope: Scope,
    /// Identifies this request in logs on both sides
    pub correlation_id: String,
    /// The account the token is for
    pub account: Option<Arc<Account>>,
    /// Skip the cache and go to the network
    pub force_refresh: bool,
    /// Query parameters added to every request to the service
    pub extra_query_parameters: Vec<(String, String)>,
    /// Whether an extended lifetime token may be returned
    pub extended_lifetime_enabled: bool,
    /// The grant-specific payload
    pub grant: RequestGrant,
}

impl AuthenticationRequestParameters {
    /// Parameters for `grant` taking client-wide values from `config`
    pub fn new(config: &ClientConfig, scope: Scope, grant: RequestGrant) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_credential.clone(),
            authority: config.authority.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scope,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            account: None,
            force_refresh: false,
            extra_query_parameters: Vec::new(),
            extended_lifetime_enabled: config.extended_lifetime_enabled,
            grant,
        }
    }

    /// Applies per-call options
    pub(crate) fn with_options(mut self, options: RequestOptions) -> Self {
        if let Some(authority) = options.authority {
            self.authority = authority;
        }
        if let Some(correlation_id) = options.correlation_id {
            self.correlation_id = correlation_id;
        }
        self.extra_query_parameters = options.extra_query_parameters;
        self
    }
}

/// Options common to every kind of request
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Overrides the configured authority
    pub authority: Option<Authority>,
    /// Overrides the generated correlation id
    pub correlation_id: Option<String>,
    /// Query parameters added to every request to the service
    pub extra_query_parameters: Vec<(String, String)>,
    /// Cancels the request
    pub cancellation: CancellationToken,
}

impl RequestOptions {
    /// Overrides the configured authority
    pub fn with_authority(mut self, authority: Authority) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Overrides the generated correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Adds a query parameter
    pub fn with_extra_query_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_query_parameters.push((name.into(), value.into()));
        self
    }

    /// Uses a cancellation token
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Redeem an authorization code
#[derive(Clone, Debug)]
pub struct AuthorizationCodeRequest {
    /// The code delivered to the redirect URI
    pub code: AuthorizationCode,
    /// The scopes requested with the code
    pub scope: Scope,
    /// The PKCE verifier used when requesting the code
    pub code_verifier: Option<CodeVerifier>,
    /// Overrides the configured redirect URI
    pub redirect_uri: Option<String>,
    /// Common options
    pub options: RequestOptions,
}

impl AuthorizationCodeRequest {
    /// Constructs a new request
    pub fn new(code: AuthorizationCode, scope: Scope) -> Self {
        Self {
            code,
            scope,
            code_verifier: None,
            redirect_uri: None,
            options: RequestOptions::default(),
        }
    }

    /// Sends the PKCE verifier
    pub fn with_code_verifier(mut self, verifier: CodeVerifier) -> Self {
        self.code_verifier = Some(verifier);
        self
    }

    /// Overrides the configured redirect URI
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    /// Sets common options
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Acquire a token from the cache, refreshing it if needed
#[derive(Clone, Debug)]
pub struct SilentRequest {
    /// The account to acquire a token for
    pub account: Option<Arc<Account>>,
    /// The requested scopes
    pub scope: Scope,
    /// Skip the cached access token and refresh
    pub force_refresh: bool,
    /// Common options
    pub options: RequestOptions,
}

impl SilentRequest {
    /// Constructs a new request
    pub fn new(account: Option<Arc<Account>>, scope: Scope) -> Self {
        Self {
            account,
            scope,
            force_refresh: false,
            options: RequestOptions::default(),
        }
    }

    /// Skips the cached access token
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Sets common options
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Redeem a refresh token obtained elsewhere
#[derive(Clone, Debug)]
pub struct RefreshTokenRequest {
    /// The refresh token
    pub refresh_token: RefreshToken,
    /// The requested scopes; empty means the client's default scope
    pub scope: Scope,
    /// Common options
    pub options: RequestOptions,
}

impl RefreshTokenRequest {
    /// Constructs a new request
    pub fn new(refresh_token: RefreshToken, scope: Scope) -> Self {
        Self {
            refresh_token,
            scope,
            options: RequestOptions::default(),
        }
    }

    /// Sets common options
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Acquire a token by having the user approve a code on another device
#[derive(Clone, Debug)]
pub struct DeviceCodeRequest {
    /// The requested scopes
    pub scope: Scope,
    /// Receives the code to show the user
    pub callback: DeviceCodeCallback,
    /// Common options
    pub options: RequestOptions,
}

impl DeviceCodeRequest {
    /// Constructs a new request
    pub fn new(scope: Scope, callback: impl Fn(&DeviceCodeInfo) + Send + Sync + 'static) -> Self {
        Self {
            scope,
            callback: DeviceCodeCallback::new(callback),
            options: RequestOptions::default(),
        }
    }

    /// Sets common options
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// A successfully acquired token
#[derive(Clone, Debug)]
pub struct AuthenticationResult {
    /// The access token
    pub access_token: AccessToken,
    /// The token type, usually `Bearer`
    pub token_type: String,
    /// When the access token expires
    pub expires_on: UnixTime,
    /// When the access token stops being usable even during an outage
    pub extended_expires_on: UnixTime,
    /// The scopes granted to the access token
    pub scope: Scope,
    /// The ID token, if one was issued
    pub id_token: Option<IdToken>,
    /// The signed-in account
    pub account: Option<Arc<Account>>,
    /// The tenant that issued the token
    pub tenant_id: Option<String>,
    /// The correlation id of the request
    pub correlation_id: String,
    /// Whether the token is past its expiry and was returned only because
    /// the service is unavailable
    pub is_extended_lifetime_token: bool,
    /// Whether the token came from the cache without a network call
    pub from_cache: bool,
}

impl AuthenticationResult {
    pub(crate) fn from_entry(
        entry: AccessTokenEntry,
        id_token: Option<IdToken>,
        account: Option<Arc<Account>>,
        correlation_id: String,
    ) -> Self {
        let tenant_id = Some(entry.realm.clone()).filter(|r| !r.is_empty());
        Self {
            access_token: entry.secret,
            token_type: "Bearer".to_owned(),
            expires_on: entry.expires_on,
            extended_expires_on: entry.extended_expires_on,
            scope: entry.target,
            id_token,
            account,
            tenant_id,
            correlation_id,
            is_extended_lifetime_token: false,
            from_cache: true,
        }
    }

    /// The value of an `Authorization` header carrying the access token
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.as_str())
    }
}
