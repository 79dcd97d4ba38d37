//! The token acquisition pipeline
//!
//! Every flow runs the same skeleton:
//!
//! 1. prepare and validate the parameters, failing before any I/O,
//! 2. resolve the authority's instance metadata,
//! 3. look in the cache, if the flow allows it,
//! 4. acquire new tokens from the service,
//! 5. file the tokens in the cache,
//! 6. build the result.
//!
//! What differs between flows is captured in a [`Strategy`] and in the
//! per-flow network step selected by the request's grant.

use std::{future::Future, sync::Arc};

use kagi_clock::Clock;
use kagi_oauth2::{ResolvedAuthority, Scope};
use kagi_tokens::{
    cache::SaveContext,
    exchange::{self, Grant, TokenRequest},
    CredentialSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    AuthError, AuthenticationRequestParameters, AuthenticationResult, ClientApplication, RequestGrant,
    ServiceError,
};

mod authorization_code;
mod device_code;
mod refresh_token;
mod silent;

/// The per-flow parts of the pipeline
#[derive(Debug)]
pub(crate) struct Strategy {
    /// Flow name, for diagnostics
    pub(crate) name: &'static str,
    /// Whether a cached access token may satisfy the request
    pub(crate) reads_cache: bool,
    /// Validates and normalizes the parameters; must not perform I/O
    pub(crate) prepare: fn(&mut AuthenticationRequestParameters) -> Result<(), AuthError>,
}

/// The outcome of a flow's network step
#[derive(Debug)]
pub(crate) enum Acquired {
    /// The service issued new tokens, which still need to be cached
    Issued(CredentialSet),
    /// A cached token is being returned in place of new tokens
    Cached(AuthenticationResult),
}

impl RequestGrant {
    fn strategy(&self) -> &'static Strategy {
        match self {
            Self::AuthorizationCode { .. } => &authorization_code::STRATEGY,
            Self::Silent => &silent::STRATEGY,
            Self::RefreshToken { .. } => &refresh_token::STRATEGY,
            Self::DeviceCode { .. } => &device_code::STRATEGY,
        }
    }
}

/// Runs a request through the pipeline for its grant
pub(crate) async fn run<C: Clock + Send + Sync>(
    app: &ClientApplication<C>,
    params: AuthenticationRequestParameters,
    cancel: CancellationToken,
) -> Result<AuthenticationResult, AuthError> {
    let strategy = params.grant.strategy();
    execute(app, strategy, params, cancel).await
}

/// Awaits `fut` unless `cancel` fires first
///
/// A future that has already completed wins over a cancellation that
/// arrives at the same time.
pub(crate) async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, AuthError> {
    if cancel.is_cancelled() {
        return Err(AuthError::Cancelled);
    }

    tokio::select! {
        biased;
        out = fut => Ok(out),
        _ = cancel.cancelled() => {
            tracing::debug!("request cancelled while waiting");
            Err(AuthError::Cancelled)
        }
    }
}

#[tracing::instrument(
    skip_all,
    fields(
        flow = strategy.name,
        client_id = %params.client_id,
        correlation_id = %params.correlation_id,
    ),
)]
async fn execute<C: Clock + Send + Sync>(
    app: &ClientApplication<C>,
    strategy: &Strategy,
    mut params: AuthenticationRequestParameters,
    cancel: CancellationToken,
) -> Result<AuthenticationResult, AuthError> {
    (strategy.prepare)(&mut params)?;

    let authority = cancellable(
        &cancel,
        app.discovery.resolve(
            &params.authority,
            &*app.transport,
            app.discovery_options(),
            &params.correlation_id,
        ),
    )
    .await??;

    if strategy.reads_cache && !params.force_refresh {
        if let Some(result) = read_cache(app, &authority, &params) {
            return Ok(result);
        }
    }

    let acquired = match &params.grant {
        RequestGrant::AuthorizationCode { code, code_verifier } => {
            authorization_code::acquire(app, &authority, &params, code, code_verifier.as_deref(), &cancel).await?
        }
        RequestGrant::Silent => silent::acquire(app, &authority, &params, &cancel).await?,
        RequestGrant::RefreshToken { refresh_token } => {
            refresh_token::acquire(app, &authority, &params, refresh_token, &cancel).await?
        }
        RequestGrant::DeviceCode { callback } => {
            device_code::acquire(app, &authority, &params, callback, &cancel).await?
        }
    };

    let credentials = match acquired {
        Acquired::Cached(result) => return Ok(result),
        Acquired::Issued(credentials) => credentials,
    };

    let saved = app.cache.save(
        &credentials,
        &authority,
        SaveContext {
            client_id: &params.client_id,
            requested_scope: &params.scope,
            account: params.account.as_deref(),
        },
    );

    if cancel.is_cancelled() {
        tracing::info!("request cancelled after tokens were issued; tokens were cached");
        return Err(AuthError::Cancelled);
    }

    let mut result = AuthenticationResult::from_entry(
        saved.access_token,
        credentials.id_token,
        saved.account,
        params.correlation_id,
    );
    result.token_type = credentials.token_type;
    result.from_cache = false;
    Ok(result)
}

fn read_cache<C: Clock>(
    app: &ClientApplication<C>,
    authority: &ResolvedAuthority,
    params: &AuthenticationRequestParameters,
) -> Option<AuthenticationResult> {
    let account = params.account.as_ref()?;
    let entry = app
        .cache
        .find_access_token(&params.client_id, authority, account, &params.scope)?;
    let id_token = app
        .cache
        .find_id_token(&params.client_id, authority, account)
        .map(|e| e.secret);

    tracing::info!(
        cache.hit = true,
        expires_on = entry.expires_on.0,
        "returning cached access token"
    );

    Some(AuthenticationResult::from_entry(
        entry,
        id_token,
        Some(Arc::clone(account)),
        params.correlation_id.clone(),
    ))
}

/// Exchanges a grant at the authority's token endpoint
pub(crate) async fn exchange_grant<C: Clock + Send + Sync>(
    app: &ClientApplication<C>,
    authority: &ResolvedAuthority,
    params: &AuthenticationRequestParameters,
    grant: Grant<'_>,
    scope: &Scope,
    cancel: &CancellationToken,
) -> Result<CredentialSet, AuthError> {
    let endpoint = authority.network_authority().token_endpoint();
    let request = TokenRequest {
        client_id: &params.client_id,
        client_secret: params.client_secret.as_deref(),
        scope,
        grant,
        correlation_id: Some(params.correlation_id.as_str()),
        extra_query_parameters: &params.extra_query_parameters,
    };

    cancellable(
        cancel,
        exchange::exchange(&*app.transport, &endpoint, &request, &app.cache.config().clock),
    )
    .await?
    .map_err(|e| ServiceError::from_token_request(e, &params.correlation_id).into())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use kagi_clock::{TestClock, UnixTime};
    use kagi_oauth2::Authority;
    use kagi_tokens::{
        cache::{CacheConfig, TokenCache},
        transport::{HttpRequest, HttpResponse, HttpTransport, TransportError},
        ClientId,
    };
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::{ClientApplication, ClientConfig};

    pub(crate) const CLIENT_ID: &str = "b6c69a37-df96-4db0-9088-2ab96e1d8215";

    /// A transport that replays queued responses and records every request
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<(Instant, HttpRequest)>>,
        cancel_on_send: Mutex<Option<CancellationToken>>,
    }

    impl ScriptedTransport {
        pub(crate) fn push_json(&self, status: u16, body: serde_json::Value) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(HttpResponse::json(status, &body)));
        }

        pub(crate) fn push_error(&self, error: TransportError) {
            self.responses.lock().unwrap().push_back(Err(error));
        }

        pub(crate) fn cancel_on_send(&self, token: CancellationToken) {
            *self.cancel_on_send.lock().unwrap() = Some(token);
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
        }

        pub(crate) fn request_times(&self) -> Vec<Instant> {
            self.requests.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push((Instant::now(), request));
            if let Some(token) = self.cancel_on_send.lock().unwrap().as_ref() {
                token.cancel();
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Send("no scripted response".into())))
        }
    }

    pub(crate) fn id_token(uid: &str, tid: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::json!({
                "oid": uid,
                "tid": tid,
                "preferred_username": format!("{}@contoso.com", uid),
                "name": uid,
            })
            .to_string(),
        );
        format!("{}.{}.sig", header, payload)
    }

    pub(crate) fn client_info(uid: &str, utid: &str) -> String {
        URL_SAFE_NO_PAD.encode(format!(r#"{{"uid":"{}","utid":"{}"}}"#, uid, utid))
    }

    /// A successful token response for `uid` in tenant `utid`
    pub(crate) fn token_response(access_token: &str, refresh_token: Option<&str>, uid: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "token_type": "Bearer",
            "access_token": access_token,
            "expires_in": 3600,
            "ext_expires_in": 7200,
            "scope": "User.Read Mail.Read openid profile offline_access",
            "id_token": id_token(uid, "utid"),
            "client_info": client_info(uid, "utid"),
        });
        if let Some(rt) = refresh_token {
            body["refresh_token"] = serde_json::Value::String(rt.to_owned());
        }
        body
    }

    pub(crate) fn app() -> (ClientApplication<TestClock>, Arc<ScriptedTransport>, TestClock) {
        app_with(|c| c)
    }

    pub(crate) fn app_with(
        configure: impl FnOnce(ClientConfig) -> ClientConfig,
    ) -> (ClientApplication<TestClock>, Arc<ScriptedTransport>, TestClock) {
        let transport = Arc::new(ScriptedTransport::default());
        let clock = TestClock::new(UnixTime(1_700_000_000));
        let config = configure(
            ClientConfig::new(
                ClientId::from_static(CLIENT_ID),
                Authority::parse("https://login.microsoftonline.com/common").unwrap(),
            )
            .with_redirect_uri("https://localhost/callback"),
        );
        let app = ClientApplication::new(config, transport.clone())
            .unwrap()
            .with_cache(Arc::new(TokenCache::new(
                CacheConfig::default().with_clock(clock.clone()),
            )));
        (app, transport, clock)
    }
}
