use std::sync::Arc;

use kagi_clock::{Clock, System};
use kagi_oauth2::{
    authority::{validate_redirect_uri, AuthorizationUrlRequest},
    pkce::CodeChallenge,
    InvalidRedirectUri, Scope,
};
use kagi_tokens::{
    cache::TokenCache,
    persistence::{self, CachePersistence},
    transport::HttpTransport,
    Account,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    discovery::{DiscoveryOptions, InstanceDiscovery},
    flows, AuthError, AuthenticationRequestParameters, AuthenticationResult, AuthorizationCodeRequest,
    ClientConfig, ClientError, DeviceCodeRequest, RefreshTokenRequest, RequestGrant, SilentRequest,
};

/// A public or confidential client application
///
/// Holds the configuration, the token cache, and the transport shared by
/// every request. Requests may run concurrently; each one works on its own
/// parameters and only meets the others in the cache.
#[derive(Debug)]
pub struct ClientApplication<C = System> {
    pub(crate) config: ClientConfig,
    pub(crate) cache: Arc<TokenCache<C>>,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) discovery: InstanceDiscovery,
    persistence: Option<Arc<dyn CachePersistence>>,
}

impl ClientApplication<System> {
    /// Constructs a client with an empty in-memory cache
    pub fn new(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            cache: Arc::new(TokenCache::default()),
            transport,
            discovery: InstanceDiscovery::new(),
            persistence: None,
        })
    }
}

impl<C> ClientApplication<C> {
    /// Uses the given token cache, which may be shared with other clients
    pub fn with_cache<D>(self, cache: Arc<TokenCache<D>>) -> ClientApplication<D> {
        ClientApplication {
            config: self.config,
            cache,
            transport: self.transport,
            discovery: self.discovery,
            persistence: self.persistence,
        }
    }

    /// Loads the cache from `persistence` before each request and stores it
    /// after each change
    pub fn with_persistence(mut self, persistence: Arc<dyn CachePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// The client's configuration
    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The client's token cache
    #[inline]
    pub fn cache(&self) -> &Arc<TokenCache<C>> {
        &self.cache
    }

    pub(crate) fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            validate_authority: self.config.validate_authority,
            instance_discovery: self.config.instance_discovery,
        }
    }

    /// Builds the URL to send the user to for an authorization code
    ///
    /// The reserved OpenID Connect scopes are always requested.
    pub fn authorization_request_url(
        &self,
        scope: &Scope,
        code_challenge: Option<&CodeChallenge>,
        state: Option<&str>,
        login_hint: Option<&str>,
    ) -> Result<Url, ClientError> {
        let redirect_uri = self
            .config
            .redirect_uri
            .as_deref()
            .ok_or(InvalidRedirectUri::Empty)?;
        validate_redirect_uri(redirect_uri)?;

        Ok(self.config.authority.authorization_url(&AuthorizationUrlRequest {
            client_id: self.config.client_id.as_str(),
            redirect_uri,
            scope,
            code_challenge: code_challenge.map(|c| c.as_str()),
            state,
            login_hint,
            extra_query_parameters: &[],
        }))
    }
}

impl<C: Clock + Send + Sync> ClientApplication<C> {
    /// Redeems an authorization code
    pub async fn acquire_token_by_authorization_code(
        &self,
        request: AuthorizationCodeRequest,
    ) -> Result<AuthenticationResult, AuthError> {
        let cancel = request.options.cancellation.clone();
        let mut params = AuthenticationRequestParameters::new(
            &self.config,
            request.scope,
            RequestGrant::AuthorizationCode {
                code: request.code,
                code_verifier: request.code_verifier,
            },
        )
        .with_options(request.options);
        if let Some(redirect_uri) = request.redirect_uri {
            params.redirect_uri = Some(redirect_uri);
        }

        self.run(params, cancel).await
    }

    /// Acquires a token for an account from the cache, refreshing it if
    /// needed
    ///
    /// A multi-tenant authority is narrowed to the account's home tenant
    /// unless the request overrides the authority.
    pub async fn acquire_token_silent(&self, request: SilentRequest) -> Result<AuthenticationResult, AuthError> {
        let cancel = request.options.cancellation.clone();
        let overridden = request.options.authority.is_some();

        let mut params = AuthenticationRequestParameters::new(&self.config, request.scope, RequestGrant::Silent)
            .with_options(request.options);
        params.force_refresh = request.force_refresh;

        if let Some(account) = &request.account {
            if !overridden && params.authority.is_multi_tenant() {
                let tenant = account.home_tenant().unwrap_or(account.realm.as_str());
                if !tenant.is_empty() {
                    params.authority = params.authority.with_tenant(tenant);
                }
            }
        }
        params.account = request.account;

        self.run(params, cancel).await
    }

    /// Redeems a refresh token obtained outside this library
    pub async fn acquire_token_by_refresh_token(
        &self,
        request: RefreshTokenRequest,
    ) -> Result<AuthenticationResult, AuthError> {
        let cancel = request.options.cancellation.clone();
        let params = AuthenticationRequestParameters::new(
            &self.config,
            request.scope,
            RequestGrant::RefreshToken {
                refresh_token: request.refresh_token,
            },
        )
        .with_options(request.options);

        self.run(params, cancel).await
    }

    /// Acquires a token by having the user enter a code on another device
    pub async fn acquire_token_with_device_code(
        &self,
        request: DeviceCodeRequest,
    ) -> Result<AuthenticationResult, AuthError> {
        let cancel = request.options.cancellation.clone();
        let params = AuthenticationRequestParameters::new(
            &self.config,
            request.scope,
            RequestGrant::DeviceCode {
                callback: request.callback,
            },
        )
        .with_options(request.options);

        self.run(params, cancel).await
    }

    /// All accounts with tokens in the cache
    pub async fn get_accounts(&self) -> Vec<Arc<Account>> {
        self.load().await;
        self.cache.accounts()
    }

    /// Removes an account and all of its tokens from the cache
    ///
    /// Returns whether anything was removed.
    pub async fn remove_account(&self, account: &Account) -> bool {
        self.load().await;
        let removed = self.cache.remove_account(account);
        if removed {
            self.store().await;
        }
        removed
    }

    async fn run(
        &self,
        params: AuthenticationRequestParameters,
        cancel: CancellationToken,
    ) -> Result<AuthenticationResult, AuthError> {
        self.load().await;
        let result = flows::run(self, params, cancel).await;

        // A cancelled request may still have filed tokens
        if matches!(&result, Ok(r) if !r.from_cache) || matches!(result, Err(AuthError::Cancelled)) {
            self.store().await;
        }
        result
    }

    async fn load(&self) {
        if let Some(p) = &self.persistence {
            if let Err(error) = persistence::load_into(&**p, &*self.cache).await {
                tracing::warn!(error = %error, "unable to load persisted token cache");
            }
        }
    }

    async fn store(&self) {
        if let Some(p) = &self.persistence {
            if let Err(error) = persistence::store(&**p, &*self.cache).await {
                tracing::warn!(error = %error, "unable to persist token cache");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use kagi_clock::DurationSecs;
    use kagi_oauth2::{pkce::Pkce, Authority, ScopeToken};
    use kagi_tokens::{persistence::PersistenceError, AuthorizationCode, ClientId};

    use super::*;
    use crate::{
        flows::tests::{app, app_with, token_response, ScriptedTransport, CLIENT_ID},
        RequestOptions,
    };

    fn user_read() -> Scope {
        Scope::single(ScopeToken::from_static("User.Read"))
    }

    #[derive(Debug, Default)]
    struct MemoryPersistence {
        data: Mutex<Option<Vec<u8>>>,
        writes: Mutex<usize>,
    }

    #[async_trait]
    impl CachePersistence for MemoryPersistence {
        async fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
            Ok(self.data.lock().unwrap().clone())
        }

        async fn write(&self, data: Vec<u8>) -> Result<(), PersistenceError> {
            *self.data.lock().unwrap() = Some(data);
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn blank_client_id_is_rejected_at_construction() {
        let config = ClientConfig::new(
            ClientId::from_static(""),
            Authority::parse("https://login.microsoftonline.com/common").unwrap(),
        );
        let transport = Arc::new(ScriptedTransport::default());
        assert!(matches!(
            ClientApplication::new(config, transport),
            Err(ClientError::MissingClientId)
        ));
    }

    #[test]
    fn authorization_url_carries_pkce_challenge() {
        let (app, _, _) = app();
        let pkce = Pkce::generate();
        let url = app
            .authorization_request_url(&user_read(), Some(&pkce.challenge), Some("xyz"), None)
            .unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".to_owned(), CLIENT_ID.to_owned())));
        assert!(pairs.contains(&("code_challenge".to_owned(), pkce.challenge.as_str().to_owned())));
        assert!(pairs.contains(&("state".to_owned(), "xyz".to_owned())));
        assert!(pairs.contains(&("redirect_uri".to_owned(), "https://localhost/callback".to_owned())));
    }

    #[tokio::test]
    async fn silent_narrows_common_authority_to_home_tenant() {
        let (app, transport, clock) = app();
        transport.push_json(200, token_response("at-1", Some("rt-1"), "uid"));
        let signed_in = app
            .acquire_token_by_authorization_code(AuthorizationCodeRequest::new(
                AuthorizationCode::from_static("code"),
                user_read(),
            ))
            .await
            .unwrap();
        let account = signed_in.account.unwrap();

        clock.advance(DurationSecs(4000));
        transport.push_json(200, token_response("at-2", Some("rt-2"), "uid"));
        let result = app
            .acquire_token_silent(SilentRequest::new(Some(account), user_read()))
            .await
            .unwrap();
        assert_eq!(result.access_token.as_str(), "at-2");

        let refresh = transport.requests().pop().unwrap();
        assert!(refresh
            .url
            .as_str()
            .starts_with("https://login.microsoftonline.com/utid/oauth2/v2.0/token"));
    }

    #[tokio::test]
    async fn correlation_id_is_sent_and_returned() {
        let (app, transport, _) = app();
        transport.push_json(200, token_response("at-1", Some("rt-1"), "uid"));

        let result = app
            .acquire_token_by_authorization_code(
                AuthorizationCodeRequest::new(AuthorizationCode::from_static("code"), user_read())
                    .with_options(RequestOptions::default().with_correlation_id("corr-1")),
            )
            .await
            .unwrap();
        assert_eq!(result.correlation_id, "corr-1");
        assert_eq!(transport.requests()[0].header("client-request-id"), Some("corr-1"));
    }

    #[tokio::test]
    async fn accounts_are_listed_and_removed() {
        let (app, transport, _) = app();
        transport.push_json(200, token_response("at-1", Some("rt-1"), "uid"));
        app.acquire_token_by_authorization_code(AuthorizationCodeRequest::new(
            AuthorizationCode::from_static("code"),
            user_read(),
        ))
        .await
        .unwrap();

        let accounts = app.get_accounts().await;
        assert_eq!(accounts.len(), 1);
        assert!(app.remove_account(&accounts[0]).await);
        assert!(app.get_accounts().await.is_empty());
        assert!(!app.remove_account(&accounts[0]).await);

        let err = app
            .acquire_token_silent(SilentRequest::new(Some(accounts[0].clone()), user_read()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::InteractionRequired(crate::InteractionReason::NoRefreshToken)
        ));
    }

    #[tokio::test]
    async fn persistence_is_written_after_new_tokens_only() {
        let storage = Arc::new(MemoryPersistence::default());
        let (app, transport, _) = app_with(|c| c);
        let app = app.with_persistence(storage.clone());

        transport.push_json(200, token_response("at-1", Some("rt-1"), "uid"));
        let signed_in = app
            .acquire_token_by_authorization_code(AuthorizationCodeRequest::new(
                AuthorizationCode::from_static("code"),
                user_read(),
            ))
            .await
            .unwrap();
        assert_eq!(*storage.writes.lock().unwrap(), 1);

        let cached = app
            .acquire_token_silent(SilentRequest::new(signed_in.account, user_read()))
            .await
            .unwrap();
        assert!(cached.from_cache);
        assert_eq!(*storage.writes.lock().unwrap(), 1);

        let persisted = storage.data.lock().unwrap().clone().unwrap();
        let text = String::from_utf8(persisted).unwrap();
        assert!(text.contains("\"AccessToken\""));
        assert!(text.contains("at-1"));
    }
}
