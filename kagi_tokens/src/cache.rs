//! The shared token cache
//!
//! A [`TokenCache`] owns every credential record obtained by a client
//! application. Lookups hand out owned copies, so no caller ever holds a
//! reference into the cache past a single call. Reads proceed concurrently;
//! a save or removal takes the write lock exactly once, so each one is
//! applied completely or not at all.

use std::{collections::BTreeMap, sync::Arc};

use kagi_clock::{Clock, DurationSecs, System, UnixTime};
use kagi_oauth2::{AuthorityKind, ResolvedAuthority, Scope};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    account::{Account, ClientInfo, IdTokenClaims},
    entries::{
        home_account_id_str, new_extra, AccessTokenEntry, AppMetadataEntry,
        CredentialSet, CredentialType, IdTokenEntry, RefreshTokenEntry, TokenStatus,
    },
    ClientIdRef, HomeAccountId, HomeAccountIdRef,
};

const CACHE_VERSION: u32 = 1;

/// Configuration for a token cache
#[derive(Clone, Debug)]
pub struct CacheConfig<C = System> {
    /// The buffer before expiry in which an access token is no longer handed
    /// out
    pub resilience_window: DurationSecs,
    /// The source of the current time
    pub clock: C,
}

impl Default for CacheConfig<System> {
    fn default() -> Self {
        Self {
            resilience_window: DurationSecs(300),
            clock: System,
        }
    }
}

impl<C> CacheConfig<C> {
    /// Sets the resilience window
    pub fn with_resilience_window(mut self, resilience_window: DurationSecs) -> Self {
        self.resilience_window = resilience_window;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> CacheConfig<D> {
        CacheConfig {
            resilience_window: self.resilience_window,
            clock,
        }
    }
}

/// The persisted cache could not be read
///
/// The cache is left empty when this error is reported.
#[derive(Debug, Error)]
#[error("persisted token cache is corrupt and was discarded")]
pub struct CacheDeserializationError(#[from] serde_json::Error);

/// The cache could not be written out
#[derive(Debug, Error)]
#[error("unable to serialize token cache")]
pub struct CacheSerializationError(#[from] serde_json::Error);

fn default_version() -> u32 {
    CACHE_VERSION
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    #[serde(rename = "AccessToken", default)]
    access_tokens: BTreeMap<String, AccessTokenEntry>,
    #[serde(rename = "RefreshToken", default)]
    refresh_tokens: BTreeMap<String, RefreshTokenEntry>,
    #[serde(rename = "IdToken", default)]
    id_tokens: BTreeMap<String, IdTokenEntry>,
    #[serde(rename = "Account", default)]
    accounts: BTreeMap<String, Arc<Account>>,
    #[serde(rename = "AppMetadata", default)]
    app_metadata: BTreeMap<String, AppMetadataEntry>,
    #[serde(rename = "Version", default = "default_version")]
    version: u32,

    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Request context needed to file a token response in the cache
#[derive(Clone, Copy, Debug)]
pub struct SaveContext<'a> {
    /// The client that made the request
    pub client_id: &'a ClientIdRef,
    /// The scopes that were requested, used when the service does not
    /// report the granted scopes
    pub requested_scope: &'a Scope,
    /// The account the request was made for, if known
    ///
    /// Used to identify the user when the response carries no ID token.
    pub account: Option<&'a Account>,
}

/// The records written by [`TokenCache::save()`]
#[derive(Clone, Debug)]
pub struct SavedCredentials {
    /// The access token entry as filed
    pub access_token: AccessTokenEntry,
    /// The account the tokens belong to, if the user could be identified
    pub account: Option<Arc<Account>>,
}

/// A concurrency-safe store of tokens and accounts
#[derive(Debug)]
pub struct TokenCache<C = System> {
    state: RwLock<CacheState>,
    config: CacheConfig<C>,
}

impl Default for TokenCache<System> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<C: Clock> TokenCache<C> {
    /// Constructs an empty cache
    pub fn new(config: CacheConfig<C>) -> Self {
        Self {
            state: RwLock::new(CacheState {
                version: CACHE_VERSION,
                ..CacheState::default()
            }),
            config,
        }
    }

    /// Constructs a cache from a persisted blob
    ///
    /// A corrupt blob produces an empty cache along with the error that
    /// caused it to be discarded.
    pub fn load(config: CacheConfig<C>, bytes: &[u8]) -> (Self, Option<CacheDeserializationError>) {
        let cache = Self::new(config);
        let error = cache.deserialize(bytes).err();
        (cache, error)
    }

    /// The cache configuration
    #[inline]
    pub fn config(&self) -> &CacheConfig<C> {
        &self.config
    }

    /// The current time according to the cache's clock
    #[inline]
    pub fn now(&self) -> UnixTime {
        self.config.clock.now()
    }

    /// Finds an access token that is valid beyond the resilience window and
    /// was granted at least the requested scopes
    ///
    /// Reserved OpenID Connect scopes in the request are ignored.
    #[tracing::instrument(level = "trace", skip_all, fields(client_id = %client_id, scope = %scope))]
    pub fn find_access_token(
        &self,
        client_id: &ClientIdRef,
        authority: &ResolvedAuthority,
        account: &Account,
        scope: &Scope,
    ) -> Option<AccessTokenEntry> {
        self.find_access_token_with(client_id, authority, account, scope, |s| {
            s == TokenStatus::Fresh
        })
    }

    /// Finds an access token that is past its expiry but still within its
    /// extended lifetime
    ///
    /// Only meant to be used when the service cannot be reached.
    pub fn find_access_token_extended(
        &self,
        client_id: &ClientIdRef,
        authority: &ResolvedAuthority,
        account: &Account,
        scope: &Scope,
    ) -> Option<AccessTokenEntry> {
        self.find_access_token_with(client_id, authority, account, scope, |s| {
            s == TokenStatus::Extended
        })
    }

    fn find_access_token_with(
        &self,
        client_id: &ClientIdRef,
        authority: &ResolvedAuthority,
        account: &Account,
        scope: &Scope,
        accept: impl Fn(TokenStatus) -> bool,
    ) -> Option<AccessTokenEntry> {
        let now = self.now();
        let window = self.config.resilience_window;
        let wanted = scope.without_reserved();

        let (found, evict) = {
            let state = self.state.read();
            let mut evict = Vec::new();
            let mut found = None;

            for (key, entry) in &state.access_tokens {
                let status = entry.status_at(now, window);
                if status == TokenStatus::Expired {
                    evict.push(key.clone());
                    continue;
                }

                if found.is_none()
                    && accept(status)
                    && entry.client_id.as_str().eq_ignore_ascii_case(client_id.as_str())
                    && entry.home_account_id == account.home_account_id.as_str()
                    && authority.matches_environment(&entry.environment)
                    && realm_matches(&entry.realm, authority, account)
                    && entry.target.contains_all(&wanted)
                {
                    found = Some(entry.clone());
                }
            }

            (found, evict)
        };

        if !evict.is_empty() {
            let mut state = self.state.write();
            for key in &evict {
                let hard_expired = state
                    .access_tokens
                    .get(key)
                    .map_or(false, |e| e.status_at(now, window) == TokenStatus::Expired);
                if hard_expired {
                    state.access_tokens.remove(key);
                }
            }
            tracing::debug!(evicted = evict.len(), "evicted expired access tokens");
        }

        tracing::trace!(cache.hit = found.is_some(), "access token lookup");
        found
    }

    /// Finds the refresh token most recently saved for this client and account
    pub fn find_refresh_token(
        &self,
        client_id: &ClientIdRef,
        authority: &ResolvedAuthority,
        account: &Account,
    ) -> Option<RefreshTokenEntry> {
        let state = self.state.read();
        let mut candidates = state.refresh_tokens.values().filter(|rt| {
            rt.client_id.as_str().eq_ignore_ascii_case(client_id.as_str())
                && rt.home_account_id == account.home_account_id.as_str()
                && authority.matches_environment(&rt.environment)
        });

        let first = candidates.next()?;
        let found = if first.is_family_token() {
            candidates
                .find(|rt| !rt.is_family_token())
                .unwrap_or(first)
        } else {
            first
        };

        Some(found.clone())
    }

    /// Finds a refresh token shared by a family of clients for this account
    pub fn find_family_refresh_token(
        &self,
        authority: &ResolvedAuthority,
        account: &Account,
    ) -> Option<RefreshTokenEntry> {
        let state = self.state.read();
        state
            .refresh_tokens
            .values()
            .find(|rt| {
                rt.is_family_token()
                    && rt.home_account_id == account.home_account_id.as_str()
                    && authority.matches_environment(&rt.environment)
            })
            .cloned()
    }

    /// Finds the ID token issued to this client for this account
    pub fn find_id_token(
        &self,
        client_id: &ClientIdRef,
        authority: &ResolvedAuthority,
        account: &Account,
    ) -> Option<IdTokenEntry> {
        let state = self.state.read();
        state
            .id_tokens
            .values()
            .find(|id| {
                id.client_id.as_str().eq_ignore_ascii_case(client_id.as_str())
                    && id.home_account_id == account.home_account_id.as_str()
                    && authority.matches_environment(&id.environment)
                    && realm_matches(&id.realm, authority, account)
            })
            .cloned()
    }

    /// Metadata recorded about a client in an environment
    pub fn app_metadata(
        &self,
        client_id: &ClientIdRef,
        authority: &ResolvedAuthority,
    ) -> Option<AppMetadataEntry> {
        let state = self.state.read();
        state
            .app_metadata
            .values()
            .find(|m| {
                m.client_id.as_str().eq_ignore_ascii_case(client_id.as_str())
                    && authority.matches_environment(&m.environment)
            })
            .cloned()
    }

    /// All cached accounts
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.state.read().accounts.values().cloned().collect()
    }

    /// The first cached account with the given home account id
    pub fn account(&self, home_account_id: &HomeAccountIdRef) -> Option<Arc<Account>> {
        self.state
            .read()
            .accounts
            .values()
            .find(|a| a.home_account_id.as_str() == home_account_id.as_str())
            .cloned()
    }

    /// Files a token response
    ///
    /// Every record derived from the response is built first and then
    /// committed under a single write lock. Access tokens for the same
    /// account, client and realm whose scopes overlap the new token are
    /// replaced.
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %ctx.client_id, environment = %authority.environment()))]
    pub fn save(
        &self,
        credentials: &CredentialSet,
        authority: &ResolvedAuthority,
        ctx: SaveContext<'_>,
    ) -> SavedCredentials {
        let environment = authority.environment().to_ascii_lowercase();

        let claims = credentials.id_token.as_ref().and_then(|t| {
            IdTokenClaims::parse(t)
                .map_err(|error| {
                    tracing::warn!(
                        error = %error,
                        "ignoring undecodable ID token"
                    )
                })
                .ok()
        });

        let home_account_id = home_account_id_for(credentials, claims.as_ref(), ctx.account);
        let realm = realm_for(authority, claims.as_ref(), ctx.account);

        let granted = credentials
            .granted_scope
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ctx.requested_scope.clone());
        let target = match granted.without_reserved() {
            s if s.is_empty() => granted,
            s => s,
        };

        let access_token = AccessTokenEntry {
            home_account_id: home_account_id_str(home_account_id.as_ref()),
            environment: environment.clone(),
            credential_type: CredentialType::AccessToken,
            client_id: ctx.client_id.to_owned(),
            secret: credentials.access_token.clone(),
            realm: realm.clone(),
            target,
            cached_at: credentials.received_at,
            expires_on: credentials.expires_on,
            extended_expires_on: credentials.extended_expires_on,
            extra: new_extra(),
        };

        let refresh_token = credentials
            .refresh_token
            .as_ref()
            .filter(|_| home_account_id.is_some())
            .map(|secret| RefreshTokenEntry {
                home_account_id: home_account_id_str(home_account_id.as_ref()),
                environment: environment.clone(),
                credential_type: CredentialType::RefreshToken,
                client_id: ctx.client_id.to_owned(),
                secret: secret.clone(),
                family_id: credentials.family_id.clone(),
                extra: new_extra(),
            });

        let id_token = match (&credentials.id_token, &home_account_id) {
            (Some(secret), Some(hid)) => Some(IdTokenEntry {
                home_account_id: hid.as_str().to_owned(),
                environment: environment.clone(),
                credential_type: CredentialType::IdToken,
                client_id: ctx.client_id.to_owned(),
                secret: secret.clone(),
                realm: realm.clone(),
                extra: new_extra(),
            }),
            _ => None,
        };

        let new_account = match (&claims, &home_account_id) {
            (Some(claims), Some(hid)) => {
                let mut account =
                    Account::new(hid.clone(), environment.clone(), realm.clone(), claims.username());
                account.local_account_id = claims.local_account_id().unwrap_or_default().to_owned();
                account.name = claims.name.clone();
                if let AuthorityKind::Adfs = authority.authority.kind() {
                    account.authority_type = "ADFS".to_owned();
                }
                Some(Arc::new(account))
            }
            _ => None,
        };

        let app_metadata = AppMetadataEntry {
            client_id: ctx.client_id.to_owned(),
            environment: environment.clone(),
            family_id: credentials.family_id.clone(),
            extra: new_extra(),
        };

        let mut state = self.state.write();

        let replaced_before = state.access_tokens.len();
        state.access_tokens.retain(|_, existing| {
            !(existing.home_account_id == access_token.home_account_id
                && existing.client_id.as_str().eq_ignore_ascii_case(access_token.client_id.as_str())
                && existing.realm.eq_ignore_ascii_case(&access_token.realm)
                && authority.matches_environment(&existing.environment)
                && access_token.target.iter().any(|s| existing.target.contains(s)))
        });
        let replaced = replaced_before - state.access_tokens.len();
        state
            .access_tokens
            .insert(access_token.cache_key(), access_token.clone());

        if let Some(rt) = refresh_token {
            if rt.is_family_token() {
                state.refresh_tokens.retain(|_, existing| {
                    !(existing.family_id.is_none()
                        && existing.home_account_id == rt.home_account_id
                        && existing.client_id.as_str().eq_ignore_ascii_case(rt.client_id.as_str())
                        && authority.matches_environment(&existing.environment))
                });
            }
            state.refresh_tokens.insert(rt.cache_key(), rt);
        }

        if let Some(id) = id_token {
            state.id_tokens.insert(id.cache_key(), id);
        }

        let account = match new_account {
            Some(account) => {
                let key = account.cache_key();
                let account = match state.accounts.get(&key) {
                    Some(previous) if !previous.extra.is_empty() => {
                        let mut merged = (*account).clone();
                        merged.extra = previous.extra.clone();
                        Arc::new(merged)
                    }
                    _ => account,
                };
                state.accounts.insert(key, Arc::clone(&account));
                Some(account)
            }
            None => ctx.account.and_then(|a| {
                state
                    .accounts
                    .get(&a.cache_key())
                    .cloned()
                    .or_else(|| Some(Arc::new(a.clone())))
            }),
        };

        state.app_metadata.insert(app_metadata.cache_key(), app_metadata);
        drop(state);

        tracing::debug!(
            replaced,
            has_refresh_token = credentials.refresh_token.is_some(),
            has_id_token = credentials.id_token.is_some(),
            expires_on = access_token.expires_on.0,
            "saved token response to cache"
        );

        SavedCredentials {
            access_token,
            account,
        }
    }

    /// Removes an account and every credential issued to it
    ///
    /// Returns whether anything was removed.
    pub fn remove_account(&self, account: &Account) -> bool {
        let hid = account.home_account_id.as_str();
        let same_env = |env: &str| {
            env.eq_ignore_ascii_case(&account.environment)
                || kagi_oauth2::authority::known_instance_metadata(&account.environment)
                    .map_or(false, |m| m.is_alias(env))
        };

        let mut state = self.state.write();
        let before = state.access_tokens.len()
            + state.refresh_tokens.len()
            + state.id_tokens.len()
            + state.accounts.len();

        state
            .access_tokens
            .retain(|_, e| !(e.home_account_id == hid && same_env(&e.environment)));
        state
            .refresh_tokens
            .retain(|_, e| !(e.home_account_id == hid && same_env(&e.environment)));
        state
            .id_tokens
            .retain(|_, e| !(e.home_account_id == hid && same_env(&e.environment)));
        state
            .accounts
            .retain(|_, a| !(a.home_account_id.as_str() == hid && same_env(&a.environment)));

        let after = state.access_tokens.len()
            + state.refresh_tokens.len()
            + state.id_tokens.len()
            + state.accounts.len();
        drop(state);

        tracing::info!(home_account_id = %account.home_account_id, removed = before - after, "removed account from cache");
        before != after
    }

    /// Removes every record
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = CacheState {
            version: CACHE_VERSION,
            ..CacheState::default()
        };
    }

    /// Produces the persisted form of the cache
    ///
    /// Records are ordered by key, so an unchanged cache serializes to the
    /// same bytes every time.
    pub fn serialize(&self) -> Result<Vec<u8>, CacheSerializationError> {
        let state = self.state.read();
        Ok(serde_json::to_vec_pretty(&*state)?)
    }

    /// Replaces the contents of the cache with a persisted blob
    ///
    /// Unknown fields are kept and written back out by the next
    /// [`serialize()`][Self::serialize()]. If the blob is corrupt, the cache
    /// is left empty.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<(), CacheDeserializationError> {
        let parsed = if bytes.iter().all(u8::is_ascii_whitespace) {
            Ok(CacheState {
                version: CACHE_VERSION,
                ..CacheState::default()
            })
        } else {
            serde_json::from_slice::<CacheState>(bytes)
        };

        let mut state = self.state.write();
        match parsed {
            Ok(parsed) => {
                *state = parsed;
                Ok(())
            }
            Err(error) => {
                *state = CacheState {
                    version: CACHE_VERSION,
                    ..CacheState::default()
                };
                drop(state);
                tracing::warn!(
                    error = %error,
                    "discarding corrupt token cache"
                );
                Err(CacheDeserializationError(error))
            }
        }
    }
}

fn realm_matches(realm: &str, authority: &ResolvedAuthority, account: &Account) -> bool {
    realm.eq_ignore_ascii_case(&account.realm)
        || (!authority.authority.is_multi_tenant()
            && authority
                .authority
                .tenant()
                .map_or(false, |t| t.eq_ignore_ascii_case(realm)))
}

fn home_account_id_for(
    credentials: &CredentialSet,
    claims: Option<&IdTokenClaims>,
    account: Option<&Account>,
) -> Option<HomeAccountId> {
    let from_client_info = credentials.client_info.as_deref().and_then(|raw| {
        ClientInfo::parse(raw)
            .map_err(|error| {
                tracing::warn!(
                    error = %error,
                    "ignoring undecodable client_info"
                )
            })
            .ok()
    });

    if let Some(info) = from_client_info {
        return Some(info.home_account_id());
    }

    if let Some(claims) = claims {
        if let Some(local) = claims.local_account_id() {
            let id = match &claims.tid {
                Some(tid) => format!("{}.{}", local, tid),
                None => local.to_owned(),
            };
            return Some(HomeAccountId::new(id));
        }
    }

    account.map(|a| a.home_account_id.clone())
}

fn realm_for(authority: &ResolvedAuthority, claims: Option<&IdTokenClaims>, account: Option<&Account>) -> String {
    let realm = match authority.authority.kind() {
        AuthorityKind::Adfs => "adfs".to_owned(),
        AuthorityKind::B2c { tenant, .. } => tenant.clone(),
        AuthorityKind::Aad { tenant } => claims
            .and_then(|c| c.tid.clone())
            .or_else(|| {
                if authority.authority.is_multi_tenant() {
                    account.map(|a| a.realm.clone())
                } else {
                    None
                }
            })
            .unwrap_or_else(|| tenant.clone()),
    };
    realm.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use kagi_clock::TestClock;
    use kagi_oauth2::Authority;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        account::tests::{encode_client_info, encode_jwt},
        AccessToken, ClientId, RefreshToken,
    };

    const CLIENT: &str = "b6c69a37-df96-4db0-9088-2ab96e1d8215";

    fn cache() -> (TokenCache<TestClock>, TestClock) {
        let clock = TestClock::new(UnixTime(1_000_000));
        let cache = TokenCache::new(CacheConfig::default().with_clock(clock.clone()));
        (cache, clock)
    }

    fn authority(raw: &str) -> ResolvedAuthority {
        ResolvedAuthority::from_static(Authority::parse(raw).unwrap())
    }

    fn contoso() -> ResolvedAuthority {
        authority("https://login.microsoftonline.com/utid")
    }

    fn scope(s: &str) -> Scope {
        s.parse().unwrap()
    }

    fn client() -> ClientId {
        ClientId::from_static(CLIENT)
    }

    fn response(uid: &str, at: &str, rt: Option<&str>, granted: &str, now: UnixTime) -> CredentialSet {
        let id_token = encode_jwt(&serde_json::json!({
            "oid": uid,
            "tid": "utid",
            "preferred_username": format!("{}@contoso.com", uid),
        }));
        let mut set = CredentialSet::new(
            AccessToken::new(at.to_owned()),
            now,
            DurationSecs(3600),
            Some(DurationSecs(7200)),
        )
        .with_id_token(id_token)
        .with_client_info(encode_client_info(uid, "utid"))
        .with_granted_scope(scope(granted));
        if let Some(rt) = rt {
            set = set.with_refresh_token(RefreshToken::new(rt.to_owned()));
        }
        set
    }

    fn save(cache: &TokenCache<TestClock>, set: &CredentialSet, requested: &str) -> SavedCredentials {
        let client = client();
        let requested = scope(requested);
        cache.save(
            set,
            &contoso(),
            SaveContext {
                client_id: &client,
                requested_scope: &requested,
                account: None,
            },
        )
    }

    #[test]
    fn superset_satisfies_subset_lookup() {
        let (cache, clock) = cache();
        let saved = save(&cache, &response("uid", "at", Some("rt"), "User.Read Mail.Read openid profile", clock.now()), "user.read");
        let account = saved.account.unwrap();

        assert_eq!(account.home_account_id.as_str(), "uid.utid");
        assert_eq!(account.environment, "login.windows.net");
        assert_eq!(account.username, "uid@contoso.com");

        let hit = cache.find_access_token(&client(), &contoso(), &account, &scope("mail.read"));
        assert_eq!(hit.unwrap().secret.as_str(), "at");

        let hit = cache.find_access_token(&client(), &contoso(), &account, &scope("MAIL.READ user.read openid"));
        assert!(hit.is_some());

        let miss = cache.find_access_token(&client(), &contoso(), &account, &scope("mail.send"));
        assert!(miss.is_none());
    }

    #[test]
    fn lookup_through_alias_host() {
        let (cache, clock) = cache();
        let saved = save(&cache, &response("uid", "at", None, "user.read", clock.now()), "user.read");
        let account = saved.account.unwrap();

        let via_alias = authority("https://login.windows.net/utid");
        assert!(cache.find_access_token(&client(), &via_alias, &account, &scope("user.read")).is_some());

        let elsewhere = authority("https://login.contoso.com/utid");
        assert!(cache.find_access_token(&client(), &elsewhere, &account, &scope("user.read")).is_none());
    }

    #[test]
    fn resilience_window_boundary_is_a_miss() {
        let (cache, clock) = cache();
        let start = clock.now();
        let saved = save(&cache, &response("uid", "at", None, "user.read", start), "user.read");
        let account = saved.account.unwrap();

        clock.set(start + DurationSecs(3600 - 301));
        assert!(cache.find_access_token(&client(), &contoso(), &account, &scope("user.read")).is_some());

        clock.set(start + DurationSecs(3600 - 300));
        assert!(cache.find_access_token(&client(), &contoso(), &account, &scope("user.read")).is_none());
    }

    #[test]
    fn extended_lifetime_lookup() {
        let (cache, clock) = cache();
        let start = clock.now();
        let saved = save(&cache, &response("uid", "at", None, "user.read", start), "user.read");
        let account = saved.account.unwrap();

        clock.set(start + DurationSecs(4000));
        assert!(cache.find_access_token(&client(), &contoso(), &account, &scope("user.read")).is_none());
        assert!(cache
            .find_access_token_extended(&client(), &contoso(), &account, &scope("user.read"))
            .is_some());

        clock.set(start + DurationSecs(7200));
        assert!(cache
            .find_access_token_extended(&client(), &contoso(), &account, &scope("user.read"))
            .is_none());
        assert!(cache.state.read().access_tokens.is_empty());
    }

    #[test]
    fn newer_token_replaces_overlapping_token() {
        let (cache, clock) = cache();
        let saved = save(&cache, &response("uid", "old", Some("rt1"), "user.read", clock.now()), "user.read");
        let account = saved.account.unwrap();

        clock.advance(DurationSecs(60));
        save(&cache, &response("uid", "new", Some("rt2"), "user.read mail.read", clock.now()), "user.read mail.read");

        assert_eq!(cache.state.read().access_tokens.len(), 1);
        let hit = cache.find_access_token(&client(), &contoso(), &account, &scope("user.read")).unwrap();
        assert_eq!(hit.secret.as_str(), "new");

        let rt = cache.find_refresh_token(&client(), &contoso(), &account).unwrap();
        assert_eq!(rt.secret.as_str(), "rt2");
        assert_eq!(cache.state.read().refresh_tokens.len(), 1);
    }

    #[test]
    fn disjoint_scopes_are_kept_side_by_side() {
        let (cache, clock) = cache();
        save(&cache, &response("uid", "graph", None, "user.read", clock.now()), "user.read");
        save(&cache, &response("uid", "vault", None, "https://vault.azure.net/user_impersonation", clock.now()), "https://vault.azure.net/user_impersonation");
        assert_eq!(cache.state.read().access_tokens.len(), 2);
    }

    #[test]
    fn remove_account_leaves_other_accounts() {
        let (cache, clock) = cache();
        let a = save(&cache, &response("alice", "at-a", Some("rt-a"), "user.read", clock.now()), "user.read")
            .account
            .unwrap();
        let b = save(&cache, &response("bob", "at-b", Some("rt-b"), "user.read", clock.now()), "user.read")
            .account
            .unwrap();

        assert!(cache.remove_account(&a));
        assert!(!cache.remove_account(&a));

        let state = cache.state.read();
        assert!(state.access_tokens.values().all(|e| e.home_account_id != "alice.utid"));
        assert!(state.refresh_tokens.values().all(|e| e.home_account_id != "alice.utid"));
        assert!(state.id_tokens.values().all(|e| e.home_account_id != "alice.utid"));
        assert_eq!(state.accounts.len(), 1);
        drop(state);

        assert!(cache.find_access_token(&client(), &contoso(), &b, &scope("user.read")).is_some());
        assert!(cache.find_refresh_token(&client(), &contoso(), &b).is_some());
        assert!(cache.find_id_token(&client(), &contoso(), &b).is_some());
    }

    #[test]
    fn family_refresh_token_replaces_own_token() {
        let (cache, clock) = cache();
        let account = save(&cache, &response("uid", "at", Some("own"), "user.read", clock.now()), "user.read")
            .account
            .unwrap();
        save(
            &cache,
            &response("uid", "at2", Some("family"), "user.read", clock.now()).with_family_id("1"),
            "user.read",
        );

        let rt = cache.find_refresh_token(&client(), &contoso(), &account).unwrap();
        assert_eq!(rt.secret.as_str(), "family");
        assert_eq!(cache.state.read().refresh_tokens.len(), 1);

        let frt = cache.find_family_refresh_token(&contoso(), &account).unwrap();
        assert_eq!(frt.family_id.as_deref(), Some("1"));
        assert_eq!(
            cache.app_metadata(&client(), &contoso()).unwrap().family_id.as_deref(),
            Some("1")
        );
    }

    #[test]
    fn response_without_id_token_uses_request_account() {
        let (cache, clock) = cache();
        let account = save(&cache, &response("uid", "at", Some("rt1"), "user.read", clock.now()), "user.read")
            .account
            .unwrap();

        let bare = CredentialSet::new(AccessToken::from_static("refreshed"), clock.now(), DurationSecs(3600), None)
            .with_refresh_token(RefreshToken::from_static("rt2"));
        let requested = scope("user.read");
        let saved = cache.save(
            &bare,
            &contoso(),
            SaveContext {
                client_id: &client(),
                requested_scope: &requested,
                account: Some(&account),
            },
        );

        assert_eq!(saved.access_token.home_account_id, "uid.utid");
        assert_eq!(saved.access_token.target, requested);
        assert_eq!(saved.account.unwrap().username, "uid@contoso.com");
        assert_eq!(cache.find_refresh_token(&client(), &contoso(), &account).unwrap().secret.as_str(), "rt2");
    }

    #[test]
    fn round_trip_preserves_lookups_and_unknown_fields() {
        let (cache, clock) = cache();
        let account = save(&cache, &response("uid", "at", Some("rt"), "user.read", clock.now()), "user.read")
            .account
            .unwrap();

        let mut blob: serde_json::Value = serde_json::from_slice(&cache.serialize().unwrap()).unwrap();
        blob["FutureSection"] = serde_json::json!({"k": "v"});
        let key = account.cache_key();
        blob["Account"][&key]["client_extension"] = serde_json::json!(42);
        let bytes = serde_json::to_vec(&blob).unwrap();

        let (restored, error) = TokenCache::load(CacheConfig::default().with_clock(clock.clone()), &bytes);
        assert!(error.is_none());
        assert_eq!(
            restored
                .find_access_token(&client(), &contoso(), &account, &scope("user.read"))
                .map(|e| e.secret),
            cache
                .find_access_token(&client(), &contoso(), &account, &scope("user.read"))
                .map(|e| e.secret)
        );
        assert!(restored.find_refresh_token(&client(), &contoso(), &account).is_some());
        assert_eq!(restored.accounts().len(), 1);

        let again: serde_json::Value = serde_json::from_slice(&restored.serialize().unwrap()).unwrap();
        assert_eq!(again["FutureSection"]["k"], "v");
        assert_eq!(again["Account"][&key]["client_extension"], 42);
        assert_eq!(again["Version"], 1);
    }

    #[test]
    fn serialization_is_byte_stable() {
        let (cache, clock) = cache();
        save(&cache, &response("uid", "at", Some("rt"), "user.read", clock.now()), "user.read");
        save(&cache, &response("other", "at", Some("rt"), "user.read", clock.now()), "user.read");

        let first = cache.serialize().unwrap();
        cache.deserialize(&first).unwrap();
        assert_eq!(first, cache.serialize().unwrap());
    }

    #[test]
    #[traced_test]
    fn corrupt_blob_yields_empty_cache() {
        let (cache, clock) = cache();
        save(&cache, &response("uid", "at", Some("rt"), "user.read", clock.now()), "user.read");

        assert!(cache.deserialize(b"{ not json").is_err());
        assert!(cache.accounts().is_empty());
        assert!(logs_contain("discarding corrupt token cache"));

        let (loaded, error) = TokenCache::load(CacheConfig::default(), br#"{"AccessToken": 7}"#);
        assert!(error.is_some());
        assert!(loaded.accounts().is_empty());

        let (loaded, error) = TokenCache::load(CacheConfig::default(), b"");
        assert!(error.is_none());
        assert!(loaded.accounts().is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let (cache, clock) = cache();
        save(&cache, &response("uid", "at", Some("rt"), "user.read", clock.now()), "user.read");
        cache.clear();
        assert!(cache.accounts().is_empty());
        assert!(cache.state.read().access_tokens.is_empty());
    }

    #[test]
    fn concurrent_saves_keep_last_refresh_token() {
        let (cache, clock) = cache();
        let cache = Arc::new(cache);
        let account = save(&cache, &response("uid", "at", Some("rt-0"), "user.read", clock.now()), "user.read")
            .account
            .unwrap();

        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let now = clock.now();
                std::thread::spawn(move || {
                    save(&cache, &response("uid", "at", Some(&format!("rt-{}", i)), "user.read", now), "user.read");
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.state.read().refresh_tokens.len(), 1);
        let rt = cache.find_refresh_token(&client(), &contoso(), &account).unwrap();
        assert!(rt.secret.as_str().starts_with("rt-"));
        assert_ne!(rt.secret.as_str(), "rt-0");
    }
}
