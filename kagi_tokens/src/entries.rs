use std::collections::BTreeMap;

use kagi_clock::{DurationSecs, UnixTime};
use kagi_oauth2::Scope;
use serde::{Deserialize, Serialize};

use crate::{AccessToken, AccessTokenRef, ClientId, ClientIdRef, HomeAccountId, IdToken, RefreshToken};

/// The kind of credential held by a cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialType {
    /// An access token
    AccessToken,
    /// A refresh token
    RefreshToken,
    /// An ID token
    IdToken,
}

impl CredentialType {
    /// The lowercase name used in cache keys
    pub fn key_segment(self) -> &'static str {
        match self {
            Self::AccessToken => "accesstoken",
            Self::RefreshToken => "refreshtoken",
            Self::IdToken => "idtoken",
        }
    }
}

/// Timestamps are persisted as decimal strings of Unix seconds
mod string_secs {
    use kagi_clock::UnixTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &UnixTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&t.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<UnixTime, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(UnixTime(n)),
            Raw::Str(s) => s.trim().parse().map(UnixTime).map_err(de::Error::custom),
        }
    }
}

fn credential_key(
    home_account_id: &str,
    environment: &str,
    credential_type: CredentialType,
    client_id: &str,
    realm: &str,
    target: &str,
) -> String {
    format!(
        "{}-{}-{}-{}-{}-{}",
        home_account_id,
        environment,
        credential_type.key_segment(),
        client_id,
        realm,
        target
    )
    .to_ascii_lowercase()
}

/// A token's lifecycle status relative to a resilience window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and will stay valid beyond the resilience window
    Fresh,
    /// The token is still valid, but will expire within the resilience window
    ExpiringSoon,
    /// The token is expired, but within its extended lifetime
    Extended,
    /// The token is no longer valid
    Expired,
}

/// A cached access token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenEntry {
    /// The account the token was issued to, empty for app-only tokens
    #[serde(default)]
    pub home_account_id: String,
    /// The authority host the token was obtained from
    pub environment: String,
    /// Always [`CredentialType::AccessToken`]
    pub credential_type: CredentialType,
    /// The client the token was issued to
    pub client_id: ClientId,
    /// The token itself
    pub secret: AccessToken,
    /// The tenant that issued the token
    #[serde(default)]
    pub realm: String,
    /// Scopes granted to the token
    pub target: Scope,
    /// When the token was received
    #[serde(with = "string_secs")]
    pub cached_at: UnixTime,
    /// When the token expires
    #[serde(with = "string_secs")]
    pub expires_on: UnixTime,
    /// When the token stops being usable even during a service outage
    #[serde(with = "string_secs")]
    pub extended_expires_on: UnixTime,

    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

impl AccessTokenEntry {
    /// The deterministic cache key
    pub fn cache_key(&self) -> String {
        credential_key(
            &self.home_account_id,
            &self.environment,
            CredentialType::AccessToken,
            self.client_id.as_str(),
            &self.realm,
            &self.target.normalized_key(),
        )
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.secret
    }

    /// Gets the token's lifetime status as of the provided time
    ///
    /// A token is only [`Fresh`][TokenStatus::Fresh] if `time + window` is
    /// strictly before its expiry; exactly at the boundary it is already
    /// considered to be expiring.
    pub fn status_at(&self, time: UnixTime, window: DurationSecs) -> TokenStatus {
        if time + window < self.expires_on {
            TokenStatus::Fresh
        } else if time < self.expires_on {
            TokenStatus::ExpiringSoon
        } else if time < self.extended_expires_on {
            TokenStatus::Extended
        } else {
            TokenStatus::Expired
        }
    }
}

/// A cached refresh token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenEntry {
    /// The account the token was issued to
    #[serde(default)]
    pub home_account_id: String,
    /// The authority host the token was obtained from
    pub environment: String,
    /// Always [`CredentialType::RefreshToken`]
    pub credential_type: CredentialType,
    /// The client that most recently obtained the token
    pub client_id: ClientId,
    /// The token itself
    pub secret: RefreshToken,
    /// The family of clients that may share this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,

    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

impl RefreshTokenEntry {
    /// The deterministic cache key
    ///
    /// Family refresh tokens are keyed by family rather than by client, so
    /// that one token is shared by every member of the family.
    pub fn cache_key(&self) -> String {
        let client = self.family_id.as_deref().unwrap_or(self.client_id.as_str());
        credential_key(
            &self.home_account_id,
            &self.environment,
            CredentialType::RefreshToken,
            client,
            "",
            "",
        )
    }

    /// Whether the token is shared by a family of clients
    #[inline]
    pub fn is_family_token(&self) -> bool {
        self.family_id.is_some()
    }
}

/// A cached ID token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenEntry {
    /// The account the token describes
    pub home_account_id: String,
    /// The authority host the token was obtained from
    pub environment: String,
    /// Always [`CredentialType::IdToken`]
    pub credential_type: CredentialType,
    /// The client the token was issued to
    pub client_id: ClientId,
    /// The token itself
    pub secret: IdToken,
    /// The tenant that issued the token
    #[serde(default)]
    pub realm: String,

    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

impl IdTokenEntry {
    /// The deterministic cache key
    pub fn cache_key(&self) -> String {
        credential_key(
            &self.home_account_id,
            &self.environment,
            CredentialType::IdToken,
            self.client_id.as_str(),
            &self.realm,
            "",
        )
    }
}

/// Metadata about a client application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadataEntry {
    /// The client
    pub client_id: ClientId,
    /// The authority host
    pub environment: String,
    /// The family the client belongs to, if the service reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,

    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

impl AppMetadataEntry {
    /// The deterministic cache key
    pub fn cache_key(&self) -> String {
        app_metadata_key(&self.environment, &self.client_id)
    }
}

pub(crate) fn app_metadata_key(environment: &str, client_id: &ClientIdRef) -> String {
    format!("appmetadata-{}-{}", environment, client_id.as_str()).to_ascii_lowercase()
}

/// Tokens returned by the token endpoint, before being keyed into the cache
#[derive(Clone, Debug)]
pub struct CredentialSet {
    /// The access token
    pub access_token: AccessToken,
    /// The token type, usually `Bearer`
    pub token_type: String,
    /// Scopes granted, if the service reported them
    pub granted_scope: Option<Scope>,
    /// When the response was received
    pub received_at: UnixTime,
    /// Absolute expiry of the access token
    pub expires_on: UnixTime,
    /// Absolute extended expiry of the access token
    pub extended_expires_on: UnixTime,
    /// A new or rotated refresh token
    pub refresh_token: Option<RefreshToken>,
    /// An ID token
    pub id_token: Option<IdToken>,
    /// The raw `client_info` value
    pub client_info: Option<String>,
    /// The family of clients the refresh token may be shared with
    pub family_id: Option<String>,
}

impl CredentialSet {
    /// Constructs a credential set from relative lifetimes measured at
    /// `received_at`
    ///
    /// A missing extended lifetime is the same as the regular lifetime.
    pub fn new(
        access_token: AccessToken,
        received_at: UnixTime,
        expires_in: DurationSecs,
        ext_expires_in: Option<DurationSecs>,
    ) -> Self {
        let ext = ext_expires_in.unwrap_or(expires_in).max(expires_in);
        Self {
            access_token,
            token_type: "Bearer".to_owned(),
            granted_scope: None,
            received_at,
            expires_on: received_at + expires_in,
            extended_expires_on: received_at + ext,
            refresh_token: None,
            id_token: None,
            client_info: None,
            family_id: None,
        }
    }

    /// Attaches a refresh token
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    /// Attaches an ID token
    pub fn with_id_token(mut self, id_token: IdToken) -> Self {
        self.id_token = Some(id_token);
        self
    }

    /// Attaches the granted scopes
    pub fn with_granted_scope(mut self, scope: Scope) -> Self {
        self.granted_scope = Some(scope);
        self
    }

    /// Attaches a raw `client_info` value
    pub fn with_client_info(mut self, client_info: impl Into<String>) -> Self {
        self.client_info = Some(client_info.into());
        self
    }

    /// Attaches a family id
    pub fn with_family_id(mut self, family_id: impl Into<String>) -> Self {
        self.family_id = Some(family_id.into());
        self
    }
}

pub(crate) fn new_extra() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::new()
}

pub(crate) fn home_account_id_str(id: Option<&HomeAccountId>) -> String {
    id.map(|h| h.as_str().to_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(expires_on: u64, ext: u64) -> AccessTokenEntry {
        AccessTokenEntry {
            home_account_id: "uid.utid".to_owned(),
            environment: "login.windows.net".to_owned(),
            credential_type: CredentialType::AccessToken,
            client_id: ClientId::from_static("Client"),
            secret: AccessToken::from_static("at"),
            realm: "utid".to_owned(),
            target: "User.Read mail.read".parse().unwrap(),
            cached_at: UnixTime(0),
            expires_on: UnixTime(expires_on),
            extended_expires_on: UnixTime(ext),
            extra: new_extra(),
        }
    }

    #[test]
    fn resilience_window_boundary_is_expiring() {
        let e = entry(1000, 2000);
        let window = DurationSecs(300);
        assert_eq!(e.status_at(UnixTime(699), window), TokenStatus::Fresh);
        assert_eq!(e.status_at(UnixTime(700), window), TokenStatus::ExpiringSoon);
        assert_eq!(e.status_at(UnixTime(999), window), TokenStatus::ExpiringSoon);
        assert_eq!(e.status_at(UnixTime(1000), window), TokenStatus::Extended);
        assert_eq!(e.status_at(UnixTime(2000), window), TokenStatus::Expired);
    }

    #[test]
    fn key_is_deterministic() {
        let e = entry(1, 1);
        assert_eq!(
            e.cache_key(),
            "uid.utid-login.windows.net-accesstoken-client-utid-mail.read user.read"
        );
    }

    #[test]
    fn family_refresh_token_keyed_by_family() {
        let rt = RefreshTokenEntry {
            home_account_id: "uid.utid".to_owned(),
            environment: "login.windows.net".to_owned(),
            credential_type: CredentialType::RefreshToken,
            client_id: ClientId::from_static("client"),
            secret: RefreshToken::from_static("rt"),
            family_id: Some("1".to_owned()),
            extra: new_extra(),
        };
        assert_eq!(rt.cache_key(), "uid.utid-login.windows.net-refreshtoken-1--");
    }

    #[test]
    fn timestamps_persist_as_strings() {
        let json = serde_json::to_value(entry(1000, 2000)).unwrap();
        assert_eq!(json["expires_on"], "1000");
        assert_eq!(json["credential_type"], "AccessToken");
        assert_eq!(json["target"], "User.Read mail.read");

        let mut json = json;
        json["expires_on"] = serde_json::json!(1234);
        let back: AccessTokenEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.expires_on, UnixTime(1234));
    }

    #[test]
    fn credential_set_converts_relative_lifetimes() {
        let set = CredentialSet::new(
            AccessToken::from_static("at"),
            UnixTime(100),
            DurationSecs(3600),
            Some(DurationSecs(7200)),
        );
        assert_eq!(set.expires_on, UnixTime(3700));
        assert_eq!(set.extended_expires_on, UnixTime(7300));

        let no_ext = CredentialSet::new(AccessToken::from_static("at"), UnixTime(100), DurationSecs(60), None);
        assert_eq!(no_ext.extended_expires_on, UnixTime(160));
    }
}
