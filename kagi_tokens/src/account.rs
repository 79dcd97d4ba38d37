//! Accounts and the claims they are derived from

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{HomeAccountId, HomeAccountIdRef, IdTokenRef};

/// A JWT or `client_info` payload could not be decoded
#[derive(Debug, Error)]
pub enum ClaimsError {
    /// The token did not have three dot-separated segments
    #[error("token is not a compact JWT")]
    NotAJwt,
    /// The payload was not valid base64url
    #[error("token payload is not valid base64url")]
    Base64(#[from] base64::DecodeError),
    /// The payload was not the expected JSON
    #[error("token payload is not valid JSON")]
    Json(#[from] serde_json::Error),
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, ClaimsError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The subset of ID token claims used to identify an account
///
/// The ID token is not validated here; it was received directly from the
/// token endpoint over TLS, and only identifying claims are read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct IdTokenClaims {
    /// Object id of the user in the tenant
    #[serde(default)]
    pub oid: Option<String>,
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Tenant id
    #[serde(default)]
    pub tid: Option<String>,
    /// Display username
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// User principal name, used when `preferred_username` is absent
    #[serde(default)]
    pub upn: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

impl IdTokenClaims {
    /// Decodes the payload of an ID token
    pub fn parse(id_token: &IdTokenRef) -> Result<Self, ClaimsError> {
        let mut parts = id_token.as_str().split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => decode_segment(payload),
            _ => Err(ClaimsError::NotAJwt),
        }
    }

    /// The identifier of the user local to the issuing tenant
    pub fn local_account_id(&self) -> Option<&str> {
        self.oid.as_deref().or(self.sub.as_deref())
    }

    /// The username to display for the user
    pub fn username(&self) -> &str {
        self.preferred_username
            .as_deref()
            .or(self.upn.as_deref())
            .unwrap_or_default()
    }
}

/// The `client_info` value returned by the token endpoint
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    /// The user's object id in their home tenant
    pub uid: String,
    /// The user's home tenant id
    pub utid: String,
}

impl ClientInfo {
    /// Decodes a base64url encoded `client_info` value
    pub fn parse(raw: &str) -> Result<Self, ClaimsError> {
        decode_segment(raw)
    }

    /// The home account id: `<uid>.<utid>`
    pub fn home_account_id(&self) -> HomeAccountId {
        HomeAccountId::new(format!("{}.{}", self.uid, self.utid))
    }
}

/// A signed-in end user
///
/// Accounts are owned by the token cache and handed out as shared references;
/// they are replaced wholesale when new tokens for the user arrive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier across tenants
    pub home_account_id: HomeAccountId,
    /// The authority host the account was obtained from
    pub environment: String,
    /// The tenant the account was obtained in
    pub realm: String,
    /// The identifier of the user within `realm`
    #[serde(default)]
    pub local_account_id: String,
    /// Display username
    #[serde(default)]
    pub username: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Either `MSSTS` or `ADFS`
    #[serde(default = "default_authority_type")]
    pub authority_type: String,

    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

fn default_authority_type() -> String {
    "MSSTS".to_owned()
}

impl Account {
    /// Constructs an account with the identifying fields
    pub fn new(
        home_account_id: HomeAccountId,
        environment: impl Into<String>,
        realm: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            home_account_id,
            environment: environment.into().to_ascii_lowercase(),
            realm: realm.into().to_ascii_lowercase(),
            local_account_id: String::new(),
            username: username.into(),
            name: None,
            authority_type: default_authority_type(),
            extra: BTreeMap::new(),
        }
    }

    /// The home account id
    #[inline]
    pub fn home_account_id(&self) -> &HomeAccountIdRef {
        &self.home_account_id
    }

    /// The home tenant, taken from the home account id
    pub fn home_tenant(&self) -> Option<&str> {
        self.home_account_id
            .as_str()
            .split_once('.')
            .map(|(_, tenant)| tenant)
            .filter(|t| !t.is_empty())
    }

    /// The deterministic key for this account in the persisted cache
    pub fn cache_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.home_account_id.as_str(),
            self.environment,
            self.realm
        )
        .to_ascii_lowercase()
    }
}
