//! DTOs for interacting with the token and device authorization endpoints

use std::fmt;

use kagi_clock::DurationSecs;
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::{AccessToken, DeviceCode, IdToken, RefreshToken};

/// Some services send lifetimes as strings
fn flexible_secs<'de, D: Deserializer<'de>>(d: D) -> Result<DurationSecs, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(DurationSecs(n)),
        Raw::Str(s) => s.trim().parse().map(DurationSecs).map_err(de::Error::custom),
    }
}

fn flexible_secs_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DurationSecs>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "flexible_secs")] DurationSecs);

    Ok(Option::<Wrapper>::deserialize(d)?.map(|Wrapper(s)| s))
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(deserialize_with = "flexible_secs")]
    pub expires_in: DurationSecs,
    #[serde(default, deserialize_with = "flexible_secs_opt")]
    pub ext_expires_in: Option<DurationSecs>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub id_token: Option<IdToken>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub client_info: Option<String>,
    #[serde(default)]
    pub foci: Option<String>,
}

/// An OAuth2 error response
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    /// The OAuth2 error code, such as `invalid_grant`
    pub error: String,
    /// A human readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    /// Service-specific numeric error codes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_codes: Vec<i64>,
    /// A more specific classification of the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suberror: Option<String>,
    /// The service's trace identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// The correlation id echoed by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// A claims challenge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<String>,
}

impl ErrorResponse {
    /// An error response carrying only a code
    pub fn from_code(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.error)?;
        if let Some(desc) = &self.error_description {
            write!(f, ": {}", desc)?;
        }
        Ok(())
    }
}

fn default_interval() -> DurationSecs {
    DurationSecs(5)
}

/// Information about a pending device code authorization
///
/// The user must visit `verification_uri` and enter `user_code`.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceCodeInfo {
    /// The code the client polls with
    pub device_code: DeviceCode,
    /// The code the user enters
    pub user_code: String,
    /// Where the user enters the code
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    /// How long the device code stays valid
    #[serde(deserialize_with = "flexible_secs")]
    pub expires_in: DurationSecs,
    /// The minimum time between polls
    #[serde(default = "default_interval", deserialize_with = "flexible_secs")]
    pub interval: DurationSecs,
    /// Instructions to show the user
    #[serde(default)]
    pub message: Option<String>,
}
