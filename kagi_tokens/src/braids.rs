use std::fmt;

use aliri_braid::braid;

/// Formats a credential without exposing it
///
/// Plain formatting prints only the label. The alternate `Debug` form shows
/// the first `reveal` characters (or as many as the formatter width asks
/// for); the alternate `Display` form prints the whole value.
struct Redacted<'a> {
    label: &'static str,
    value: &'a str,
    reveal: usize,
}

impl Redacted<'_> {
    fn write_prefix(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reveal = f.width().unwrap_or(self.reveal);
        match self.value.char_indices().nth(reveal) {
            Some((cut, _)) => write!(f, "{}…", &self.value[..cut]),
            None => f.write_str(self.value),
        }
    }
}

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !f.alternate() {
            return write!(f, "***{}***", self.label);
        }
        f.write_str("\"")?;
        self.write_prefix(f)?;
        f.write_str("\"")
    }
}

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            f.write_str(self.value)
        } else {
            write!(f, "***{}***", self.label)
        }
    }
}

macro_rules! redacted {
    ($ty:ty, $label:literal, reveal = $reveal:literal) => {
        impl $ty {
            fn redacted(&self) -> Redacted<'_> {
                Redacted {
                    label: $label,
                    value: self.as_str(),
                    reveal: $reveal,
                }
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.redacted(), f)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.redacted(), f)
            }
        }
    };
}

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

redacted!(ClientSecretRef, "CLIENT SECRET", reveal = 4);

/// An OAuth2 authorization code
#[braid(serde, debug = "owned", display = "owned")]
pub struct AuthorizationCode;

redacted!(AuthorizationCodeRef, "AUTHORIZATION CODE", reveal = 4);

/// A device code, as issued by the device authorization endpoint
#[braid(serde, debug = "owned", display = "owned")]
pub struct DeviceCode;

redacted!(DeviceCodeRef, "DEVICE CODE", reveal = 4);

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef, "ACCESS TOKEN", reveal = 12);

/// An OpenID Connect ID token
#[braid(serde)]
pub struct IdToken;

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef, "REFRESH TOKEN", reveal = 4);

/// A stable identifier for an account across tenants
///
/// Usually of the form `<object id>.<home tenant id>`.
#[braid(serde)]
pub struct HomeAccountId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_hidden_by_default() {
        let token = AccessToken::from_static("eyJ0eXAiOiJKV1QiLCJhbGciOiJSUzI1NiJ9.payload.signature");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_reveals_a_prefix() {
        let token = RefreshToken::from_static("0.AAAAabcdefghijkl");
        assert_eq!(format!("{:#?}", token), "\"0.AA…\"");
        assert_eq!(format!("{:#}", token), "0.AAAAabcdefghijkl");
        assert_eq!(format!("{:#8?}", token), "\"0.AAAAab…\"");
    }

    #[test]
    fn short_secrets_are_not_elided() {
        let code = AuthorizationCode::from_static("abc");
        assert_eq!(format!("{:#?}", code), "\"abc\"");
    }

    #[test]
    fn identifiers_are_plain() {
        let id = ClientId::from_static("b6c69a37-df96-4db0-9088-2ab96e1d8215");
        assert_eq!(format!("{}", id), "b6c69a37-df96-4db0-9088-2ab96e1d8215");
    }
}
