//! Authority parsing, classification, and endpoint resolution
//!
//! An authority identifies the identity provider that a token request
//! targets: a host plus a tenant, or a tenant and policy pair for
//! policy-based directories. Parsing is pure; no network access happens here.

use std::fmt;

use thiserror::Error;
use url::Url;

use crate::Scope;

/// Tenants that address more than one directory
pub const MULTI_TENANT_ALIASES: [&str; 3] = ["common", "organizations", "consumers"];

/// The authority string was not acceptable
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The authority was empty or only whitespace
    #[error("authority cannot be empty")]
    Empty,
    /// The authority could not be parsed as a URL
    #[error("authority is not a valid URL")]
    Malformed(#[from] url::ParseError),
    /// The authority does not use HTTPS
    #[error("authority must use https, found '{0}'")]
    NotHttps(String),
    /// The authority does not name a host
    #[error("authority must include a host")]
    MissingHost,
    /// The authority does not include a tenant path segment
    #[error("authority must include a tenant path segment, e.g. https://login.microsoftonline.com/common/")]
    MissingTenant,
    /// The authority carries a query string or fragment
    #[error("authority must not include a query string or fragment")]
    QueryOrFragment,
    /// A policy-based authority must include both a tenant and a policy
    #[error("policy-based authority must be of the form https://<host>/tfp/<tenant>/<policy>/")]
    MissingPolicy,
    /// Instance discovery does not recognize the host
    #[error("authority host '{0}' is not a trusted instance")]
    NotTrusted(String),
}

/// The redirect URI was not acceptable
#[derive(Debug, Error)]
pub enum InvalidRedirectUri {
    /// The redirect URI was empty or only whitespace
    #[error("redirect URI cannot be empty")]
    Empty,
    /// The redirect URI is not an absolute URI
    #[error("redirect URI is not an absolute URI")]
    Malformed(#[from] url::ParseError),
    /// The redirect URI carries a fragment, which authorization responses
    /// cannot be reliably parsed past
    #[error("redirect URI must not contain a fragment")]
    ContainsFragment,
}

/// Validates a redirect URI
///
/// The URI must be non-blank, absolute, and free of any fragment. The caller
/// should continue to send the original string on the wire, as the identity
/// service matches redirect URIs exactly.
pub fn validate_redirect_uri(raw: &str) -> Result<(), InvalidRedirectUri> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidRedirectUri::Empty);
    }

    if trimmed.contains('#') {
        return Err(InvalidRedirectUri::ContainsFragment);
    }

    let url = Url::parse(trimmed)?;
    if url.fragment().is_some() {
        return Err(InvalidRedirectUri::ContainsFragment);
    }

    Ok(())
}

/// The shape of an authority
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuthorityKind {
    /// A standard directory authority, addressed by tenant
    Aad {
        /// The tenant id, domain, or multi-tenant alias
        tenant: String,
    },
    /// A policy-qualified authority
    B2c {
        /// The tenant
        tenant: String,
        /// The user-flow policy id
        policy: String,
    },
    /// A federation services authority
    Adfs,
}

/// A parsed and normalized authority
///
/// The canonical form is `https://<lowercase host>/<segments>/` with a single
/// trailing slash.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    canonical: Url,
    kind: AuthorityKind,
}

impl Authority {
    /// Parses and classifies an authority
    pub fn parse(raw: &str) -> Result<Self, AuthorityError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AuthorityError::Empty);
        }

        let url = Url::parse(raw)?;
        if url.scheme() != "https" {
            return Err(AuthorityError::NotHttps(url.scheme().to_owned()));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(AuthorityError::QueryOrFragment);
        }
        let host = url.host_str().ok_or(AuthorityError::MissingHost)?;

        let segments: Vec<String> = url
            .path_segments()
            .map(|s| {
                s.filter(|s| !s.is_empty())
                    .map(str::to_ascii_lowercase)
                    .collect()
            })
            .unwrap_or_default();

        let first = segments.first().ok_or(AuthorityError::MissingTenant)?;

        let (kind, kept) = if first == "adfs" {
            (AuthorityKind::Adfs, 1)
        } else if first == "tfp" {
            match (segments.get(1), segments.get(2)) {
                (Some(tenant), Some(policy)) => (
                    AuthorityKind::B2c {
                        tenant: tenant.clone(),
                        policy: policy.clone(),
                    },
                    3,
                ),
                _ => return Err(AuthorityError::MissingPolicy),
            }
        } else if host.ends_with(".b2clogin.com") {
            match segments.get(1) {
                Some(policy) => (
                    AuthorityKind::B2c {
                        tenant: first.clone(),
                        policy: policy.clone(),
                    },
                    2,
                ),
                None => return Err(AuthorityError::MissingPolicy),
            }
        } else {
            (
                AuthorityKind::Aad {
                    tenant: first.clone(),
                },
                1,
            )
        };

        let mut canonical = String::with_capacity(raw.len() + 1);
        canonical.push_str("https://");
        canonical.push_str(host);
        if let Some(port) = url.port() {
            canonical.push(':');
            canonical.push_str(&port.to_string());
        }
        canonical.push('/');
        for segment in segments.iter().take(kept) {
            canonical.push_str(segment);
            canonical.push('/');
        }

        let canonical = Url::parse(&canonical)?;

        tracing::trace!(authority = %canonical, ?kind, "parsed authority");

        Ok(Self { canonical, kind })
    }

    /// The canonical authority URL
    #[inline]
    pub fn as_str(&self) -> &str {
        self.canonical.as_str()
    }

    /// The authority host, lowercased
    #[inline]
    pub fn host(&self) -> &str {
        self.canonical.host_str().unwrap_or_default()
    }

    /// The authority kind
    #[inline]
    pub fn kind(&self) -> &AuthorityKind {
        &self.kind
    }

    /// The tenant addressed by this authority, if it has one
    pub fn tenant(&self) -> Option<&str> {
        match &self.kind {
            AuthorityKind::Aad { tenant } | AuthorityKind::B2c { tenant, .. } => Some(tenant),
            AuthorityKind::Adfs => None,
        }
    }

    /// Whether the authority addresses more than one directory
    pub fn is_multi_tenant(&self) -> bool {
        match &self.kind {
            AuthorityKind::Aad { tenant } => MULTI_TENANT_ALIASES.contains(&tenant.as_str()),
            _ => false,
        }
    }

    /// Re-targets a multi-tenant authority at a specific tenant
    ///
    /// Authorities that already address a single tenant are returned
    /// unchanged.
    pub fn with_tenant(&self, tenant: &str) -> Self {
        if !self.is_multi_tenant() || tenant.trim().is_empty() {
            return self.clone();
        }

        let tenant = tenant.trim().to_ascii_lowercase();
        let mut canonical = self.canonical.clone();
        canonical.set_path(&format!("/{}/", tenant));
        Self {
            canonical,
            kind: AuthorityKind::Aad { tenant },
        }
    }

    /// Replaces the host, keeping tenant and kind
    ///
    /// Used to send requests to the preferred network alias of a host.
    pub fn with_host(&self, host: &str) -> Self {
        let mut canonical = self.canonical.clone();
        if canonical.set_host(Some(host)).is_err() {
            return self.clone();
        }
        Self {
            canonical,
            kind: self.kind.clone(),
        }
    }

    fn endpoint(&self, name: &str) -> Url {
        let relative = match self.kind {
            AuthorityKind::Adfs => format!("oauth2/{}", name),
            _ => format!("oauth2/v2.0/{}", name),
        };
        // The canonical form always ends in a slash, so joining appends
        self.canonical
            .join(&relative)
            .unwrap_or_else(|_| self.canonical.clone())
    }

    /// The token endpoint
    pub fn token_endpoint(&self) -> Url {
        self.endpoint("token")
    }

    /// The device code endpoint
    pub fn device_code_endpoint(&self) -> Url {
        self.endpoint("devicecode")
    }

    /// The authorization endpoint
    pub fn authorization_endpoint(&self) -> Url {
        self.endpoint("authorize")
    }

    /// Builds the URL that an interactive surface should navigate to in
    /// order to obtain an authorization code
    pub fn authorization_url(&self, request: &AuthorizationUrlRequest<'_>) -> Url {
        let mut url = self.authorization_endpoint();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", request.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", request.redirect_uri)
                .append_pair("scope", &request.scope.with_reserved().to_string())
                .append_pair("client_info", "1");
            if let Some(challenge) = request.code_challenge {
                query
                    .append_pair("code_challenge", challenge)
                    .append_pair("code_challenge_method", "S256");
            }
            if let Some(state) = request.state {
                query.append_pair("state", state);
            }
            if let Some(login_hint) = request.login_hint {
                query.append_pair("login_hint", login_hint);
            }
            for (k, v) in request.extra_query_parameters {
                query.append_pair(k, v);
            }
        }
        url
    }
}

impl fmt::Debug for Authority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Authority").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Authority {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Inputs to [`Authority::authorization_url()`]
#[derive(Clone, Copy, Debug)]
pub struct AuthorizationUrlRequest<'a> {
    /// The requesting client
    pub client_id: &'a str,
    /// The redirect URI, exactly as registered
    pub redirect_uri: &'a str,
    /// The requested scopes; reserved OIDC scopes are added automatically
    pub scope: &'a Scope,
    /// The PKCE `S256` challenge
    pub code_challenge: Option<&'a str>,
    /// The CSRF state
    pub state: Option<&'a str>,
    /// A hint for the account to sign in
    pub login_hint: Option<&'a str>,
    /// Additional query parameters passed through verbatim
    pub extra_query_parameters: &'a [(String, String)],
}

/// Instance metadata for an authority host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceMetadata {
    /// The host that network requests should be sent to
    pub preferred_network: String,
    /// The environment that cache entries are written under
    pub preferred_cache: String,
    /// All hosts that are equivalent to this one
    pub aliases: Vec<String>,
}

impl InstanceMetadata {
    /// Metadata for a host that is only an alias of itself
    pub fn self_aliased(host: &str) -> Self {
        let host = host.to_ascii_lowercase();
        Self {
            preferred_network: host.clone(),
            preferred_cache: host.clone(),
            aliases: vec![host],
        }
    }

    /// Whether `environment` is one of the aliases
    pub fn is_alias(&self, environment: &str) -> bool {
        self.aliases
            .iter()
            .any(|a| a.eq_ignore_ascii_case(environment))
    }
}

/// An authority together with the instance metadata of its host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAuthority {
    /// The authority as requested
    pub authority: Authority,
    /// Metadata for the authority host
    pub metadata: InstanceMetadata,
}

impl ResolvedAuthority {
    /// Pairs an authority with metadata obtained elsewhere
    pub fn new(authority: Authority, metadata: InstanceMetadata) -> Self {
        Self {
            authority,
            metadata,
        }
    }

    /// Resolves an authority from the well-known host table, treating any
    /// other host as an alias only of itself
    pub fn from_static(authority: Authority) -> Self {
        let metadata = known_instance_metadata(authority.host())
            .unwrap_or_else(|| InstanceMetadata::self_aliased(authority.host()));
        Self::new(authority, metadata)
    }

    /// The environment that cache entries are written under
    #[inline]
    pub fn environment(&self) -> &str {
        &self.metadata.preferred_cache
    }

    /// Whether a cache entry written under `environment` belongs to this
    /// authority's host
    #[inline]
    pub fn matches_environment(&self, environment: &str) -> bool {
        self.metadata.is_alias(environment)
    }

    /// The authority that network requests should be sent to
    pub fn network_authority(&self) -> Authority {
        if self
            .authority
            .host()
            .eq_ignore_ascii_case(&self.metadata.preferred_network)
        {
            self.authority.clone()
        } else {
            self.authority.with_host(&self.metadata.preferred_network)
        }
    }

    /// Re-targets a multi-tenant authority at a specific tenant
    pub fn with_tenant(&self, tenant: &str) -> Self {
        Self::new(self.authority.with_tenant(tenant), self.metadata.clone())
    }
}

const KNOWN_CLOUDS: &[(&str, &str, &[&str])] = &[
    (
        "login.microsoftonline.com",
        "login.windows.net",
        &[
            "login.microsoftonline.com",
            "login.windows.net",
            "login.microsoft.com",
            "sts.windows.net",
        ],
    ),
    (
        "login.partner.microsoftonline.cn",
        "login.partner.microsoftonline.cn",
        &["login.partner.microsoftonline.cn", "login.chinacloudapi.cn"],
    ),
    (
        "login.microsoftonline.de",
        "login.microsoftonline.de",
        &["login.microsoftonline.de"],
    ),
    (
        "login.microsoftonline.us",
        "login.microsoftonline.us",
        &["login.microsoftonline.us", "login.usgovcloudapi.net"],
    ),
];

/// Metadata for well-known cloud hosts, available without network access
pub fn known_instance_metadata(host: &str) -> Option<InstanceMetadata> {
    KNOWN_CLOUDS
        .iter()
        .find(|(_, _, aliases)| aliases.iter().any(|a| a.eq_ignore_ascii_case(host)))
        .map(|(network, cache, aliases)| InstanceMetadata {
            preferred_network: (*network).to_owned(),
            preferred_cache: (*cache).to_owned(),
            aliases: aliases.iter().map(|&a| a.to_owned()).collect(),
        })
}

/// Whether the host is a well-known cloud host
#[inline]
pub fn is_known_host(host: &str) -> bool {
    known_instance_metadata(host).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_standard_authority() {
        let a = Authority::parse("https://Login.MicrosoftOnline.com/Contoso.onmicrosoft.com").unwrap();
        assert_eq!(a.as_str(), "https://login.microsoftonline.com/contoso.onmicrosoft.com/");
        assert_eq!(a.host(), "login.microsoftonline.com");
        assert_eq!(a.tenant(), Some("contoso.onmicrosoft.com"));
        assert!(!a.is_multi_tenant());
    }

    #[test]
    fn extra_segments_are_dropped() {
        let a = Authority::parse("https://login.microsoftonline.com/common/oauth2/v2.0/").unwrap();
        assert_eq!(a.as_str(), "https://login.microsoftonline.com/common/");
    }

    #[test]
    fn classifies_multi_tenant_aliases() {
        for tenant in MULTI_TENANT_ALIASES {
            let a = Authority::parse(&format!("https://login.microsoftonline.com/{}/", tenant)).unwrap();
            assert!(a.is_multi_tenant(), "{} should be multi-tenant", tenant);
        }
    }

    #[test]
    fn classifies_policy_authority() {
        let a = Authority::parse("https://login.microsoftonline.com/tfp/contoso.onmicrosoft.com/B2C_1_SignIn").unwrap();
        assert_eq!(
            a.kind(),
            &AuthorityKind::B2c {
                tenant: "contoso.onmicrosoft.com".to_owned(),
                policy: "b2c_1_signin".to_owned(),
            }
        );
        assert_eq!(
            a.token_endpoint().as_str(),
            "https://login.microsoftonline.com/tfp/contoso.onmicrosoft.com/b2c_1_signin/oauth2/v2.0/token"
        );

        let b = Authority::parse("https://contoso.b2clogin.com/contoso.onmicrosoft.com/b2c_1_signin").unwrap();
        assert!(matches!(b.kind(), AuthorityKind::B2c { .. }));
    }

    #[test]
    fn policy_authority_requires_policy() {
        let err = Authority::parse("https://login.microsoftonline.com/tfp/contoso.onmicrosoft.com").unwrap_err();
        assert!(matches!(err, AuthorityError::MissingPolicy));
    }

    #[test]
    fn classifies_adfs() {
        let a = Authority::parse("https://fs.contoso.com/adfs/").unwrap();
        assert_eq!(a.kind(), &AuthorityKind::Adfs);
        assert_eq!(a.tenant(), None);
        assert_eq!(a.token_endpoint().as_str(), "https://fs.contoso.com/adfs/oauth2/token");
    }

    #[test]
    fn rejects_bad_authorities() {
        assert!(matches!(Authority::parse("  "), Err(AuthorityError::Empty)));
        assert!(matches!(Authority::parse("not a url"), Err(AuthorityError::Malformed(_))));
        assert!(matches!(
            Authority::parse("http://login.microsoftonline.com/common"),
            Err(AuthorityError::NotHttps(_))
        ));
        assert!(matches!(
            Authority::parse("https://login.microsoftonline.com/"),
            Err(AuthorityError::MissingTenant)
        ));
        assert!(matches!(
            Authority::parse("https://login.microsoftonline.com/common?x=1"),
            Err(AuthorityError::QueryOrFragment)
        ));
    }

    #[test]
    fn derives_endpoints() {
        let a = Authority::parse("https://login.microsoftonline.com/common").unwrap();
        assert_eq!(
            a.token_endpoint().as_str(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
        assert_eq!(
            a.device_code_endpoint().as_str(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/devicecode"
        );
    }

    #[test]
    fn retargets_multi_tenant_only() {
        let common = Authority::parse("https://login.microsoftonline.com/common").unwrap();
        let home = common.with_tenant("72F988BF-86F1-41AF-91AB-2D7CD011DB47");
        assert_eq!(
            home.as_str(),
            "https://login.microsoftonline.com/72f988bf-86f1-41af-91ab-2d7cd011db47/"
        );

        let fixed = Authority::parse("https://login.microsoftonline.com/contoso.com").unwrap();
        assert_eq!(fixed.with_tenant("other"), fixed);
    }

    #[test]
    fn swaps_host() {
        let a = Authority::parse("https://login.windows.net/common").unwrap();
        let b = a.with_host("login.microsoftonline.com");
        assert_eq!(b.as_str(), "https://login.microsoftonline.com/common/");
    }

    #[test]
    fn redirect_uri_validation() {
        assert!(validate_redirect_uri("https://localhost/callback").is_ok());
        assert!(validate_redirect_uri("urn:ietf:wg:oauth:2.0:oob").is_ok());
        assert!(validate_redirect_uri("msalb6c69a37://auth").is_ok());
        assert!(validate_redirect_uri("http://app.contoso.com/cb").is_ok());
        assert!(matches!(validate_redirect_uri(""), Err(InvalidRedirectUri::Empty)));
        assert!(matches!(validate_redirect_uri("   "), Err(InvalidRedirectUri::Empty)));
        assert!(matches!(
            validate_redirect_uri("https://x/cb#frag"),
            Err(InvalidRedirectUri::ContainsFragment)
        ));
        assert!(matches!(
            validate_redirect_uri("https://x/cb#"),
            Err(InvalidRedirectUri::ContainsFragment)
        ));
        assert!(matches!(validate_redirect_uri("/relative/cb"), Err(InvalidRedirectUri::Malformed(_))));
    }

    #[test]
    fn known_hosts_share_metadata() {
        let a = known_instance_metadata("login.microsoftonline.com").unwrap();
        let b = known_instance_metadata("STS.windows.net").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.preferred_cache, "login.windows.net");
        assert!(a.is_alias("login.microsoft.com"));
        assert!(!is_known_host("login.contoso.com"));
    }

    #[test]
    fn builds_authorization_url() {
        let a = Authority::parse("https://login.microsoftonline.com/common").unwrap();
        let scope: Scope = "user.read".parse().unwrap();
        let url = a.authorization_url(&AuthorizationUrlRequest {
            client_id: "client",
            redirect_uri: "https://localhost/cb",
            scope: &scope,
            code_challenge: Some("challenge"),
            state: Some("state"),
            login_hint: None,
            extra_query_parameters: &[("dc".to_owned(), "prod".to_owned())],
        });

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("scope".to_owned(), "user.read openid profile offline_access".to_owned())));
        assert!(pairs.contains(&("code_challenge_method".to_owned(), "S256".to_owned())));
        assert!(pairs.contains(&("dc".to_owned(), "prod".to_owned())));
        assert!(url.as_str().starts_with("https://login.microsoftonline.com/common/oauth2/v2.0/authorize?"));
    }

    #[test]
    fn resolved_authority_sends_to_preferred_network() {
        let a = Authority::parse("https://login.windows.net/contoso.com").unwrap();
        let resolved = ResolvedAuthority::from_static(a);
        assert_eq!(resolved.environment(), "login.windows.net");
        assert!(resolved.matches_environment("login.microsoftonline.com"));
        assert_eq!(
            resolved.network_authority().as_str(),
            "https://login.microsoftonline.com/contoso.com/"
        );

        let custom = ResolvedAuthority::from_static(Authority::parse("https://login.contoso.com/tenant").unwrap());
        assert_eq!(custom.environment(), "login.contoso.com");
        assert!(!custom.matches_environment("login.windows.net"));
    }
}
