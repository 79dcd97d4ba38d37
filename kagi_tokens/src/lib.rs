//! Token storage and token endpoint exchange for the `kagi` token client
//!
//! This crate holds the stateful half of an OAuth2 public or confidential
//! client:
//!
//! * [`cache`]: a shared, concurrency-safe [`TokenCache`][cache::TokenCache]
//!   of access, refresh and ID tokens, accounts, and app metadata, with
//!   expiry and scope-superset matching and a stable persisted form.
//! * [`exchange`]: building token endpoint requests for each grant type and
//!   turning the responses into [`CredentialSet`]s.
//! * [`transport`]: the [`HttpTransport`][transport::HttpTransport]
//!   contract all network traffic goes through, implemented for
//!   `reqwest::Client` with the `reqwest` feature.
//! * [`persistence`]: keeping the cache in a file, or anywhere else, between
//!   runs.
//!
//! Secrets such as access and refresh tokens are wrapped in types whose
//! `Debug` and `Display` output is redacted, so they can be freely passed to
//! `tracing`. Use the alternate flag (`{:#?}`) to reveal a short prefix.
//!
//! ```
//! use kagi_oauth2::{Authority, ResolvedAuthority};
//! use kagi_tokens::{cache::{CacheConfig, TokenCache}, Account, ClientId, HomeAccountId};
//!
//! let cache = TokenCache::new(CacheConfig::default());
//! let authority = ResolvedAuthority::from_static(
//!     Authority::parse("https://login.microsoftonline.com/common")?,
//! );
//! let account = Account::new(
//!     HomeAccountId::from_static("uid.utid"),
//!     "login.windows.net",
//!     "utid",
//!     "ada@contoso.com",
//! );
//! let scope = "user.read".parse()?;
//!
//! let token = cache.find_access_token(&ClientId::from_static("client"), &authority, &account, &scope);
//! assert!(token.is_none());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod account;
mod braids;
pub mod cache;
mod entries;
pub mod exchange;
pub mod persistence;
pub mod transport;

pub use account::{Account, ClaimsError, ClientInfo, IdTokenClaims};
pub use braids::*;
pub use entries::{
    AccessTokenEntry, AppMetadataEntry, CredentialSet, CredentialType, IdTokenEntry,
    RefreshTokenEntry, TokenStatus,
};
