//! OAuth2 building blocks for the `kagi` token client
//!
//! This crate holds the parts of an OAuth2 client that need no network and
//! no shared state:
//!
//! * [`authority`]: parsing, classification, and endpoint resolution for
//!   the identity authority a request targets, plus redirect URI validation.
//! * [`scope`]: case-insensitive, ordered, duplicate-free scope sets.
//! * [`pkce`]: verifier and challenge generation for
//!   Proof Key for Code Exchange.

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

pub mod authority;
pub mod pkce;
pub mod scope;

pub use authority::{
    Authority, AuthorityError, AuthorityKind, InstanceMetadata, InvalidRedirectUri,
    ResolvedAuthority,
};
pub use scope::{Scope, ScopeToken, ScopeTokenRef};
