//! An OAuth2 and OpenID Connect token client
//!
//! A [`ClientApplication`] acquires access tokens for users from a Microsoft
//! identity platform style authority and keeps them in a shared
//! [`TokenCache`][kagi_tokens::cache::TokenCache], so that later requests
//! can be answered without a network round trip.
//!
//! Four ways of acquiring a token are supported:
//!
//! * [`ClientApplication::acquire_token_by_authorization_code`]: redeem a
//!   code delivered to the redirect URI, with PKCE.
//! * [`ClientApplication::acquire_token_silent`]: answer from the cache,
//!   redeeming a cached refresh token when the access token is about to
//!   expire.
//! * [`ClientApplication::acquire_token_by_refresh_token`]: redeem a refresh
//!   token obtained elsewhere.
//! * [`ClientApplication::acquire_token_with_device_code`]: have the user
//!   approve the request on another device.
//!
//! Every flow fails with an [`AuthError`] whose variant says whether the
//! caller made a mistake, the service failed, or the user needs to sign in
//! interactively.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kagi::{ClientApplication, ClientConfig, SilentRequest, AuthError};
//! use kagi_oauth2::Authority;
//! use kagi_tokens::ClientId;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new(
//!     ClientId::from_static("b6c69a37-df96-4db0-9088-2ab96e1d8215"),
//!     Authority::parse("https://login.microsoftonline.com/common")?,
//! );
//! let app = ClientApplication::new(config, Arc::new(reqwest::Client::new()))?;
//!
//! let account = app.get_accounts().await.into_iter().next();
//! match app
//!     .acquire_token_silent(SilentRequest::new(account, "user.read".parse()?))
//!     .await
//! {
//!     Ok(token) => println!("{}", token.authorization_header()),
//!     Err(AuthError::InteractionRequired(reason)) => println!("sign in required: {reason}"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
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

mod client;
mod config;
pub mod discovery;
pub mod error;
mod flows;
mod params;

pub use client::ClientApplication;
pub use config::{ClientConfig, DEFAULT_AUTHORITY};
pub use error::{AuthError, ClientError, InteractionReason, ServiceError, ServiceErrorKind};
pub use kagi_clock;
pub use kagi_oauth2;
pub use kagi_tokens;
pub use params::{
    AuthenticationResult, AuthorizationCodeRequest, DeviceCodeCallback, DeviceCodeRequest, RefreshTokenRequest,
    RequestOptions, SilentRequest,
};
pub(crate) use params::{AuthenticationRequestParameters, RequestGrant};
