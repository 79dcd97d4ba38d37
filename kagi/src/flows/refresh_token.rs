//! Redeeming a refresh token obtained outside this library
//!
//! Used when migrating from another token store. The cache is never
//! consulted; the redeemed tokens are filed under the account described by
//! the returned ID token.

use kagi_clock::Clock;
use kagi_oauth2::{ResolvedAuthority, ScopeToken};
use kagi_tokens::{exchange::Grant, RefreshTokenRef};
use tokio_util::sync::CancellationToken;

use super::{Acquired, Strategy};
use crate::{AuthError, AuthenticationRequestParameters, ClientApplication, ClientError, RequestGrant};

pub(super) const STRATEGY: Strategy = Strategy {
    name: "refresh_token",
    reads_cache: false,
    prepare,
};

fn prepare(params: &mut AuthenticationRequestParameters) -> Result<(), AuthError> {
    if let RequestGrant::RefreshToken { refresh_token } = &params.grant {
        if refresh_token.as_str().trim().is_empty() {
            return Err(ClientError::MissingRefreshToken.into());
        }
    }

    if params.scope.without_reserved().is_empty() {
        let default = ScopeToken::new(format!("{}/.default", params.client_id))
            .map_err(|_| ClientError::EmptyScopes)?;
        tracing::info!(scope = %default, "no scopes requested; using the client's default scope");
        params.scope.insert(default);
    }

    Ok(())
}

pub(super) async fn acquire<C: Clock + Send + Sync>(
    app: &ClientApplication<C>,
    authority: &ResolvedAuthority,
    params: &AuthenticationRequestParameters,
    refresh_token: &RefreshTokenRef,
    cancel: &CancellationToken,
) -> Result<Acquired, AuthError> {
    let scope = params.scope.with_reserved();
    let grant = Grant::RefreshToken { refresh_token };
    let credentials = super::exchange_grant(app, authority, params, grant, &scope, cancel).await?;
    Ok(Acquired::Issued(credentials))
}
