//! Acquiring a token for a known account without user interaction
//!
//! A cached access token is returned when one is valid beyond the
//! resilience window. Otherwise the account's refresh token is redeemed,
//! falling back to a family refresh token shared with related clients.

use std::sync::Arc;

use kagi_clock::Clock;
use kagi_oauth2::ResolvedAuthority;
use kagi_tokens::{exchange::Grant, Account, RefreshTokenEntry};
use tokio_util::sync::CancellationToken;

use super::{Acquired, Strategy};
use crate::{
    AuthError, AuthenticationRequestParameters, AuthenticationResult, ClientApplication, ClientError,
    InteractionReason, ServiceErrorKind,
};

pub(super) const STRATEGY: Strategy = Strategy {
    name: "silent",
    reads_cache: true,
    prepare,
};

fn prepare(params: &mut AuthenticationRequestParameters) -> Result<(), AuthError> {
    if params.account.is_none() {
        return Err(InteractionReason::NoAccount.into());
    }
    if params.scope.without_reserved().is_empty() {
        return Err(ClientError::EmptyScopes.into());
    }
    Ok(())
}

fn refresh_token_for<C: Clock>(
    app: &ClientApplication<C>,
    authority: &ResolvedAuthority,
    params: &AuthenticationRequestParameters,
    account: &Account,
) -> Option<RefreshTokenEntry> {
    if let Some(rt) = app.cache.find_refresh_token(&params.client_id, authority, account) {
        return Some(rt);
    }

    // An app that has never been told it belongs to a family may still be in one
    let may_use_family = app
        .cache
        .app_metadata(&params.client_id, authority)
        .map_or(true, |m| m.family_id.is_some());

    if may_use_family {
        let rt = app.cache.find_family_refresh_token(authority, account);
        if rt.is_some() {
            tracing::debug!("using family refresh token");
        }
        rt
    } else {
        None
    }
}

pub(super) async fn acquire<C: Clock + Send + Sync>(
    app: &ClientApplication<C>,
    authority: &ResolvedAuthority,
    params: &AuthenticationRequestParameters,
    cancel: &CancellationToken,
) -> Result<Acquired, AuthError> {
    let account = params.account.as_deref().ok_or(InteractionReason::NoAccount)?;

    let Some(rt) = refresh_token_for(app, authority, params, account) else {
        tracing::info!("no refresh token cached for account");
        return Err(InteractionReason::NoRefreshToken.into());
    };

    let scope = params.scope.with_reserved();
    let grant = Grant::RefreshToken {
        refresh_token: &rt.secret,
    };

    match super::exchange_grant(app, authority, params, grant, &scope, cancel).await {
        Ok(credentials) => Ok(Acquired::Issued(credentials)),
        Err(AuthError::Service(e)) if e.kind() == ServiceErrorKind::InvalidGrant => {
            tracing::info!(
                error = %e.error,
                suberror = e.suberror.as_deref(),
                "refresh token rejected; interaction required"
            );
            Err(InteractionReason::InvalidGrant(e).into())
        }
        Err(AuthError::Service(e))
            if e.kind() == ServiceErrorKind::Transient && params.extended_lifetime_enabled =>
        {
            let Some(entry) =
                app.cache
                    .find_access_token_extended(&params.client_id, authority, account, &params.scope)
            else {
                return Err(e.into());
            };

            tracing::warn!(
                error = %e,
                expires_on = entry.expires_on.0,
                extended_expires_on = entry.extended_expires_on.0,
                "service unavailable; returning access token within its extended lifetime"
            );

            let id_token = app
                .cache
                .find_id_token(&params.client_id, authority, account)
                .map(|e| e.secret);
            let mut result = AuthenticationResult::from_entry(
                entry,
                id_token,
                params.account.as_ref().map(Arc::clone),
                params.correlation_id.clone(),
            );
            result.is_extended_lifetime_token = true;
            Ok(Acquired::Cached(result))
        }
        Err(e) => Err(e),
    }
}
