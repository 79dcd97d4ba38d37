//! Redeeming an authorization code delivered to the redirect URI

use kagi_clock::Clock;
use kagi_oauth2::{
    authority::validate_redirect_uri, pkce::CodeVerifierRef, InvalidRedirectUri, ResolvedAuthority,
};
use kagi_tokens::{exchange::Grant, AuthorizationCodeRef};
use tokio_util::sync::CancellationToken;

use super::{Acquired, Strategy};
use crate::{AuthError, AuthenticationRequestParameters, ClientApplication, ClientError, RequestGrant};

pub(super) const STRATEGY: Strategy = Strategy {
    name: "authorization_code",
    reads_cache: false,
    prepare,
};

fn prepare(params: &mut AuthenticationRequestParameters) -> Result<(), AuthError> {
    let redirect_uri = params
        .redirect_uri
        .as_deref()
        .ok_or(ClientError::InvalidRedirectUri(InvalidRedirectUri::Empty))?;
    validate_redirect_uri(redirect_uri).map_err(ClientError::from)?;

    if let RequestGrant::AuthorizationCode { code, .. } = &params.grant {
        if code.as_str().trim().is_empty() {
            return Err(ClientError::MissingAuthorizationCode.into());
        }
    }
    Ok(())
}

/// Redeems the code; the tokens are filed under the account described by
/// the returned ID token
pub(super) async fn acquire<C: Clock + Send + Sync>(
    app: &ClientApplication<C>,
    authority: &ResolvedAuthority,
    params: &AuthenticationRequestParameters,
    code: &AuthorizationCodeRef,
    code_verifier: Option<&CodeVerifierRef>,
    cancel: &CancellationToken,
) -> Result<Acquired, AuthError> {
    let grant = Grant::AuthorizationCode {
        code,
        redirect_uri: params.redirect_uri.as_deref().unwrap_or_default(),
        code_verifier,
    };

    let scope = params.scope.with_reserved();
    let credentials = super::exchange_grant(app, authority, params, grant, &scope, cancel).await?;
    Ok(Acquired::Issued(credentials))
}
