//! The device authorization grant
//!
//! The service issues a device code and a short user code. The user enters
//! the user code on another device while this flow polls the token endpoint
//! at the interval the service asked for, backing off when told to slow
//! down, until the user approves, declines, or the code expires.

use std::time::Duration;

use kagi_clock::{Clock, DurationSecs};
use kagi_oauth2::ResolvedAuthority;
use kagi_tokens::exchange::{self, Grant};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{cancellable, Acquired, Strategy};
use crate::{
    error::EXPIRED_TOKEN, AuthError, AuthenticationRequestParameters, ClientApplication, ClientError,
    DeviceCodeCallback, ServiceError,
};

const AUTHORIZATION_PENDING: &str = "authorization_pending";
const SLOW_DOWN: &str = "slow_down";
const SLOW_DOWN_INCREMENT: DurationSecs = DurationSecs(5);

pub(super) const STRATEGY: Strategy = Strategy {
    name: "device_code",
    reads_cache: false,
    prepare,
};

fn prepare(params: &mut AuthenticationRequestParameters) -> Result<(), AuthError> {
    if params.scope.without_reserved().is_empty() {
        return Err(ClientError::EmptyScopes.into());
    }
    Ok(())
}

pub(super) async fn acquire<C: Clock + Send + Sync>(
    app: &ClientApplication<C>,
    authority: &ResolvedAuthority,
    params: &AuthenticationRequestParameters,
    callback: &DeviceCodeCallback,
    cancel: &CancellationToken,
) -> Result<Acquired, AuthError> {
    let scope = params.scope.with_reserved();
    let endpoint = authority.network_authority().device_code_endpoint();

    let info = cancellable(
        cancel,
        exchange::request_device_code(
            &*app.transport,
            &endpoint,
            &params.client_id,
            &scope,
            Some(params.correlation_id.as_str()),
            &params.extra_query_parameters,
        ),
    )
    .await?
    .map_err(|e| ServiceError::from_token_request(e, &params.correlation_id))?;

    // A lifetime too long to represent leaves the wait bounded by the service alone
    let deadline = Instant::now().checked_add(Duration::from_secs(info.expires_in.0));
    if deadline.is_none() {
        tracing::debug!(expires_in = info.expires_in.0, "device code lifetime out of range; no local deadline");
    }
    callback.call(&info);

    let mut interval = info.interval;
    loop {
        cancellable(cancel, tokio::time::sleep(Duration::from_secs(interval.0))).await?;

        if deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::info!("device code expired before the user approved it");
            let mut e = ServiceError::without_response(
                EXPIRED_TOKEN,
                "the device code expired before the user completed sign-in",
            );
            e.correlation_id = Some(params.correlation_id.clone());
            return Err(e.into());
        }

        let grant = Grant::DeviceCode {
            device_code: &info.device_code,
        };
        match super::exchange_grant(app, authority, params, grant, &scope, cancel).await {
            Ok(credentials) => return Ok(Acquired::Issued(credentials)),
            Err(AuthError::Service(e)) if e.error == AUTHORIZATION_PENDING => {
                tracing::trace!("authorization pending");
            }
            Err(AuthError::Service(e)) if e.error == SLOW_DOWN => {
                interval = interval.saturating_add(SLOW_DOWN_INCREMENT);
                tracing::debug!(interval = interval.0, "service asked to slow down polling");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use kagi_oauth2::{Scope, ScopeToken};
    use serde_json::json;

    use super::*;
    use crate::{
        flows::{
            run,
            tests::{app, token_response, ScriptedTransport},
        },
        RequestGrant,
    };

    fn device_code(expires_in: u64, interval: u64) -> serde_json::Value {
        json!({
            "device_code": "device-code",
            "user_code": "ABCD-EFGH",
            "verification_uri": "https://microsoft.com/devicelogin",
            "expires_in": expires_in,
            "interval": interval,
            "message": "To sign in, enter ABCD-EFGH",
        })
    }

    fn pending(transport: &ScriptedTransport) {
        transport.push_json(400, json!({"error": "authorization_pending"}));
    }

    fn params(
        app: &ClientApplication<kagi_clock::TestClock>,
        callback: DeviceCodeCallback,
    ) -> AuthenticationRequestParameters {
        AuthenticationRequestParameters::new(
            app.config(),
            Scope::single(ScopeToken::from_static("User.Read")),
            RequestGrant::DeviceCode { callback },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_approved() {
        let (app, transport, _) = app();
        transport.push_json(200, device_code(900, 5));
        pending(&transport);
        pending(&transport);
        transport.push_json(200, token_response("at", Some("rt"), "uid"));

        let shown = Arc::new(Mutex::new(Vec::new()));
        let seen = shown.clone();
        let callback = DeviceCodeCallback::new(move |info| seen.lock().unwrap().push(info.user_code.clone()));

        let result = run(&app, params(&app, callback), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.access_token.as_str(), "at");
        assert_eq!(*shown.lock().unwrap(), vec!["ABCD-EFGH".to_owned()]);
        assert_eq!(transport.calls(), 4);

        let requests = transport.requests();
        assert!(requests[0].url.path().ends_with("/oauth2/v2.0/devicecode"));
        for poll in &requests[1..] {
            assert_eq!(poll.form_value("grant_type").as_deref(), Some(exchange::DEVICE_CODE_GRANT_TYPE));
            assert_eq!(poll.form_value("device_code").as_deref(), Some("device-code"));
        }

        let times = transport.request_times();
        assert!(times[1] - times[0] >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_down_increases_the_interval() {
        let (app, transport, _) = app();
        transport.push_json(200, device_code(900, 5));
        pending(&transport);
        transport.push_json(400, json!({"error": "slow_down"}));
        pending(&transport);
        transport.push_json(200, token_response("at", Some("rt"), "uid"));

        run(&app, params(&app, DeviceCodeCallback::new(|_| {})), CancellationToken::new())
            .await
            .unwrap();

        let times = transport.request_times();
        let before = times[2] - times[1];
        let after = times[3] - times[2];
        assert!(after > before, "{after:?} should exceed {before:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn declined_is_a_service_error() {
        let (app, transport, _) = app();
        transport.push_json(200, device_code(900, 5));
        transport.push_json(400, json!({"error": "authorization_declined"}));

        let err = run(&app, params(&app, DeviceCodeCallback::new(|_| {})), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.service_error().unwrap().error, "authorization_declined");
        assert!(app.cache().accounts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn code_expires_locally() {
        let (app, transport, _) = app();
        transport.push_json(200, device_code(12, 5));
        pending(&transport);
        pending(&transport);

        let err = run(&app, params(&app, DeviceCodeCallback::new(|_| {})), CancellationToken::new())
            .await
            .unwrap_err();
        let service = err.service_error().unwrap();
        assert_eq!(service.error, EXPIRED_TOKEN);
        assert_eq!(service.status, None);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_lifetime_still_polls() {
        let (app, transport, _) = app();
        transport.push_json(200, device_code(u64::MAX, 5));
        pending(&transport);
        transport.push_json(200, token_response("at", Some("rt"), "uid"));

        let shown = Arc::new(Mutex::new(0));
        let seen = shown.clone();
        let callback = DeviceCodeCallback::new(move |_| *seen.lock().unwrap() += 1);

        let result = run(&app, params(&app, callback), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.access_token.as_str(), "at");
        assert_eq!(*shown.lock().unwrap(), 1);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn empty_scope_is_rejected() {
        let (app, transport, _) = app();
        let params = AuthenticationRequestParameters::new(
            app.config(),
            Scope::single(ScopeToken::from_static("offline_access")),
            RequestGrant::DeviceCode {
                callback: DeviceCodeCallback::new(|_| {}),
            },
        );

        let err = run(&app, params, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::Client(ClientError::EmptyScopes)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_waiting_for_the_user() {
        let (app, transport, _) = app();
        transport.push_json(200, device_code(900, 5));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let callback = DeviceCodeCallback::new(move |_| trigger.cancel());

        let err = run(&app, params(&app, callback), cancel).await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(transport.calls(), 1);
    }
}
