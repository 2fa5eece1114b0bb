/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

use bytes::Bytes;
use log::debug;
use tokio::io::AsyncWrite;

use crate::body::replay::{ReplayError, RequestEntity};
use crate::config::{BodyProbe, DispatchConfig};
use crate::dispatch::{BackendExchange, DispatchOutcome, Dispatcher};
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{OutboundRequest, RemoteResponse, RequestContext};

const REDIRECT_BODY_CAP: usize = 32 << 10;

/// Per-backend failure detection and retry shaping.
///
/// One value replaces the per-backend specialization of failover behavior:
/// which redirects demote a backend, which are login redirects to pass
/// through, and which status code warrants an eager body-marker probe.
#[derive(Clone, Debug)]
pub struct BackendPolicy {
    pub role: String,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub failover_redirect_codes: Vec<u16>,
    pub login_redirect_marker: Option<String>,
    pub body_probe: Option<BodyProbe>,
}

impl BackendPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        BackendPolicy {
            role: config.role.clone(),
            max_attempts: config.max_failover_attempts,
            backoff: config.failover_sleep,
            failover_redirect_codes: config.failover_redirect_codes.clone(),
            login_redirect_marker: config.login_redirect_marker.clone(),
            body_probe: config.body_probe.clone(),
        }
    }

    /// The backend is redirecting away from the active node.
    pub fn should_failover_redirect(&self, rsp: &RemoteResponse) -> bool {
        self.failover_redirect_codes.contains(&rsp.code)
            && rsp.location().is_some()
            && !self.is_ignorable_redirect(rsp)
    }

    /// An authentication/login redirect is forwarded to the client
    /// unchanged, never treated as a backend failure.
    pub fn is_ignorable_redirect(&self, rsp: &RemoteResponse) -> bool {
        match (&self.login_redirect_marker, rsp.location()) {
            (Some(marker), Some(location)) => location.ends_with(marker.as_str()),
            _ => false,
        }
    }

    fn body_has_marker(probe: &BodyProbe, body: &[u8]) -> bool {
        probe
            .markers
            .iter()
            .any(|m| memchr::memmem::find(body, m.as_bytes()).is_some())
    }
}

enum Verdict {
    /// deliver the response, with any body bytes already probed
    Forward(Option<Bytes>),
    /// demote the backend; keep the buffered response deliverable
    Failover(Bytes),
}

async fn evaluate(policy: &BackendPolicy, exchange: &mut BackendExchange) -> DispatchResult<Verdict> {
    if policy.should_failover_redirect(&exchange.rsp) {
        let early = exchange
            .read_body_prefix(REDIRECT_BODY_CAP)
            .await
            .map_err(DispatchError::RecvFailed)?;
        return Ok(Verdict::Failover(early));
    }
    if policy.is_ignorable_redirect(&exchange.rsp) {
        return Ok(Verdict::Forward(None));
    }

    if let Some(probe) = &policy.body_probe {
        if probe.status == exchange.rsp.code {
            let early = exchange
                .read_body_prefix(probe.max_probe_bytes)
                .await
                .map_err(DispatchError::RecvFailed)?;
            if exchange.body_finished() && BackendPolicy::body_has_marker(probe, &early) {
                return Ok(Verdict::Failover(early));
            }
            // either no marker, or the body ran past the probe cap
            return Ok(Verdict::Forward(Some(early)));
        }
    }

    Ok(Verdict::Forward(None))
}

/// The bounded failover retry loop.
///
/// Runs the dispatcher against the current target; on a retryable failure
/// it demotes the active URL, re-points the outbound request at the new
/// active URL, sleeps the configured backoff and dispatches again, at most
/// `max_attempts` retries for one client request.
pub(crate) async fn run<W>(
    dispatcher: &Dispatcher,
    outbound: &mut OutboundRequest,
    ctx: &mut RequestContext,
    clt_w: &mut W,
) -> DispatchResult<DispatchOutcome>
where
    W: AsyncWrite + Unpin,
{
    let policy = dispatcher.policy();
    let registry = dispatcher.registry();
    let mut last_buffered: Option<(RemoteResponse, Bytes)> = None;

    loop {
        let failure = match dispatcher.execute_outbound(outbound, ctx).await {
            Ok(mut exchange) => match evaluate(policy, &mut exchange).await? {
                Verdict::Forward(early) => {
                    return dispatcher.write_back(clt_w, exchange, early).await;
                }
                Verdict::Failover(early) => {
                    let code = exchange.rsp.code;
                    last_buffered = Some((exchange.into_response(), early));
                    DispatchError::BackendFailoverSignaled(code)
                }
            },
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        ctx.failover_count += 1;
        if ctx.failover_count > policy.max_attempts {
            if let Some(al) = dispatcher.audit_log(ctx) {
                al.log_failover_exhausted(policy.max_attempts, last_buffered.is_some());
            }
            return match last_buffered.take() {
                Some((rsp, body)) => dispatcher.write_back_buffered(clt_w, rsp, body).await,
                None => Err(DispatchError::AttemptsExhausted(Box::new(failure))),
            };
        }

        if let Some(entity) = outbound.body() {
            if !entity.is_repeatable() {
                let cause = match entity {
                    RequestEntity::Stream(_) => ReplayError::NotRepeatable,
                    RequestEntity::Replay(_) => ReplayError::CapacityExceeded,
                };
                return Err(DispatchError::ReplayOverflow(cause));
            }
        }

        let failed = registry
            .get_active_url(&policy.role)
            .ok_or_else(|| DispatchError::NoBackendConfigured(policy.role.clone()))?;
        registry.mark_failed(&policy.role, &failed);
        ctx.resolved_target = None;
        let next = registry
            .get_active_url(&policy.role)
            .ok_or_else(|| DispatchError::NoBackendConfigured(policy.role.clone()))?;
        outbound.retarget(&failed, &next);
        ctx.resolved_target = Some(outbound.target().clone());
        debug!(
            "role {}: failover attempt {} of {}",
            policy.role, ctx.failover_count, policy.max_attempts
        );
        if let Some(al) = dispatcher.audit_log(ctx) {
            al.log_failover_retry(&failed, &next, ctx.failover_count, policy.backoff);
        }

        tokio::time::sleep(policy.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::replay::BodyTransfer;
    use crate::config::ServerDefaults;
    use crate::protocol::ClientRequest;
    use crate::registry::{BackendRegistry, StaticBackendRegistry};
    use http::{HeaderMap, Method};
    use std::sync::Arc;
    use std::time::Instant;
    use url::Url;

    use crate::dispatch::tests::{dead_backend, spawn_backend, spawn_closing_backend};

    fn ha_dispatcher(
        config: DispatchConfig,
        urls: &[Url],
    ) -> (Dispatcher, Arc<StaticBackendRegistry>) {
        let registry = Arc::new(StaticBackendRegistry::new());
        registry.add_backends(&config.role, urls.to_vec());
        let dispatcher = Dispatcher::new(config, ServerDefaults::default(), registry.clone());
        (dispatcher, registry)
    }

    fn widget_config() -> DispatchConfig {
        let mut config = DispatchConfig::new("widget");
        config.max_failover_attempts = 2;
        config.failover_sleep = Duration::from_millis(100);
        config
    }

    #[tokio::test]
    async fn retries_against_second_backend() {
        let (a2, _rx) = spawn_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        let a1 = dead_backend().await;

        let u1 = Url::parse(&format!("http://{a1}/")).unwrap();
        let u2 = Url::parse(&format!("http://{a2}/")).unwrap();
        let (dispatcher, registry) = ha_dispatcher(widget_config(), &[u1.clone(), u2.clone()]);

        let req = ClientRequest::new(Method::GET, "/data".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let start = Instant::now();
        let outcome = dispatcher
            .do_get(&format!("http://{a1}/data"), req, &mut out)
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.failover_count, 1);
        assert!(String::from_utf8(out).unwrap().ends_with("ok"));
        // the failed URL was demoted
        assert_eq!(registry.get_active_url("widget").unwrap(), u2);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_raises() {
        let a1 = dead_backend().await;
        let a2 = dead_backend().await;

        let u1 = Url::parse(&format!("http://{a1}/")).unwrap();
        let u2 = Url::parse(&format!("http://{a2}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(widget_config(), &[u1, u2]);

        let req = ClientRequest::new(Method::GET, "/data".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let err = dispatcher
            .do_get(&format!("http://{a1}/data"), req, &mut out)
            .await
            .unwrap_err();

        match err {
            DispatchError::AttemptsExhausted(cause) => {
                assert!(matches!(*cause, DispatchError::ConnectFailed(_)));
            }
            e => panic!("unexpected error: {e:?}"),
        }
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn login_redirect_forwarded_unchanged() {
        let (addr, _rx) = spawn_backend(
            b"HTTP/1.1 302 Found\r\n\
              Location: http://node1/auth/login/index.html\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await;

        let mut config = widget_config();
        config.failover_redirect_codes = vec![302, 307];
        config.login_redirect_marker = Some("/login/index.html".to_string());
        let u = Url::parse(&format!("http://{addr}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(config, std::slice::from_ref(&u));

        let req = ClientRequest::new(Method::GET, "/data".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let outcome = dispatcher
            .do_get(&format!("http://{addr}/data"), req, &mut out)
            .await
            .unwrap();

        assert_eq!(outcome.status, 302);
        assert_eq!(outcome.failover_count, 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("location: http://node1/auth/login/index.html\r\n"));
    }

    #[tokio::test]
    async fn redirect_away_triggers_failover() {
        let (a1, _rx1) = spawn_backend(
            b"HTTP/1.1 307 Temporary Redirect\r\n\
              Location: http://somewhere-else/\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await;
        let (a2, _rx2) = spawn_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

        let mut config = widget_config();
        config.failover_redirect_codes = vec![302, 307];
        config.login_redirect_marker = Some("/login/index.html".to_string());
        let u1 = Url::parse(&format!("http://{a1}/")).unwrap();
        let u2 = Url::parse(&format!("http://{a2}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(config, &[u1, u2]);

        let req = ClientRequest::new(Method::GET, "/data".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let outcome = dispatcher
            .do_get(&format!("http://{a1}/data"), req, &mut out)
            .await
            .unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.failover_count, 1);
    }

    #[tokio::test]
    async fn standby_marker_triggers_failover() {
        let (a1, _rx1) = spawn_backend(
            b"HTTP/1.1 403 Forbidden\r\n\
              Content-Type: application/json\r\n\
              Content-Length: 39\r\n\r\n\
              {\"exception\":\"StandbyException\",\"id\":1}",
        )
        .await;
        let (a2, _rx2) = spawn_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

        let mut config = widget_config();
        config.body_probe = Some(BodyProbe {
            status: 403,
            markers: vec!["StandbyException".to_string()],
            max_probe_bytes: 32 << 10,
        });
        let u1 = Url::parse(&format!("http://{a1}/")).unwrap();
        let u2 = Url::parse(&format!("http://{a2}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(config, &[u1, u2]);

        let req = ClientRequest::new(Method::GET, "/data".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let outcome = dispatcher
            .do_get(&format!("http://{a1}/data"), req, &mut out)
            .await
            .unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.failover_count, 1);
    }

    #[tokio::test]
    async fn plain_403_forwarded_with_probed_body() {
        let (addr, _rx) = spawn_backend(
            b"HTTP/1.1 403 Forbidden\r\n\
              Content-Length: 13\r\n\r\n\
              access denied",
        )
        .await;

        let mut config = widget_config();
        config.body_probe = Some(BodyProbe {
            status: 403,
            markers: vec!["StandbyException".to_string()],
            max_probe_bytes: 32 << 10,
        });
        let u = Url::parse(&format!("http://{addr}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(config, std::slice::from_ref(&u));

        let req = ClientRequest::new(Method::GET, "/data".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let outcome = dispatcher
            .do_get(&format!("http://{addr}/data"), req, &mut out)
            .await
            .unwrap();

        assert_eq!(outcome.status, 403);
        assert_eq!(outcome.failover_count, 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("access denied"));
    }

    #[tokio::test]
    async fn exhaustion_delivers_buffered_response() {
        let standby: &'static [u8] = b"HTTP/1.1 403 Forbidden\r\n\
              Content-Length: 31\r\n\r\n\
              {\"exception\":\"StandbyException\"";
        // both nodes report standby on every attempt
        let (a1, _rx1) = spawn_backend(standby).await;
        let (a2, _rx2) = spawn_backend(standby).await;

        let mut config = widget_config();
        config.body_probe = Some(BodyProbe {
            status: 403,
            markers: vec!["StandbyException".to_string()],
            max_probe_bytes: 32 << 10,
        });
        let u1 = Url::parse(&format!("http://{a1}/")).unwrap();
        let u2 = Url::parse(&format!("http://{a2}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(config, &[u1, u2]);

        let req = ClientRequest::new(Method::GET, "/data".parse().unwrap(), HeaderMap::new());
        let mut out = Vec::new();
        let outcome = dispatcher
            .do_get(&format!("http://{a1}/data"), req, &mut out)
            .await
            .unwrap();

        // the buffered backend response is delivered as-is to the client
        assert_eq!(outcome.status, 403);
        assert_eq!(outcome.failover_count, 3);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("StandbyException"));
    }

    #[tokio::test]
    async fn replayed_body_resent_on_retry() {
        // the first node consumes the request body, then dies without answering
        let (a1, mut rx1) = spawn_closing_backend().await;
        let (a2, mut rx2) =
            spawn_backend(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;

        let mut config = widget_config();
        config.secured = true;
        let u1 = Url::parse(&format!("http://{a1}/")).unwrap();
        let u2 = Url::parse(&format!("http://{a2}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(config, &[u1, u2]);

        let payload = b"name=widget&size=3";
        let req = ClientRequest::new(Method::POST, "/items".parse().unwrap(), HeaderMap::new())
            .with_body(
                Box::new(std::io::Cursor::new(&payload[..])),
                BodyTransfer::Sized(payload.len() as u64),
            );

        let mut out = Vec::new();
        let outcome = dispatcher
            .do_post(&format!("http://{a1}/items"), req, &mut out)
            .await
            .unwrap();
        assert_eq!(outcome.status, 201);
        assert_eq!(outcome.failover_count, 1);

        // both backends observed the complete request body
        let sent = String::from_utf8(rx1.recv().await.unwrap()).unwrap();
        assert!(sent.ends_with("name=widget&size=3"));
        let sent = String::from_utf8(rx2.recv().await.unwrap()).unwrap();
        assert!(sent.ends_with("name=widget&size=3"));
    }

    #[tokio::test]
    async fn one_shot_body_stops_retrying() {
        // the body is consumed by the first attempt and cannot be replayed
        let (a1, _rx1) = spawn_closing_backend().await;
        let (a2, _rx2) =
            spawn_backend(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;

        // secured is off, so the entity stays one-shot
        let u1 = Url::parse(&format!("http://{a1}/")).unwrap();
        let u2 = Url::parse(&format!("http://{a2}/")).unwrap();
        let (dispatcher, _registry) = ha_dispatcher(widget_config(), &[u1, u2]);

        let payload = b"name=widget";
        let req = ClientRequest::new(Method::POST, "/items".parse().unwrap(), HeaderMap::new())
            .with_body(
                Box::new(std::io::Cursor::new(&payload[..])),
                BodyTransfer::Sized(payload.len() as u64),
            );

        let mut out = Vec::new();
        let err = dispatcher
            .do_post(&format!("http://{a1}/items"), req, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ReplayOverflow(ReplayError::NotRepeatable)
        ));
    }
}
