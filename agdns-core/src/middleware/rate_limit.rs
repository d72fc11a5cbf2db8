// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! `RateLimitMW` (§4.2 "Middleware wrapping"): the outermost wrapper in the
//! pipeline. Consults `RateLimiter::is_rate_limited` before anything else
//! runs, then charges amplification accounting against the response size
//! once the rest of the pipeline has produced one.

use super::handler::{Handler, HandlerOutcome};
use crate::context::{Protocol, RequestContext};
use crate::metrics::{canon_family, ComponentMetrics};
use crate::ratelimit::{RateLimiter, Verdict};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use std::collections::HashSet;
use std::sync::Arc;

/// The `RateLimitMW` wrapper (§4.2). The outermost handler in the pipeline;
/// wraps `InitialMW`.
pub struct RateLimitMw<H> {
    inner: H,
    limiter: Arc<RateLimiter>,
    /// Protocols this limiter applies to. Empty means every protocol (§4.2
    /// "the configured protocol set").
    protocols: HashSet<Protocol>,
    metrics: ComponentMetrics,
}

impl<H> RateLimitMw<H> {
    /// Wrap `inner` behind `limiter`, gated to `protocols` (empty = all
    /// protocols), observing verdicts via `metrics`.
    pub fn new(inner: H, limiter: Arc<RateLimiter>, protocols: HashSet<Protocol>, metrics: ComponentMetrics) -> Self {
        Self {
            inner,
            limiter,
            protocols,
            metrics,
        }
    }

    fn applies_to(&self, protocol: Protocol) -> bool {
        self.protocols.is_empty() || self.protocols.contains(&protocol)
    }
}

#[async_trait]
impl<H: Handler> Handler for RateLimitMw<H> {
    async fn handle(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        if !self.applies_to(ctx.server.protocol) {
            return self.inner.handle(ctx, req).await;
        }

        let family = canon_family(Some(ctx.info.client_addr.ip())).as_str();
        let verdict = self.limiter.is_rate_limited(ctx.info.client_addr, ctx.info.qtype)?;
        match verdict {
            Verdict::Drop => {
                self.metrics.counter_for(&["drop", family]).inc();
                return Ok(HandlerOutcome::Drop);
            }
            Verdict::Allowlisted => {
                self.metrics.counter_for(&["allowlisted", family]).inc();
            }
            Verdict::Allowed => {
                self.metrics.counter_for(&["allowed", family]).inc();
            }
        }

        let outcome = self.inner.handle(ctx, req).await?;
        if let HandlerOutcome::Respond(ref resp) = outcome {
            self.limiter
                .count_responses(resp.as_slice().len(), ctx.info.client_addr, ctx.info.qtype);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Protocol as Proto, RequestInfo, ServerInfo};
    use crate::metrics::MetricsRegistry;
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use bytes::BytesMut;
    use domain::base::{iana::Class, iana::Rtype, Dname, MessageBuilder};
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::time::Instant;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, _ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
            let mut builder = MessageBuilder::from_target(BytesMut::new()).unwrap();
            builder.header_mut().set_id(req.header().id());
            builder.header_mut().set_qr(true);
            Ok(HandlerOutcome::Respond(builder.question().answer().into_message()))
        }
    }

    fn ctx(protocol: Proto, port: u16) -> RequestContext {
        RequestContext {
            server: ServerInfo {
                name: "test".into(),
                bind_addr: "0.0.0.0:53".parse().unwrap(),
                protocol,
                linked_ip_enabled: true,
            },
            info: RequestInfo {
                client_addr: SocketAddr::from(([1, 2, 3, 4], port)),
                host: "example.com.".into(),
                qtype: Rtype::A,
                qclass: Class::In,
                device_id: None,
                profile_id: None,
                location: None,
                ecs: None,
                start_time: Instant::now(),
                request_id: 1,
            },
        }
    }

    fn request() -> Message<Bytes> {
        let dname = Dname::<Bytes>::from_str("example.com.").unwrap();
        let mut builder = MessageBuilder::from_target(BytesMut::new()).unwrap().question();
        let _ = builder.push((&dname, Rtype::A, Class::In));
        builder.into_message()
    }

    fn metrics() -> ComponentMetrics {
        ComponentMetrics::new(&MetricsRegistry::new().unwrap().registry, "ratelimit_test", &["outcome", "family"]).unwrap()
    }

    #[tokio::test]
    async fn zero_port_surfaces_as_core_error() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), vec![]));
        let mw = RateLimitMw::new(EchoHandler, limiter, HashSet::new(), metrics());
        let result = mw.handle(&ctx(Proto::Udp, 0), &request()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn protocol_outside_configured_set_bypasses_limiter_entirely() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), vec![]));
        let mut protocols = HashSet::new();
        protocols.insert(Proto::Tcp);
        let mw = RateLimitMw::new(EchoHandler, limiter, protocols, metrics());
        // Zero port would normally error, but UDP isn't in the configured set.
        let result = mw.handle(&ctx(Proto::Udp, 0), &request()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn any_query_with_refuse_any_is_dropped() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), vec![]));
        let mw = RateLimitMw::new(EchoHandler, limiter, HashSet::new(), metrics());
        let mut c = ctx(Proto::Udp, 5000);
        c.info.qtype = Rtype::Any;
        let outcome = mw.handle(&c, &request()).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Drop));
    }
}
