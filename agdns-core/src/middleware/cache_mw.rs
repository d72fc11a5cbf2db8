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

//! `CacheMW` (§4.3, §4.4): consults the plain or ECS-aware cache before
//! falling through to its inner handler (`PreUpstreamMW`), single-flighted
//! so concurrent misses for the same key collapse into one fill. Derives
//! its cache key from the Android-metric canonical name (§4.4) via
//! `super::pre_upstream::canonical_android_metric_name`, so variant
//! hostnames share one slot with `PreUpstreamMW`'s own canonicalization,
//! even though `CacheMW` sits above it in the pipeline.

use super::handler::{Handler, HandlerOutcome};
use super::pre_upstream::{canonical_android_metric_name, restore_response_name};
use crate::cache::{CacheKey, EcsCache, PlainCache, SingleFlight};
use crate::context::{EcsOption, RequestContext};
use crate::metrics::ComponentMetrics;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::{Dname, Message, ToDname};
use std::str::FromStr;

/// Which cache variant a `CacheMW` instance consults (§4.3 "Plain cache"
/// vs "ECS cache" -- exactly one applies per server group).
pub enum CacheBackend {
    /// The non-ECS LRU cache.
    Plain(PlainCache),
    /// The ECS-aware two-sub-store cache.
    Ecs(EcsCache),
}

/// The `CacheMW` wrapper (§4.3, §4.4). Wraps `PreUpstreamMW`.
pub struct CacheMw<H> {
    inner: H,
    backend: CacheBackend,
    single_flight: SingleFlight<CacheKey>,
    metrics: ComponentMetrics,
}

impl<H> CacheMw<H> {
    /// Wrap `inner` with `backend`, observing hits/misses via `metrics`.
    pub fn new(inner: H, backend: CacheBackend, metrics: ComponentMetrics) -> Self {
        Self {
            inner,
            backend,
            single_flight: SingleFlight::new(),
            metrics,
        }
    }

    fn name_override(&self, ctx: &RequestContext) -> Option<&'static str> {
        canonical_android_metric_name(&ctx.info.host)
    }

    /// Restore the client's original qname in a cached hit, undoing the
    /// Android-metric canonicalization if it applied.
    fn restore(&self, ctx: &RequestContext, req: &Message<Bytes>, cached: Message<Bytes>) -> Result<Message<Bytes>> {
        let Some(canon) = self.name_override(ctx) else {
            return Ok(cached);
        };
        let canon_name = Dname::<Bytes>::from_str(canon).unwrap_or_else(|_| Dname::root_bytes());
        let original_name = req
            .first_question()
            .and_then(|q| q.qname().to_dname::<Bytes>().ok())
            .unwrap_or_else(Dname::root_bytes);
        restore_response_name(&cached, &canon_name, &original_name)
    }
}

#[async_trait]
impl<H: Handler> Handler for CacheMw<H> {
    async fn handle(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        let name_override = self.name_override(ctx);

        match &self.backend {
            CacheBackend::Plain(cache) => {
                let key = CacheKey::from_request_canonical(req, name_override)?;
                if let Some(cached) = cache.get_by_key(&key) {
                    self.metrics.counter_for(&["hit", crate::metrics::canon_qtype(ctx.info.qtype)]).inc();
                    return Ok(HandlerOutcome::Respond(self.restore(ctx, req, cached)?));
                }
                self.metrics.counter_for(&["miss", crate::metrics::canon_qtype(ctx.info.qtype)]).inc();
                let outcome = self
                    .single_flight
                    .run(key.clone(), || self.inner.handle(ctx, req))
                    .await?;
                if let HandlerOutcome::Respond(ref resp) = outcome {
                    cache.put_with_key(key, resp);
                }
                Ok(outcome)
            }
            CacheBackend::Ecs(cache) => {
                let client_network = crate::cache::ecs::client_network(
                    ctx.info.ecs.as_ref(),
                    ctx.info.location.as_ref(),
                    ctx.info.client_addr.ip(),
                );
                let key = CacheKey::from_request_canonical(req, name_override)?.with_ecs_network(Some(client_network));
                if let Some(cached) = cache.get_canonical(req, client_network, name_override) {
                    self.metrics.counter_for(&["hit", crate::metrics::canon_qtype(ctx.info.qtype)]).inc();
                    return Ok(HandlerOutcome::Respond(self.restore(ctx, req, cached)?));
                }
                self.metrics.counter_for(&["miss", crate::metrics::canon_qtype(ctx.info.qtype)]).inc();
                let outcome = self
                    .single_flight
                    .run(key, || self.inner.handle(ctx, req))
                    .await?;
                if let HandlerOutcome::Respond(ref resp) = outcome {
                    let scope = EcsOption::from_message(resp).map(|ecs| ecs.scope_prefix);
                    cache.put_canonical(req, resp, Some(client_network), scope, name_override);
                }
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PlainCacheConfig;
    use crate::context::{Protocol, RequestInfo, ServerInfo};
    use crate::metrics::MetricsRegistry;
    use domain::base::{iana::Class, iana::Rcode, iana::Rtype, MessageBuilder};
    use std::net::SocketAddr;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let mut builder = MessageBuilder::from_target(bytes::BytesMut::new()).unwrap();
            builder.header_mut().set_id(req.header().id());
            builder.header_mut().set_qr(true);
            let mut qbuilder = builder.question();
            for item in req.question().flatten() {
                let _ = qbuilder.push(item);
            }
            let mut abuilder = qbuilder.answer();
            let name = Dname::<Bytes>::from_str("dnsotls-ds.metric.gstatic.com.").unwrap();
            let _ = abuilder.push((&name, 300, Class::In, domain::rdata::A::from_octets(1, 2, 3, 4)));
            Ok(HandlerOutcome::Respond(abuilder.into_message()))
        }
    }

    fn ctx(host: &str) -> RequestContext {
        RequestContext {
            server: ServerInfo {
                name: "test".into(),
                bind_addr: "0.0.0.0:53".parse().unwrap(),
                protocol: Protocol::Udp,
                linked_ip_enabled: true,
            },
            info: RequestInfo {
                client_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
                host: host.into(),
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

    fn request(name: &str) -> Message<Bytes> {
        let dname = Dname::<Bytes>::from_str(name).unwrap();
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
            .unwrap()
            .question();
        let _ = builder.push((&dname, Rtype::A, Class::In));
        builder.into_message()
    }

    #[tokio::test]
    async fn android_metric_variants_share_one_cache_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = CountingHandler(calls.clone());
        let backend = CacheBackend::Plain(PlainCache::new(PlainCacheConfig {
            count: NonZeroUsize::new(16).unwrap(),
            min_ttl: 0,
            override_ttl: false,
        }));
        let metrics = ComponentMetrics::new(&MetricsRegistry::new().unwrap().registry, "cache_test", &["hit", "qtype"]).unwrap();
        let mw = CacheMw::new(inner, backend, metrics);

        let req1 = request("12345678-dnsotls-ds.metric.gstatic.com.");
        let resp1 = mw.handle(&ctx("12345678-dnsotls-ds.metric.gstatic.com."), &req1).await.unwrap();
        assert!(matches!(resp1, HandlerOutcome::Respond(_)));

        let req2 = request("abcdef00-dnsotls-ds.metric.gstatic.com.");
        let resp2 = mw.handle(&ctx("abcdef00-dnsotls-ds.metric.gstatic.com."), &req2).await.unwrap();
        assert!(matches!(resp2, HandlerOutcome::Respond(_)));

        assert_eq!(calls.load(Ordering::SeqCst), 1, "second variant must be served from cache");

        if let HandlerOutcome::Respond(resp) = resp2 {
            assert_eq!(resp.header().rcode(), Rcode::NoError);
            let q = resp.first_question().unwrap();
            assert_eq!(
                q.qname().to_dname::<Bytes>().unwrap().to_string(),
                "abcdef00-dnsotls-ds.metric.gstatic.com."
            );
        }
    }
}
