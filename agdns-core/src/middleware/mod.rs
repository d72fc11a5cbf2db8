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

//! The middleware pipeline (§2, §4.4): each wrapper implements [`Handler`]
//! and is constructed once per server group at startup, in the fixed order
//!
//! ```text
//! RateLimitMW(InitialMW(MainMW(PreServiceMW(CacheMW(PreUpstreamMW(ForwardHandler))))))
//! ```
//!
//! `build_pipeline` in this module performs exactly that nesting; callers
//! that need a custom composition (tests, alternate server groups) are
//! free to nest the individual wrappers themselves instead.

pub mod block;
pub mod cache_mw;
pub mod handler;
pub mod initial;
pub mod main_mw;
pub mod pre_service;
pub mod pre_upstream;
pub mod rate_limit;

pub use cache_mw::{CacheBackend, CacheMw};
pub use handler::{ForwardHandler, Handler, HandlerOutcome};
pub use initial::InitialMw;
pub use main_mw::MainMw;
pub use pre_service::{PreServiceMw, SafeBrowsingConfig};
pub use pre_upstream::PreUpstreamMw;
pub use rate_limit::RateLimitMw;

use crate::collab::{BillStat, DnsCheck, DnsDb, FilterStorage, HashMatcher, ProfileDb, QueryLog, RuleStat};
use crate::context::Protocol;
use crate::forward::ForwardResolver;
use crate::metrics::ComponentMetrics;
use crate::ratelimit::RateLimiter;
use crate::special::ddr::DdrTarget;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Build the fixed-order pipeline described in §2/§4.4 around a shared
/// [`ForwardResolver`], wiring every collaborator trait object through.
/// This is the single place a server group's handler chain is assembled;
/// per-server-group state (DDR targets, rate-limit protocol gate, cache
/// backend) is passed in rather than hidden behind globals (§9 "Global
/// mutable counters").
#[allow(clippy::too_many_arguments)]
pub fn build_pipeline<D, FS, PS, HM, DD>(
    resolver: Arc<ForwardResolver>,
    handle_timeout: Duration,
    rate_limiter: Arc<RateLimiter>,
    rate_limit_protocols: HashSet<Protocol>,
    profile_db: Arc<D>,
    filter_storage: Arc<FS>,
    query_log: Arc<dyn QueryLog>,
    bill_stat: Arc<dyn BillStat>,
    rule_stat: Arc<dyn RuleStat>,
    dns_check: Arc<PS>,
    hash_matcher: Arc<HM>,
    safe_browsing: SafeBrowsingConfig,
    cache_backend: CacheBackend,
    dns_db: Arc<DD>,
    ddr_targets: Vec<DdrTarget>,
    rate_limit_metrics: ComponentMetrics,
    cache_metrics: ComponentMetrics,
) -> impl Handler
where
    D: ProfileDb + 'static,
    FS: FilterStorage + 'static,
    PS: DnsCheck + 'static,
    HM: HashMatcher + 'static,
    DD: DnsDb + 'static,
{
    let forward = ForwardHandler::new(resolver, handle_timeout);
    let pre_upstream = PreUpstreamMw::new(forward, dns_db);
    let cache = CacheMw::new(pre_upstream, cache_backend, cache_metrics);
    let pre_service = PreServiceMw::new(cache, dns_check, hash_matcher, safe_browsing);
    let main = MainMw::new(
        pre_service,
        profile_db.clone(),
        filter_storage,
        query_log,
        bill_stat,
        rule_stat,
    );
    let initial = InitialMw::new(main, profile_db, ddr_targets);
    RateLimitMw::new(initial, rate_limiter, rate_limit_protocols, rate_limit_metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::noop::{Discard, NoopFilterStorage, NoopProfileDb};
    use crate::context::{Protocol as Proto, RequestInfo, ServerInfo};
    use crate::forward::healthcheck::HealthcheckConfig;
    use crate::metrics::MetricsRegistry;
    use crate::ratelimit::RateLimitConfig;
    use bytes::{Bytes, BytesMut};
    use domain::base::{iana::Class, iana::Rtype, Dname, MessageBuilder};
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::time::Instant;

    fn ctx() -> crate::context::RequestContext {
        crate::context::RequestContext {
            server: ServerInfo {
                name: "test".into(),
                bind_addr: "0.0.0.0:53".parse().unwrap(),
                protocol: Proto::Udp,
                linked_ip_enabled: true,
            },
            info: RequestInfo {
                client_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
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

    fn request() -> domain::base::Message<Bytes> {
        let dname = Dname::<Bytes>::from_str("example.com.").unwrap();
        let mut builder = MessageBuilder::from_target(BytesMut::new()).unwrap().question();
        let _ = builder.push((&dname, Rtype::A, Class::In));
        builder.into_message()
    }

    #[tokio::test]
    async fn pipeline_builds_and_handles_a_request_without_any_upstream() {
        let resolver = Arc::new(ForwardResolver::new(vec![], vec![], HealthcheckConfig::default()));
        let registry = MetricsRegistry::new().unwrap();
        let pipeline = build_pipeline(
            resolver,
            Duration::from_secs(2),
            Arc::new(RateLimiter::new(RateLimitConfig::default(), vec![])),
            HashSet::new(),
            Arc::new(NoopProfileDb),
            Arc::new(NoopFilterStorage),
            Arc::new(Discard),
            Arc::new(Discard),
            Arc::new(Discard),
            Arc::new(crate::collab::noop::NoopDnsCheck),
            Arc::new(crate::collab::noop::NoopHashMatcher),
            SafeBrowsingConfig {
                suffix: "sb.dns.adguard.com.".to_string(),
            },
            CacheBackend::Plain(crate::cache::PlainCache::new(crate::cache::PlainCacheConfig {
                count: std::num::NonZeroUsize::new(16).unwrap(),
                min_ttl: 0,
                override_ttl: false,
            })),
            Arc::new(Discard),
            Vec::new(),
            ComponentMetrics::new(&registry.registry, "rl_test", &["outcome", "family"]).unwrap(),
            ComponentMetrics::new(&registry.registry, "cache_test", &["hit", "qtype"]).unwrap(),
        );

        // No upstreams configured, so the only possible outcome without
        // erroring is a dropped/forward error; what matters here is that
        // every middleware layer is reachable and wired in order.
        let outcome = pipeline.handle(&ctx(), &request()).await;
        assert!(outcome.is_err() || matches!(outcome, Ok(HandlerOutcome::Respond(_) | HandlerOutcome::Drop)));
    }
}
