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

//! The forward resolver: active/fallback upstream selection,
//! healthchecking, connection pooling and the plain upstream
//! implementation.

pub mod error;
pub mod healthcheck;
pub mod pool;
pub mod upstream;

pub use error::{ForwardError, Result};
pub use upstream::{Network, NetworkPref, Upstream, UpstreamPlain};

use healthcheck::{HealthState, HealthcheckConfig};
use rand::seq::SliceRandom;
use std::{
    sync::{Arc, RwLock},
    time::Instant,
};

/// One upstream plus its healthcheck bookkeeping, as tracked internally by
/// the forward resolver (§3 `Upstream` + §4.1 "Healthcheck").
struct Entry {
    upstream: Arc<dyn Upstream>,
    health: HealthState,
}

/// Maintains an active list and a fallback list of upstreams and performs
/// uniform-random selection with network-error fallback (§4.1 "On
/// `ServeDns`"). This is the crate's single forward-resolution entry point;
/// middleware calls into it once all collaborator decisions (filtering,
/// caching, rate limiting) have already been made.
pub struct ForwardResolver {
    active: RwLock<Vec<Entry>>,
    fallback: Vec<Entry>,
    healthcheck_cfg: HealthcheckConfig,
}

impl ForwardResolver {
    /// Build a resolver from a list of active upstreams and a list of
    /// fallback upstreams, all starting out healthy.
    pub fn new(
        active: Vec<Arc<dyn Upstream>>,
        fallback: Vec<Arc<dyn Upstream>>,
        healthcheck_cfg: HealthcheckConfig,
    ) -> Self {
        let wrap = |v: Vec<Arc<dyn Upstream>>| {
            v.into_iter()
                .map(|upstream| Entry {
                    upstream,
                    health: HealthState::default(),
                })
                .collect::<Vec<_>>()
        };
        Self {
            active: RwLock::new(wrap(active)),
            fallback: wrap(fallback),
            healthcheck_cfg,
        }
    }

    /// Resolve `req` via a uniformly random active upstream, falling back to
    /// a uniformly random fallback upstream on a network-class error (§4.1
    /// "On `ServeDns`"):
    ///
    /// 1. If the active list is empty, go straight to a random fallback.
    /// 2. Otherwise pick a random active upstream and exchange.
    /// 3. If that returns a network error (per §7's classification) and at
    ///    least one fallback exists, retry once on a random fallback.
    /// 4. Any other error is returned as-is.
    /// 5. A response with no error is never silently dropped; callers that
    ///    observe neither response nor error treat it as `NoResponse`.
    pub async fn resolve(
        &self,
        req: &domain::base::Message<bytes::Bytes>,
        deadline: Instant,
    ) -> Result<(domain::base::Message<bytes::Bytes>, Network)> {
        let active_pick = {
            let active = self.active.read().unwrap();
            pick_healthy(&active, &self.healthcheck_cfg)
        };

        let primary_result = match active_pick {
            Some(upstream) => Some(upstream.exchange(req, deadline).await),
            None => None,
        };

        match primary_result {
            Some(Ok(ok)) => return Ok(ok),
            Some(Err(e)) if !e.is_network_error() => return Err(e),
            // Either the active list was empty, or the active pick hit a
            // network error: fall through to a fallback attempt.
            _ => {}
        }

        let fallback_pick = pick_healthy(&self.fallback, &self.healthcheck_cfg);
        match fallback_pick {
            Some(upstream) => upstream.exchange(req, deadline).await,
            None => Err(ForwardError::NoUpstream),
        }
    }

    /// Re-probe every upstream (active and fallback) and rewrite the active
    /// list to only the ones not currently in backoff (§4.1 "Healthcheck",
    /// §9 "Healthcheck re-architecture"). Intended to be driven by a
    /// periodic background task.
    pub async fn refresh(&self) {
        for entry in self.fallback.iter() {
            let _ = healthcheck::probe(entry.upstream.as_ref(), &self.healthcheck_cfg, &entry.health)
                .await;
        }
        let active = self.active.read().unwrap();
        for entry in active.iter() {
            let _ = healthcheck::probe(entry.upstream.as_ref(), &self.healthcheck_cfg, &entry.health)
                .await;
        }
    }

    /// Close every upstream's pooled connections (shutdown path).
    pub async fn close(&self) {
        for entry in self.active.read().unwrap().iter() {
            entry.upstream.close().await;
        }
        for entry in self.fallback.iter() {
            entry.upstream.close().await;
        }
    }
}

/// Pick a uniformly random entry from `entries` whose healthcheck state is
/// not currently in backoff; if every entry is in backoff, fall back to a
/// uniformly random pick among all of them rather than refusing outright
/// (an unhealthy upstream that answers is still better than none).
fn pick_healthy(entries: &[Entry], cfg: &HealthcheckConfig) -> Option<Arc<dyn Upstream>> {
    if entries.is_empty() {
        return None;
    }
    let healthy: Vec<&Entry> = entries
        .iter()
        .filter(|e| !e.health.in_backoff(cfg))
        .collect();
    let pool = if healthy.is_empty() { entries.iter().collect() } else { healthy };
    pool.choose(&mut rand::thread_rng())
        .map(|e| e.upstream.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use domain::base::{Dname, Message, MessageBuilder};
    use domain::base::iana::{Class, Rtype};
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockUpstream {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    impl fmt::Display for MockUpstream {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.name)
        }
    }

    #[async_trait]
    impl Upstream for MockUpstream {
        async fn exchange(
            &self,
            req: &Message<Bytes>,
            _deadline: Instant,
        ) -> Result<(Message<Bytes>, Network)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ForwardError::NoResponse);
            }
            let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
                .unwrap()
                .question();
            let name: Dname<Bytes> = Dname::root_bytes();
            let _ = builder.push((&name, Rtype::A, Class::In));
            let mut msg = builder.into_message();
            msg.header_mut().set_id(req.header().id());
            Ok((msg, Network::Udp))
        }

        async fn close(&self) {}
    }

    fn sample_request() -> Message<Bytes> {
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
            .unwrap()
            .question();
        let name: Dname<Bytes> = Dname::root_bytes();
        let _ = builder.push((&name, Rtype::A, Class::In));
        let mut msg = builder.into_message();
        msg.header_mut().set_id(42);
        msg
    }

    #[tokio::test]
    async fn falls_back_when_active_list_empty() {
        let fallback = Arc::new(MockUpstream {
            name: "fallback",
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let resolver = ForwardResolver::new(vec![], vec![fallback], HealthcheckConfig::default());
        let req = sample_request();
        let result = resolver
            .resolve(&req, Instant::now() + std::time::Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retries_on_fallback_after_network_error() {
        let active = Arc::new(MockUpstream {
            name: "active",
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let fallback = Arc::new(MockUpstream {
            name: "fallback",
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let resolver =
            ForwardResolver::new(vec![active], vec![fallback], HealthcheckConfig::default());
        let req = sample_request();
        let result = resolver
            .resolve(&req, Instant::now() + std::time::Duration::from_secs(1))
            .await;
        assert!(result.is_ok(), "must fall back after a network-class error");
    }

    #[tokio::test]
    async fn no_upstream_available_surfaces_error() {
        let resolver = ForwardResolver::new(vec![], vec![], HealthcheckConfig::default());
        let req = sample_request();
        let result = resolver
            .resolve(&req, Instant::now() + std::time::Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ForwardError::NoUpstream)));
    }
}
