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

//! The rate-limit engine (§4.2 "Backoff"): per-subnet token buckets,
//! backoff state, amplification accounting, and an allowlist.

pub mod allowlist;
pub mod backoff;
pub mod error;
pub mod rps;

pub use error::RateLimitError;

use allowlist::Allowlist;
use backoff::{subnet_key, BackoffConfig, BackoffEngine};
use domain::base::iana::Rtype;
use std::net::SocketAddr;

/// Outcome of `is_rate_limited` (§4.2 contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed normally.
    Allowed,
    /// The request's source is on the allowlist; never rate-limited.
    Allowlisted,
    /// The request must be dropped with no wire response (§7 "Policy").
    Drop,
}

/// Configuration for the rate-limit middleware (§4.2 "Middleware wrapping").
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Backoff/RPS tuning.
    pub backoff: BackoffConfig,
    /// Drop every qtype ANY query before any upstream or cache call.
    pub refuse_any: bool,
    /// Divides a response's wire size to derive how many extra
    /// `is_rate_limited` calls `count_responses` performs (§4.2
    /// "Amplification accounting").
    pub response_size_estimate: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            refuse_any: true,
            response_size_estimate: 64,
        }
    }
}

/// The rate-limit engine proper (§4.2). One instance is shared across all
/// servers the configured protocol set applies to.
pub struct RateLimiter {
    cfg: RateLimitConfig,
    backoff: BackoffEngine,
    allowlist: Allowlist,
}

impl RateLimiter {
    /// Build a rate limiter with the given configuration and persistent
    /// allowlist prefixes.
    pub fn new(cfg: RateLimitConfig, persistent_allowlist: Vec<ipnet::IpNet>) -> Self {
        Self {
            backoff: BackoffEngine::new(cfg.backoff),
            allowlist: Allowlist::new(persistent_allowlist),
            cfg,
        }
    }

    /// Replace the dynamic allowlist prefix set atomically.
    pub fn replace_dynamic_allowlist(&self, prefixes: Vec<ipnet::IpNet>) {
        self.allowlist.replace_dynamic(prefixes);
    }

    /// `IsRateLimited(ctx, req, ip) -> (drop, allowlisted, err)` collapsed
    /// into one `Verdict`, following §4.2's pipeline exactly:
    ///
    /// 1. Validate the peer address (zero port ⇒ spoofing).
    /// 2. `RefuseANY` + qtype ANY ⇒ drop.
    /// 3. Allowlist membership ⇒ allowlisted, skip the rest.
    /// 4. Mask into the subnet key.
    /// 5. Already in backoff ⇒ drop.
    /// 6. Otherwise consult the RPS ring; a hit that pushes the hit
    ///    counter to `Count` enters backoff but the *triggering* request
    ///    itself is also dropped.
    pub fn is_rate_limited(
        &self,
        peer: SocketAddr,
        qtype: Rtype,
    ) -> Result<Verdict, RateLimitError> {
        if peer.port() == 0 {
            return Err(RateLimitError::ZeroPort(peer.ip()));
        }
        if self.cfg.refuse_any && qtype == Rtype::Any {
            return Ok(Verdict::Drop);
        }
        if self.allowlist.contains(peer.ip()) {
            return Ok(Verdict::Allowlisted);
        }
        let key = subnet_key(peer.ip(), &self.cfg.backoff);
        if self.backoff.in_backoff(&key) {
            return Ok(Verdict::Drop);
        }
        if self.backoff.record_and_check(key) {
            return Ok(Verdict::Drop);
        }
        Ok(Verdict::Allowed)
    }

    /// `CountResponses(ctx, resp, ip)` (§4.2 "Amplification accounting"):
    /// charge the subnet extra hits proportional to the response's wire
    /// size, so large (amplifying) responses count against the limiter
    /// more than once.
    pub fn count_responses(&self, resp_wire_len: usize, peer: SocketAddr, qtype: Rtype) {
        let extra = resp_wire_len / self.cfg.response_size_estimate.max(1);
        for _ in 0..extra {
            let _ = self.is_rate_limited(peer, qtype);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        ([1, 2, 3, 4], port).into()
    }

    #[test]
    fn zero_port_is_rejected() {
        let limiter = RateLimiter::new(RateLimitConfig::default(), vec![]);
        assert!(limiter.is_rate_limited(peer(0), Rtype::A).is_err());
    }

    #[test]
    fn any_query_dropped_when_refuse_any_set() {
        let limiter = RateLimiter::new(RateLimitConfig::default(), vec![]);
        assert_eq!(
            limiter.is_rate_limited(peer(1), Rtype::Any).unwrap(),
            Verdict::Drop
        );
    }

    #[test]
    fn allowlisted_ip_never_dropped_regardless_of_rate() {
        let cfg = RateLimitConfig {
            backoff: BackoffConfig {
                rps: 1,
                count: 1,
                ..BackoffConfig::default()
            },
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(cfg, vec!["1.2.3.0/24".parse().unwrap()]);
        for _ in 0..50 {
            assert_eq!(
                limiter.is_rate_limited(peer(1), Rtype::A).unwrap(),
                Verdict::Allowlisted
            );
        }
    }

    #[test]
    fn sustained_excess_rate_eventually_drops() {
        let cfg = RateLimitConfig {
            backoff: BackoffConfig {
                rps: 1,
                count: 3,
                ..BackoffConfig::default()
            },
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(cfg, vec![]);
        let mut saw_drop = false;
        for _ in 0..20 {
            if limiter.is_rate_limited(peer(1), Rtype::A).unwrap() == Verdict::Drop {
                saw_drop = true;
            }
        }
        assert!(saw_drop, "sustained over-rps traffic must eventually drop");
    }
}
