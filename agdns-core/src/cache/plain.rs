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

//! Plain response cache keyed by `(qname, qtype, qclass, DO-bit)`. Stores
//! both NOERROR and NXDOMAIN responses; TTL is `max(min_ttl, min(TTL of
//! all RRs))`, or pinned to `min_ttl` when `override_ttl` is set.

use super::{entry::CacheEntry, key::CacheKey};
use bytes::Bytes;
use clru::CLruCache;
use domain::base::{iana::Rcode, iana::Rtype, Message};
use std::{num::NonZeroUsize, sync::Mutex};

/// Tuning for the plain cache (§4.3, §3 `CacheEntry`).
#[derive(Debug, Clone, Copy)]
pub struct PlainCacheConfig {
    /// Number of entries the LRU holds.
    pub count: NonZeroUsize,
    /// Floor applied to every stored/served TTL.
    pub min_ttl: u32,
    /// If set, every stored entry's TTL is forced to `min_ttl` regardless
    /// of the RRs' own TTLs.
    pub override_ttl: bool,
}

/// LRU response cache for the non-ECS path (§4.3 "Plain cache").
pub struct PlainCache {
    cfg: PlainCacheConfig,
    store: Mutex<CLruCache<CacheKey, CacheEntry>>,
}

impl PlainCache {
    /// Build a plain cache with the given configuration.
    pub fn new(cfg: PlainCacheConfig) -> Self {
        Self {
            cfg,
            store: Mutex::new(CLruCache::new(cfg.count)),
        }
    }

    /// Look up a cached, still-valid response for `req`. Expired entries
    /// are evicted on access rather than served stale.
    pub fn get(&self, req: &Message<Bytes>) -> Option<Message<Bytes>> {
        let key = CacheKey::from_request(req).ok()?;
        self.get_by_key(&key)
    }

    /// Look up a cached response by a precomputed key (§4.4 "PreUpstreamMW"
    /// canonicalization: callers that need the key derived from something
    /// other than the request's own qname compute it themselves).
    pub fn get_by_key(&self, key: &CacheKey) -> Option<Message<Bytes>> {
        let mut store = self.store.lock().unwrap();
        let entry = store.get(key)?;
        if entry.is_expired() {
            store.pop(key);
            return None;
        }
        entry.to_served_message(self.cfg.min_ttl).ok()
    }

    /// Store `resp` (the answer to `req`) if it qualifies for caching:
    /// only NOERROR and NXDOMAIN are stored; SERVFAIL, REFUSED and
    /// truncated responses are not (§4.3 "Plain cache").
    pub fn put(&self, req: &Message<Bytes>, resp: &Message<Bytes>) {
        let Ok(key) = CacheKey::from_request(req) else {
            return;
        };
        self.put_with_key(key, resp);
    }

    /// Store `resp` under a precomputed key (see `get_by_key`).
    pub fn put_with_key(&self, key: CacheKey, resp: &Message<Bytes>) {
        let rcode = resp.header().rcode();
        if resp.header().tc() || !matches!(rcode, Rcode::NoError | Rcode::NXDomain) {
            return;
        }
        let ttl = if self.cfg.override_ttl {
            self.cfg.min_ttl
        } else {
            min_rr_ttl(resp).unwrap_or(crate::MAX_TTL).max(self.cfg.min_ttl)
        };
        let entry = CacheEntry::new(Bytes::copy_from_slice(resp.as_slice()), rcode, ttl, None);
        self.store.lock().unwrap().put(key, entry);
    }
}

/// `min(TTL of all RRs)` across answer, authority and additional sections,
/// excluding the additional section's EDNS `OPT` pseudo-record: its "TTL"
/// field carries extended-rcode/version/flags rather than a real TTL, so
/// leaving it in would collapse almost every EDNS response's stored TTL to
/// `min_ttl` (§3 `CacheEntry`, §4.3).
pub(crate) fn min_rr_ttl(msg: &Message<Bytes>) -> Option<u32> {
    [msg.answer(), msg.authority(), msg.additional()]
        .into_iter()
        .filter_map(|section| section.ok())
        .flat_map(|records| records.filter_map(|r| r.ok()))
        .filter(|r| r.rtype() != Rtype::Opt)
        .map(|r| r.ttl())
        .min()
}
