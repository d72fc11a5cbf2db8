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

//! ECS-aware response cache, keyed on the client's ECS-derived subnet so
//! distinct subnet scopes get distinct entries rather than sharing one
//! slot.
//!
//! A hash-keyed `CLruCache` alone cannot express "reused when the
//! incoming subnet is equal to or more specific than the stored scope":
//! two `IpNet` values of different prefix lengths hash and compare
//! unequal even when one contains the other. Each bucket (one per
//! `qname`/`qtype`/`qclass`/DO-bit) therefore holds a small list of
//! distinct observed scopes, checked by subnet containment on lookup
//! rather than by key equality.

use super::{entry::CacheEntry, key::CacheKey, plain::PlainCacheConfig};
use crate::context::EcsOption;
use bytes::Bytes;
use clru::CLruCache;
use domain::base::{iana::Rcode, Message};
use ipnet::IpNet;
use std::{net::IpAddr, num::NonZeroUsize, sync::Mutex};

/// How many distinct scopes one `(qname, qtype, qclass, DO-bit)` bucket
/// keeps in the ECS-keyed sub-store before the oldest is evicted to make
/// room. Real-world ECS scopes for one name rarely fragment beyond a
/// handful of distinct answers.
const MAX_SCOPES_PER_KEY: usize = 8;

/// Tuning for the ECS-aware cache (§4.3 "ECS cache", two sub-stores).
#[derive(Debug, Clone, Copy)]
pub struct EcsCacheConfig {
    /// Shared TTL floor / override policy.
    pub plain: PlainCacheConfig,
    /// Entries in the ECS-keyed sub-store.
    pub ecs_count: NonZeroUsize,
    /// Entries in the no-ECS (location-independent) sub-store.
    pub no_ecs_count: NonZeroUsize,
}

/// A GeoIP-derived or request-carried network used to key the ECS cache
/// when no explicit ECS option was present (§4.3 "or, if none, from the
/// client's GeoIP country/ASN mapping to a synthetic subnet").
pub fn synthetic_network_from_location(location: &crate::collab::Location, client_ip: IpAddr) -> IpNet {
    // A coarse placeholder network: real deployments map country/ASN to a
    // pre-computed aggregate block; absent that mapping table here, the
    // single client address is used as a maximally-specific fallback so
    // cache entries never leak across genuinely distinct clients.
    let _ = location;
    let prefix = if client_ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(client_ip, prefix).unwrap()
}

/// True if `broader` is equal to or less specific than `narrower` *and*
/// `narrower` falls within `broader`'s address range -- i.e. `narrower`
/// is "equal to or more specific than" `broader` (§4.3, §8 "Allowlist
/// precedence"-style containment, here for cache scope reuse). Different
/// address families never contain one another.
fn net_contains(broader: IpNet, narrower: IpNet) -> bool {
    if broader.prefix_len() > narrower.prefix_len() {
        return false;
    }
    match (broader, narrower) {
        (IpNet::V4(b), IpNet::V4(n)) => {
            let shift = 32 - b.prefix_len() as u32;
            let mask = if shift >= 32 { 0 } else { !0u32 << shift };
            (u32::from(b.addr()) & mask) == (u32::from(n.addr()) & mask)
        }
        (IpNet::V6(b), IpNet::V6(n)) => {
            let shift = 128 - b.prefix_len() as u32;
            let mask = if shift >= 128 { 0 } else { !0u128 << shift };
            (u128::from(b.addr()) & mask) == (u128::from(n.addr()) & mask)
        }
        _ => false,
    }
}

/// Mask `net`'s address down to `prefix` bits, representing the minimal
/// range the upstream's certified `scope_prefix` covers (§4.3 "Entries
/// record the response's `scope`").
fn mask_to_prefix(net: IpNet, prefix: u8) -> IpNet {
    let prefix = prefix.min(if net.addr().is_ipv4() { 32 } else { 128 });
    match net {
        IpNet::V4(n) => {
            let shift = 32 - prefix as u32;
            let mask = if shift >= 32 { 0 } else { !0u32 << shift };
            let masked = u32::from(n.addr()) & mask;
            IpNet::new(IpAddr::from(masked.to_be_bytes()), prefix).unwrap()
        }
        IpNet::V6(n) => {
            let shift = 128 - prefix as u32;
            let mask = if shift >= 128 { 0 } else { !0u128 << shift };
            let masked = u128::from(n.addr()) & mask;
            IpNet::new(IpAddr::from(masked.to_be_bytes()), prefix).unwrap()
        }
    }
}

/// One observed scope within a bucket: the network range the stored
/// answer is valid for, plus the entry itself.
struct ScopedEntry {
    network: IpNet,
    entry: CacheEntry,
}

/// Two LRU sub-stores: one for responses that vary by client subnet (keyed
/// by the subnet the response's scope certifies), one for responses that
/// do not (§4.3 "because responses that do not depend on location can be
/// shared across clients").
pub struct EcsCache {
    cfg: EcsCacheConfig,
    ecs_store: Mutex<CLruCache<CacheKey, Vec<ScopedEntry>>>,
    no_ecs_store: Mutex<CLruCache<CacheKey, CacheEntry>>,
}

impl EcsCache {
    /// Build an ECS-aware cache with the given configuration.
    pub fn new(cfg: EcsCacheConfig) -> Self {
        Self {
            ecs_store: Mutex::new(CLruCache::new(cfg.ecs_count)),
            no_ecs_store: Mutex::new(CLruCache::new(cfg.no_ecs_count)),
            cfg,
        }
    }

    /// Look up a cached response for `req`, whose client network is
    /// `client_network`. An ECS-keyed entry is reused only when
    /// `client_network` is equal to or more specific than the stored scope
    /// (§4.3 "reused only when the incoming request's source subnet is
    /// equal to or more specific than the stored scope").
    pub fn get(&self, req: &Message<Bytes>, client_network: IpNet) -> Option<Message<Bytes>> {
        self.get_canonical(req, client_network, None)
    }

    /// As `get`, substituting `name_override` for the request's own qname
    /// when deriving the cache key (§4.4 "PreUpstreamMW" canonicalization,
    /// see `CacheKey::from_request_canonical`).
    pub fn get_canonical(
        &self,
        req: &Message<Bytes>,
        client_network: IpNet,
        name_override: Option<&str>,
    ) -> Option<Message<Bytes>> {
        let base_key = CacheKey::from_request_canonical(req, name_override).ok()?;

        {
            let mut store = self.no_ecs_store.lock().unwrap();
            if let Some(entry) = store.get(&base_key) {
                if entry.is_expired() {
                    store.pop(&base_key);
                } else {
                    return entry.to_served_message(self.cfg.plain.min_ttl).ok();
                }
            }
        }

        let mut store = self.ecs_store.lock().unwrap();
        let scopes = store.get(&base_key)?;
        scopes.retain(|s| !s.entry.is_expired());
        let hit = scopes
            .iter()
            .find(|s| net_contains(s.network, client_network))?;
        hit.entry.to_served_message(self.cfg.plain.min_ttl).ok()
    }

    /// Store `resp` for `req`. `scope_prefix` is the ECS scope the
    /// authoritative server certified (`None` routes into the no-ECS
    /// sub-store; `Some` routes into the ECS-keyed sub-store against
    /// `client_network`).
    pub fn put(
        &self,
        req: &Message<Bytes>,
        resp: &Message<Bytes>,
        client_network: Option<IpNet>,
        scope_prefix: Option<u8>,
    ) {
        self.put_canonical(req, resp, client_network, scope_prefix, None)
    }

    /// As `put`, substituting `name_override` for the request's own qname
    /// when deriving the cache key.
    pub fn put_canonical(
        &self,
        req: &Message<Bytes>,
        resp: &Message<Bytes>,
        client_network: Option<IpNet>,
        scope_prefix: Option<u8>,
        name_override: Option<&str>,
    ) {
        let rcode = resp.header().rcode();
        if resp.header().tc() || !matches!(rcode, Rcode::NoError | Rcode::NXDomain) {
            return;
        }
        let Ok(base_key) = CacheKey::from_request_canonical(req, name_override) else {
            return;
        };
        let ttl = if self.cfg.plain.override_ttl {
            self.cfg.plain.min_ttl
        } else {
            super::plain::min_rr_ttl(resp)
                .unwrap_or(crate::MAX_TTL)
                .max(self.cfg.plain.min_ttl)
        };
        let entry = CacheEntry::new(
            Bytes::copy_from_slice(resp.as_slice()),
            rcode,
            ttl,
            scope_prefix,
        );
        match client_network {
            Some(net) => {
                let network = match scope_prefix {
                    Some(scope) => mask_to_prefix(net, scope),
                    None => net,
                };
                let mut store = self.ecs_store.lock().unwrap();
                if store.get_mut(&base_key).is_none() {
                    store.put(base_key.clone(), Vec::new());
                }
                let scopes = store.get_mut(&base_key).expect("just inserted");
                scopes.retain(|s| s.network != network);
                if scopes.len() >= MAX_SCOPES_PER_KEY {
                    // Evict the scope whose entry was fetched longest ago.
                    if let Some((idx, _)) = scopes
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, s)| s.entry.fetched_at)
                    {
                        scopes.remove(idx);
                    }
                }
                scopes.push(ScopedEntry { network, entry });
            }
            None => {
                self.no_ecs_store.lock().unwrap().put(base_key, entry);
            }
        }
    }
}

/// Derive the client network to key the ECS cache on, from either the
/// request's own ECS option or (absent one) a synthetic GeoIP-derived
/// network (§4.3).
pub fn client_network(ecs: Option<&EcsOption>, location: Option<&crate::collab::Location>, client_ip: IpAddr) -> IpNet {
    match (ecs, location) {
        (Some(ecs), _) => ecs.network(),
        (None, Some(loc)) => synthetic_network_from_location(loc, client_ip),
        (None, None) => {
            let prefix = if client_ip.is_ipv4() { 32 } else { 128 };
            IpNet::new(client_ip, prefix).unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::plain::PlainCacheConfig;
    use domain::base::{iana::Class, Dname, MessageBuilder};
    use std::str::FromStr;

    fn cfg() -> EcsCacheConfig {
        EcsCacheConfig {
            plain: PlainCacheConfig {
                count: NonZeroUsize::new(16).unwrap(),
                min_ttl: 0,
                override_ttl: false,
            },
            ecs_count: NonZeroUsize::new(16).unwrap(),
            no_ecs_count: NonZeroUsize::new(16).unwrap(),
        }
    }

    fn query() -> Message<Bytes> {
        let dname = Dname::<Bytes>::from_str("example.com.").unwrap();
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
            .unwrap()
            .question();
        let _ = builder.push((&dname, domain::base::iana::Rtype::A, Class::In));
        builder.into_message()
    }

    fn response(rcode: Rcode) -> Message<Bytes> {
        let dname = Dname::<Bytes>::from_str("example.com.").unwrap();
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new()).unwrap();
        builder.header_mut().set_qr(true);
        builder.header_mut().set_rcode(rcode);
        let mut qbuilder = builder.question();
        let _ = qbuilder.push((&dname, domain::base::iana::Rtype::A, Class::In));
        qbuilder.into_message()
    }

    #[test]
    fn more_specific_client_network_reuses_broader_scope() {
        let cache = EcsCache::new(cfg());
        let req = query();
        let resp = response(Rcode::NoError);
        let stored_net: IpNet = "1.2.0.0/16".parse().unwrap();
        cache.put(&req, &resp, Some(stored_net), Some(16));

        let narrower: IpNet = "1.2.3.0/24".parse().unwrap();
        assert!(cache.get(&req, narrower).is_some());
    }

    #[test]
    fn broader_client_network_does_not_reuse_narrower_scope() {
        let cache = EcsCache::new(cfg());
        let req = query();
        let resp = response(Rcode::NoError);
        let stored_net: IpNet = "1.2.3.0/24".parse().unwrap();
        cache.put(&req, &resp, Some(stored_net), Some(24));

        let broader: IpNet = "1.2.0.0/16".parse().unwrap();
        assert!(cache.get(&req, broader).is_none());
    }

    #[test]
    fn distinct_non_overlapping_scopes_both_served() {
        let cache = EcsCache::new(cfg());
        let req = query();
        let resp = response(Rcode::NoError);
        let net_a: IpNet = "1.2.3.0/24".parse().unwrap();
        let net_b: IpNet = "5.6.7.0/24".parse().unwrap();
        cache.put(&req, &resp, Some(net_a), Some(24));
        cache.put(&req, &resp, Some(net_b), Some(24));

        assert!(cache.get(&req, net_a).is_some());
        assert!(cache.get(&req, net_b).is_some());
        let unrelated: IpNet = "9.9.9.0/24".parse().unwrap();
        assert!(cache.get(&req, unrelated).is_none());
    }

    #[test]
    fn no_ecs_entry_is_shared_regardless_of_client_network() {
        let cache = EcsCache::new(cfg());
        let req = query();
        let resp = response(Rcode::NoError);
        cache.put(&req, &resp, None, None);

        let any_net: IpNet = "203.0.113.0/24".parse().unwrap();
        assert!(cache.get(&req, any_net).is_some());
    }
}
