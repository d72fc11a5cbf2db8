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

//! Collaborator interfaces the core consumes. Profile/device DBs,
//! filter-list storage and evaluation, GeoIP, query-log persistence,
//! billing, and TLS/QUIC certificate handling live outside this crate and
//! are reached only through the traits below. `Noop*` impls let the
//! engine (and its tests) run without any of those services wired up.

use crate::{context::RequestInfo, Label};
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use std::net::IpAddr;
use thiserror::Error;

/// A resolved device/profile pair.
#[derive(Debug, Clone)]
pub struct Device {
    /// Device identifier.
    pub id: Label,
    /// Whether this device has linked-IP lookups enabled.
    pub linked_ip: Option<IpAddr>,
}

/// Per-profile filtering policy flags consumed by the special-domain
/// handlers and `MainMW` (§4.4, §6).
#[derive(Debug, Clone, Default)]
pub struct Profile {
    /// Profile identifier.
    pub id: Label,
    /// Block `use-application-dns.net` (Firefox canary, §6).
    pub block_firefox_canary: bool,
    /// Block Apple Private Relay mask domains (§6).
    pub block_private_relay: bool,
    /// TTL to use for synthesized blocked responses (§4.4 MainMW).
    pub blocked_response_ttl_secs: u32,
}

/// GeoIP location (§6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Location {
    /// ISO country code, if known.
    pub country: Option<[u8; 2]>,
    /// Continent code, if known.
    pub continent: Option<[u8; 2]>,
    /// Autonomous system number, if known.
    pub asn: Option<u32>,
}

/// Errors a collaborator call can surface. `NotFound` is a soft condition
/// the caller handles explicitly; `Transport` is the hard failure that
/// propagates as `CoreError::Collaborator` / SERVFAIL (§7).
#[derive(Debug, Error)]
pub enum CollabError {
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// The collaborator could not be reached or errored internally.
    #[error("transport error: {0}")]
    Transport(String),
}

/// `ByDeviceID`/`ByIP` profile and device resolution (§6).
#[async_trait]
pub trait ProfileDb: Send + Sync {
    /// Resolve a profile/device pair by device identifier.
    async fn by_device_id(&self, id: &str) -> Result<(Profile, Device), CollabError>;
    /// Resolve a profile/device pair by client IP (linked-IP lookup).
    async fn by_ip(&self, ip: IpAddr) -> Result<(Profile, Device), CollabError>;
}

/// A filtering decision returned by request/response filtering (§3
/// `FilterResult`). Represented as a closed tagged variant; an "unknown
/// variant" case cannot occur by construction (§9).
pub enum FilterResult {
    /// Neither blocked nor modified.
    Allowed,
    /// The query/response should be blocked entirely.
    Blocked,
    /// The query matched a rewrite rule and `msg` (a response, `msg.is_answer()` true)
    /// should be returned instead of forwarding/resolving further.
    Modified(Message<Bytes>),
    /// A CNAME-rewrite rule fired on the *request*; `msg` (a question,
    /// `msg.is_answer()` false) should be forwarded instead of the original.
    ModifiedRequest(Message<Bytes>),
}

/// Filter-list evaluation for one request (§6 `Filter`). Filter-list
/// storage and rule evaluation themselves are out of scope (§1); this
/// trait is the seam the core calls through.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Filter the outgoing (possibly forwarded) request.
    async fn filter_request(&self, info: &RequestInfo, msg: &Message<Bytes>) -> FilterResult;
    /// Filter the resolved response before it reaches the client.
    async fn filter_response(&self, info: &RequestInfo, msg: &Message<Bytes>) -> FilterResult;
}

/// Resolves a `Filter` for the current request (§6 `FilterStorage`).
#[async_trait]
pub trait FilterStorage: Send + Sync {
    /// The concrete filter type this storage hands out.
    type F: Filter;
    /// Resolve the filter that applies to `info`.
    async fn filter_from_context(&self, info: &RequestInfo) -> Self::F;
}

/// GeoIP lookups (§6).
#[async_trait]
pub trait GeoIp: Send + Sync {
    /// Resolve the location for `host`/`ip`.
    async fn data(&self, host: &str, ip: IpAddr) -> Result<Location, CollabError>;
}

/// Self-identification DNSCheck probe (§4.3 PreServiceMW, §6). A non-`None`
/// response short-circuits the rest of the pipeline.
#[async_trait]
pub trait DnsCheck: Send + Sync {
    /// Possibly answer a self-identification query out of band.
    async fn check(
        &self,
        req: &Message<Bytes>,
        info: &RequestInfo,
    ) -> Result<Option<Message<Bytes>>, CollabError>;
}

/// Safe-browsing hash-prefix matcher (§4.3, §6).
#[async_trait]
pub trait HashMatcher: Send + Sync {
    /// Return every full SHA-256 hash (32 bytes each) whose first 4 bytes
    /// equal `prefix`, plus whether any matched at all.
    async fn match_by_prefix(&self, prefix: [u8; 4]) -> (Vec<[u8; 32]>, bool);
}

/// Query-log persistence (§6). Fire-and-forget: errors are logged, not
/// surfaced.
#[async_trait]
pub trait QueryLog: Send + Sync {
    /// Persist one query-log entry.
    async fn write(&self, info: &RequestInfo, resp_rcode: domain::base::iana::Rcode);
}

/// Billing record emission (§6). Fire-and-forget.
#[async_trait]
pub trait BillStat: Send + Sync {
    /// Record one billable event for `info`.
    async fn record(&self, info: &RequestInfo);
}

/// Per-rule-list hit statistics (§6). Fire-and-forget.
#[async_trait]
pub trait RuleStat: Send + Sync {
    /// Record a filtering decision against the rule list that produced it.
    async fn collect(&self, info: &RequestInfo, rule_list_id: Option<&str>, rule: Option<&str>);
}

/// Anonymous resolved-name statistics (§4.4 PreUpstreamMW, §6).
/// Fire-and-forget.
#[async_trait]
pub trait DnsDb: Send + Sync {
    /// Record a resolved response for anonymous statistics.
    async fn record(&self, resp: &Message<Bytes>, info: &RequestInfo);
}

/// No-op collaborator implementations, used by tests and by deployments
/// that have not wired up the corresponding external service.
pub mod noop {
    use super::*;

    /// A `ProfileDb` that never finds anything.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopProfileDb;

    #[async_trait]
    impl ProfileDb for NoopProfileDb {
        async fn by_device_id(&self, _id: &str) -> Result<(Profile, Device), CollabError> {
            Err(CollabError::NotFound)
        }
        async fn by_ip(&self, _ip: IpAddr) -> Result<(Profile, Device), CollabError> {
            Err(CollabError::NotFound)
        }
    }

    /// A `Filter` that allows everything through unchanged.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AllowAllFilter;

    #[async_trait]
    impl Filter for AllowAllFilter {
        async fn filter_request(&self, _info: &RequestInfo, _msg: &Message<Bytes>) -> FilterResult {
            FilterResult::Allowed
        }
        async fn filter_response(&self, _info: &RequestInfo, _msg: &Message<Bytes>) -> FilterResult {
            FilterResult::Allowed
        }
    }

    /// A `FilterStorage` that always hands out `AllowAllFilter`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopFilterStorage;

    #[async_trait]
    impl FilterStorage for NoopFilterStorage {
        type F = AllowAllFilter;
        async fn filter_from_context(&self, _info: &RequestInfo) -> Self::F {
            AllowAllFilter
        }
    }

    /// A `GeoIp` that never resolves anything.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopGeoIp;

    #[async_trait]
    impl GeoIp for NoopGeoIp {
        async fn data(&self, _host: &str, _ip: IpAddr) -> Result<Location, CollabError> {
            Err(CollabError::NotFound)
        }
    }

    /// A `DnsCheck` that always forwards.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopDnsCheck;

    #[async_trait]
    impl DnsCheck for NoopDnsCheck {
        async fn check(
            &self,
            _req: &Message<Bytes>,
            _info: &RequestInfo,
        ) -> Result<Option<Message<Bytes>>, CollabError> {
            Ok(None)
        }
    }

    /// A `HashMatcher` with an empty hash database.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopHashMatcher;

    #[async_trait]
    impl HashMatcher for NoopHashMatcher {
        async fn match_by_prefix(&self, _prefix: [u8; 4]) -> (Vec<[u8; 32]>, bool) {
            (Vec::new(), false)
        }
    }

    /// A `QueryLog`/`BillStat`/`RuleStat`/`DnsDb` that discards everything.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Discard;

    #[async_trait]
    impl QueryLog for Discard {
        async fn write(&self, _info: &RequestInfo, _resp_rcode: domain::base::iana::Rcode) {}
    }

    #[async_trait]
    impl BillStat for Discard {
        async fn record(&self, _info: &RequestInfo) {}
    }

    #[async_trait]
    impl RuleStat for Discard {
        async fn collect(&self, _info: &RequestInfo, _rule_list_id: Option<&str>, _rule: Option<&str>) {}
    }

    #[async_trait]
    impl DnsDb for Discard {
        async fn record(&self, _resp: &Message<Bytes>, _info: &RequestInfo) {}
    }
}
