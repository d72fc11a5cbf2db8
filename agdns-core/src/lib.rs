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

#![deny(unsafe_code)]
//! Core request-handling engine for `agdns`: the middleware pipeline, the
//! forward resolver with upstream pools and healthchecks, the rate-limit
//! engine, the pre-upstream cache layer, metrics observation and the
//! special-domain handlers (DDR, `resolver.arpa`, Firefox canary, Apple
//! Private Relay).

/// Collaborator interfaces the core consumes but does not implement
/// (profile/device DB, filter storage, GeoIP, query log, billing, ...).
pub mod collab;
/// Request/server-scoped context carried through the pipeline.
pub mod context;
/// Unified error type and per-module error enums.
pub mod error;
/// The forward resolver: upstream selection, pooled exchange, healthcheck.
pub mod forward;
/// The metrics observation layer.
pub mod metrics;
/// The middleware pipeline (`RateLimitMW`, `InitialMW`, ... `PreUpstreamMW`).
pub mod middleware;
/// Pre-upstream cache layer: plain LRU and ECS-aware cache.
pub mod cache;
/// The rate-limit engine ("backoff").
pub mod ratelimit;
/// Special-domain short-circuit handlers (DDR, resolver.arpa, canaries).
pub mod special;

pub use error::{CoreError, Result};

use std::sync::Arc;

/// Shorthand for a reference-counted, interned label (server name, upstream
/// tag, filtering-group tag). Cloning is O(1).
pub type Label = Arc<str>;

/// Maximum TTL as defined in <https://tools.ietf.org/html/rfc2181>: 2147483647.
/// We never need more than a day in cached responses.
pub const MAX_TTL: u32 = 86400_u32;

/// Maximum size of an uncompressed DNS message we are willing to build or
/// parse on the hot path (matches `domain`'s recommended EDNS(0) bufsize).
pub const MAX_LEN: usize = 4096;

/// Maximum size of a message sent over a stream-based transport (TCP/TLS),
/// per RFC 1035 §4.2.2.
pub const MAX_MSG_SIZE: usize = 65535;
