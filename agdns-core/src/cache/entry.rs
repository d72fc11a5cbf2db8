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

//! Stored cache entries and TTL bookkeeping (§3 `CacheEntry`, §8 "Cache TTL
//! monotonicity").

use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, Message, MessageBuilder};
use domain::rdata::AllRecordData;
use std::time::{Duration, Instant};

/// A stored response, TTL-clamped per §4.3 and re-served with remaining TTL
/// written back into every RR (§8 "Cache TTL monotonicity").
#[derive(Clone)]
pub struct CacheEntry {
    /// The full wire-encoded response, as originally received.
    message: Bytes,
    /// The `rcode` carried by `message`, cached for quick gating.
    pub rcode: Rcode,
    /// TTL at the moment the entry was stored (already `max(MinTTL, min-RR-TTL)`,
    /// or `MinTTL` flat if `OverrideTTL`).
    pub stored_ttl: u32,
    /// When the entry was fetched from upstream.
    pub fetched_at: Instant,
    /// Optional ECS scope-prefix certified by the upstream (ECS cache only).
    pub scope_prefix: Option<u8>,
}

impl CacheEntry {
    /// Store a freshly-fetched response. `ttl` must already reflect
    /// `max(MinTTL, min(TTL of all RRs))`, or the flat `MinTTL` override.
    pub fn new(message: Bytes, rcode: Rcode, ttl: u32, scope_prefix: Option<u8>) -> Self {
        Self {
            message,
            rcode,
            stored_ttl: ttl,
            fetched_at: Instant::now(),
            scope_prefix,
        }
    }

    /// Remaining TTL at `now`, per §8: `max(MinTTL, origTTL - (t -
    /// fetchedAt))`, never negative and never exceeding the original.
    pub fn remaining_ttl(&self, min_ttl: u32) -> u32 {
        let elapsed = self.fetched_at.elapsed().as_secs() as u32;
        self.stored_ttl
            .saturating_sub(elapsed)
            .max(min_ttl)
            .min(self.stored_ttl)
    }

    /// True once the entry's stored TTL has fully elapsed.
    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() >= Duration::from_secs(self.stored_ttl as u64)
    }

    /// Produce a servable copy of the response with every RR's TTL
    /// rewritten to the remaining TTL (§4.3 "On serve, remaining TTL is
    /// written back into every RR").
    pub fn to_served_message(&self, min_ttl: u32) -> Result<Message<Bytes>, domain::base::ShortBuf> {
        let remaining = self.remaining_ttl(min_ttl);
        rewrite_ttls(&self.message, remaining)
    }
}

/// Rewrite the TTL field of every resource record in `wire` to `ttl`,
/// leaving the header and question section untouched. Rebuilds the
/// message by copying the header and question, then re-pushing each
/// section's records with the new TTL.
fn rewrite_ttls(wire: &Bytes, ttl: u32) -> Result<Message<Bytes>, domain::base::ShortBuf> {
    let msg = Message::from_octets(wire.clone())?;

    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(wire.len()))?;
    *builder.header_mut() = msg.header();

    let mut builder = builder.question();
    for item in msg.question().flatten() {
        builder.push(item)?;
    }

    let mut builder = builder.answer();
    for item in msg.answer()? {
        if let Some(mut record) = item?.into_record::<AllRecordData<_, _>>()? {
            record.set_ttl(ttl);
            builder.push(record)?;
        }
    }

    let mut builder = builder.authority();
    for item in msg.authority()? {
        if let Some(mut record) = item?.into_record::<AllRecordData<_, _>>()? {
            record.set_ttl(ttl);
            builder.push(record)?;
        }
    }

    let mut builder = builder.additional();
    for item in msg.additional()? {
        if let Some(mut record) = item?.into_record::<AllRecordData<_, _>>()? {
            if record.rtype() != domain::base::iana::Rtype::Opt {
                record.set_ttl(ttl);
            }
            builder.push(record)?;
        }
    }

    Ok(builder.into_message())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_ttl_clamped_to_min_and_never_exceeds_original() {
        let entry = CacheEntry::new(Bytes::new(), Rcode::NoError, 300, None);
        assert_eq!(entry.remaining_ttl(0), 300);
        assert!(entry.remaining_ttl(0) <= 300);
    }
}
