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

//! `PreServiceMW` (§4.3, §6): a `DnsCheck` self-identification probe, then
//! safe-browsing hash-prefix TXT lookups, before anything reaches the
//! cache or forward resolver.

use super::handler::{Handler, HandlerOutcome};
use crate::collab::{DnsCheck, HashMatcher};
use crate::context::RequestContext;
use crate::{CoreError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::{iana::Class, iana::Rcode, iana::Rtype, Message, MessageBuilder};
use domain::rdata::Txt;
use std::sync::Arc;

/// Suffix a safe-browsing hash-prefix query must end with, e.g.
/// `sb.dns.adguard.com.` (configurable per §6).
pub struct SafeBrowsingConfig {
    /// The configured suffix, FQDN form (trailing dot).
    pub suffix: String,
}

/// The `PreServiceMW` wrapper (§4.3, §6). Wraps `MainMW`.
pub struct PreServiceMw<H, D, M> {
    inner: H,
    dns_check: Arc<D>,
    hash_matcher: Arc<M>,
    safe_browsing: SafeBrowsingConfig,
}

impl<H, D, M> PreServiceMw<H, D, M> {
    /// Wrap `inner` behind a self-ID probe and safe-browsing TXT lookups.
    pub fn new(inner: H, dns_check: Arc<D>, hash_matcher: Arc<M>, safe_browsing: SafeBrowsingConfig) -> Self {
        Self {
            inner,
            dns_check,
            hash_matcher,
            safe_browsing,
        }
    }
}

/// A query of the form `<hex-prefix>.<suffix>` decodes to a 4-byte prefix
/// (matching `HashMatcher::match_by_prefix`'s signature) if the first
/// label is at least 8 hex characters and the remainder of the name is
/// exactly `suffix`.
fn parse_safe_browsing_prefix(host: &str, suffix: &str) -> Option<[u8; 4]> {
    let label = host.strip_suffix(suffix)?.strip_suffix('.')?;
    if label.len() < 8 || !label.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut prefix = [0u8; 4];
    hex::decode_to_slice(&label[..8], &mut prefix).ok()?;
    Some(prefix)
}

fn txt_response(req: &Message<Bytes>, hashes: &[[u8; 32]]) -> Result<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(bytes::BytesMut::with_capacity(crate::MAX_LEN))?;
    *builder.header_mut() = req.header();
    builder.header_mut().set_qr(true);
    builder.header_mut().set_aa(true);
    builder.header_mut().set_rcode(Rcode::NoError);

    let mut builder = builder.question();
    for item in req.question().flatten() {
        builder.push(item)?;
    }

    let qname = req.first_question().ok_or_else(|| CoreError::Protocol("no question".into()))?;
    let qname = qname
        .qname()
        .to_dname::<Bytes>()
        .map_err(|_| CoreError::Protocol("unparseable qname".into()))?;

    let mut builder = builder.answer();
    for hash in hashes {
        let hex_hash = hex::encode(hash);
        let txt = Txt::from_slice(hex_hash.as_bytes())
            .map_err(|_| CoreError::Invariant("hex-encoded hash did not fit a TXT record".into()))?;
        builder.push((&qname, 60, Class::In, txt))?;
    }
    Ok(builder.into_message())
}

#[async_trait]
impl<H, D, M> Handler for PreServiceMw<H, D, M>
where
    H: Handler,
    D: DnsCheck,
    M: HashMatcher,
{
    async fn handle(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        if let Some(resp) = self
            .dns_check
            .check(req, &ctx.info)
            .await
            .map_err(|e| CoreError::Collaborator("dns_check", e.to_string()))?
        {
            return Ok(HandlerOutcome::Respond(resp));
        }

        if ctx.info.qtype == Rtype::Txt {
            if let Some(prefix) = parse_safe_browsing_prefix(&ctx.info.host, &self.safe_browsing.suffix) {
                let (hashes, matched) = self.hash_matcher.match_by_prefix(prefix).await;
                if matched {
                    return Ok(HandlerOutcome::Respond(txt_response(req, &hashes)?));
                }
                return Ok(HandlerOutcome::Respond(crate::special::empty_response(
                    req,
                    Rcode::NoError,
                )?));
            }
        }

        self.inner.handle(ctx, req).await
    }
}
