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

//! `PreUpstreamMW`: the last middleware before the forward resolver.
//! Collapses Android's per-device DoT/DoH metric-collection hostnames
//! (`<8-hex-id>-dnsotls-ds.metric.gstatic.com.`) onto one canonical name
//! before resolving, then restores the client's original name in the
//! answer, and records every resolved response with the anonymous
//! `DnsDb` statistics collaborator. Uses the same header-copy /
//! question-copy / per-section `into_record` rebuild as
//! `cache::entry::rewrite_ttls`, here rewriting owner names instead of
//! TTLs.

use super::handler::{Handler, HandlerOutcome};
use crate::collab::DnsDb;
use crate::context::RequestContext;
use crate::{CoreError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::{Dname, Message, MessageBuilder, Record, ToDname};
use domain::rdata::AllRecordData;
use std::{str::FromStr, sync::Arc};

const ANDROID_METRIC_SUFFIX: &str = "-dnsotls-ds.metric.gstatic.com.";
const ANDROID_METRIC_CANONICAL: &str = "dnsotls-ds.metric.gstatic.com.";

/// If `host` is an Android per-device metric-collection hostname, the
/// canonical name every variant should share a cache slot and upstream
/// query under. `host` must already be lowercased (§4.4).
pub fn canonical_android_metric_name(host: &str) -> Option<&'static str> {
    let prefix = host.strip_suffix(ANDROID_METRIC_SUFFIX)?;
    if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(ANDROID_METRIC_CANONICAL)
    } else {
        None
    }
}

/// Rebuild `req` with its single question's qname replaced by `canonical`,
/// keeping qtype/qclass/header untouched.
pub fn rewrite_request_name(req: &Message<Bytes>, canonical: &str) -> Result<Message<Bytes>> {
    let canonical_name = Dname::<Bytes>::from_str(canonical)
        .map_err(|_| CoreError::Invariant("canonical android metric name is not a valid Dname".into()))?;
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(crate::MAX_LEN))?;
    *builder.header_mut() = req.header();
    let mut builder = builder.question();
    if let Some(question) = req.first_question() {
        builder.push((&canonical_name, question.qtype(), question.qclass()))?;
    }
    Ok(builder.answer().into_message())
}

/// Rebuild `resp`, replacing every owner name equal to `canonical` (in the
/// question and every RR section) with `original`.
pub fn restore_response_name(
    resp: &Message<Bytes>,
    canonical: &Dname<Bytes>,
    original: &Dname<Bytes>,
) -> Result<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(resp.as_slice().len() + 64))?;
    *builder.header_mut() = resp.header();

    let mut builder = builder.question();
    for item in resp.question().flatten() {
        let is_canonical = item
            .qname()
            .to_dname::<Bytes>()
            .map(|n| &n == canonical)
            .unwrap_or(false);
        if is_canonical {
            builder.push((original, item.qtype(), item.qclass()))?;
        } else {
            builder.push(item)?;
        }
    }

    let mut builder = builder.answer();
    for item in resp.answer()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            let is_canonical = record
                .owner()
                .to_dname::<Bytes>()
                .map(|n| &n == canonical)
                .unwrap_or(false);
            if is_canonical {
                builder.push(Record::new(
                    original.clone(),
                    record.class(),
                    record.ttl(),
                    record.data().clone(),
                ))?;
            } else {
                builder.push(record)?;
            }
        }
    }

    let mut builder = builder.authority();
    for item in resp.authority()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push(record)?;
        }
    }

    let mut builder = builder.additional();
    for item in resp.additional()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push(record)?;
        }
    }

    Ok(builder.into_message())
}

/// The `PreUpstreamMW` wrapper (§4.4). Wraps the forward handler (or
/// whatever sits directly below it) and is itself wrapped by `CacheMW`.
pub struct PreUpstreamMw<H, D> {
    inner: H,
    dns_db: Arc<D>,
}

impl<H, D> PreUpstreamMw<H, D> {
    /// Wrap `inner`, recording every resolved response with `dns_db`.
    pub fn new(inner: H, dns_db: Arc<D>) -> Self {
        Self { inner, dns_db }
    }
}

#[async_trait]
impl<H, D> Handler for PreUpstreamMw<H, D>
where
    H: Handler,
    D: DnsDb,
{
    async fn handle(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        let canonical = canonical_android_metric_name(&ctx.info.host);

        let outcome = match canonical {
            Some(canon) => {
                let rewritten = rewrite_request_name(req, canon)?;
                match self.inner.handle(ctx, &rewritten).await? {
                    HandlerOutcome::Respond(resp) => {
                        let canon_name = Dname::<Bytes>::from_str(canon)
                            .unwrap_or_else(|_| Dname::root_bytes());
                        let original_name = req
                            .first_question()
                            .and_then(|q| q.qname().to_dname::<Bytes>().ok())
                            .unwrap_or_else(Dname::root_bytes);
                        HandlerOutcome::Respond(restore_response_name(&resp, &canon_name, &original_name)?)
                    }
                    HandlerOutcome::Drop => HandlerOutcome::Drop,
                }
            }
            None => self.inner.handle(ctx, req).await?,
        };

        if let HandlerOutcome::Respond(ref resp) = outcome {
            self.dns_db.record(resp, &ctx.info).await;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_hex_prefixed_metric_hostname() {
        assert_eq!(
            canonical_android_metric_name("12345678-dnsotls-ds.metric.gstatic.com."),
            Some(ANDROID_METRIC_CANONICAL)
        );
        assert_eq!(
            canonical_android_metric_name("abcdef00-dnsotls-ds.metric.gstatic.com."),
            Some(ANDROID_METRIC_CANONICAL)
        );
    }

    #[test]
    fn rejects_non_hex_prefix_and_unrelated_hosts() {
        assert_eq!(canonical_android_metric_name("not-hex-ds.metric.gstatic.com."), None);
        assert_eq!(canonical_android_metric_name("example.com."), None);
    }

    #[test]
    fn rewrite_then_restore_round_trips_question_name() {
        use domain::base::iana::{Class, Rtype};
        let mut builder = MessageBuilder::from_target(BytesMut::new()).unwrap().question();
        let original = Dname::<Bytes>::from_str("12345678-dnsotls-ds.metric.gstatic.com.").unwrap();
        let _ = builder.push((&original, Rtype::A, Class::In));
        let req = builder.into_message();

        let rewritten = rewrite_request_name(&req, ANDROID_METRIC_CANONICAL).unwrap();
        let q = rewritten.first_question().unwrap();
        assert_eq!(
            q.qname().to_dname::<Bytes>().unwrap().to_string(),
            ANDROID_METRIC_CANONICAL
        );

        let canon_name = Dname::<Bytes>::from_str(ANDROID_METRIC_CANONICAL).unwrap();
        let restored = restore_response_name(&rewritten, &canon_name, &original).unwrap();
        let q = restored.first_question().unwrap();
        assert_eq!(
            q.qname().to_dname::<Bytes>().unwrap().to_string(),
            original.to_string()
        );
    }
}
