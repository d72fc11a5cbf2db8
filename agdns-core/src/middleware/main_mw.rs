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

//! `MainMW` (§4.4, §6): profile resolution, request/response filtering,
//! blocked-response synthesis, the CHAOS-class debug query, and the
//! fire-and-forget query-log/billing/rule-stat calls. Wraps
//! `PreServiceMW`.

use super::block::build_blocked_response;
use super::handler::{Handler, HandlerOutcome};
use crate::collab::{BillStat, CollabError, Filter, FilterResult, FilterStorage, Profile, ProfileDb, QueryLog, RuleStat};
use crate::context::RequestContext;
use crate::{CoreError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::{iana::Class, iana::Rcode, iana::Rtype, Message, MessageBuilder};
use domain::rdata::Txt;
use std::str::FromStr;
use std::sync::Arc;

/// The `MainMW` wrapper (§4.4, §6). Wraps `PreServiceMW`.
pub struct MainMw<H, FS: FilterStorage> {
    inner: H,
    profile_db: Arc<dyn ProfileDb>,
    filter_storage: Arc<FS>,
    query_log: Arc<dyn QueryLog>,
    bill_stat: Arc<dyn BillStat>,
    rule_stat: Arc<dyn RuleStat>,
}

impl<H, FS: FilterStorage> MainMw<H, FS> {
    /// Wrap `inner`, resolving profiles via `profile_db`, filtering via
    /// `filter_storage`, and reporting through the three stats
    /// collaborators.
    pub fn new(
        inner: H,
        profile_db: Arc<dyn ProfileDb>,
        filter_storage: Arc<FS>,
        query_log: Arc<dyn QueryLog>,
        bill_stat: Arc<dyn BillStat>,
        rule_stat: Arc<dyn RuleStat>,
    ) -> Self {
        Self {
            inner,
            profile_db,
            filter_storage,
            query_log,
            bill_stat,
            rule_stat,
        }
    }

    async fn resolve_profile(&self, ctx: &RequestContext) -> Result<Profile> {
        let result = match &ctx.info.device_id {
            Some(id) => self.profile_db.by_device_id(id).await,
            None => self.profile_db.by_ip(ctx.info.client_addr.ip()).await,
        };
        match result {
            Ok((profile, _device)) => Ok(profile),
            Err(CollabError::NotFound) => Ok(Profile::default()),
            Err(CollabError::Transport(msg)) => Err(CoreError::Collaborator("profile_db", msg)),
        }
    }
}

/// Which filtering phase produced the recorded rule/rule-list decision
/// (§6 "Debug CHAOS interface": "one of `req.`/`resp.` prefixed `res-type`,
/// `rule`, `rule-list-id`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecisionPhase {
    Request,
    Response,
}

impl DecisionPhase {
    fn prefix(self) -> &'static str {
        match self {
            DecisionPhase::Request => "req",
            DecisionPhase::Response => "resp",
        }
    }
}

/// One `key.adguard-dns.com.` → TXT-string field of the debug response.
fn debug_field(suffix: &str, value: &str) -> Result<(Box<str>, Txt<Bytes>)> {
    let name = format!("{suffix}.adguard-dns.com.").into_boxed_str();
    let txt = Txt::from_slice(value.as_bytes())
        .map_err(|_| CoreError::Invariant("debug field did not fit a TXT record".into()))?;
    Ok((name, txt))
}

/// Build the CHAOS-class debug response (§4.4, §6 "Debug CHAOS
/// interface"): one TXT answer RR per named field describing the client,
/// device/profile, location, and the filtering decision that was made.
fn debug_response(
    req: &Message<Bytes>,
    ctx: &RequestContext,
    phase: DecisionPhase,
    rule_list_id: Option<&str>,
    rule: Option<&str>,
    res_type: &str,
) -> Result<Message<Bytes>> {
    let country = ctx
        .info
        .location
        .and_then(|l| l.country)
        .map(|c| String::from_utf8_lossy(&c).to_string())
        .unwrap_or_else(|| "-".to_string());
    let asn = ctx
        .info
        .location
        .and_then(|l| l.asn)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    let prefix = phase.prefix();

    let fields = [
        debug_field("client-ip", &ctx.info.client_addr.ip().to_string())?,
        debug_field(
            "device-id",
            ctx.info.device_id.as_deref().unwrap_or("-"),
        )?,
        debug_field(
            "profile-id",
            ctx.info.profile_id.as_deref().unwrap_or("-"),
        )?,
        debug_field("country", &country)?,
        debug_field("asn", &asn)?,
        debug_field(&format!("{prefix}.res-type"), res_type)?,
        debug_field(&format!("{prefix}.rule"), rule.unwrap_or("-"))?,
        debug_field(
            &format!("{prefix}.rule-list-id"),
            rule_list_id.unwrap_or("-"),
        )?,
    ];

    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(crate::MAX_LEN))?;
    *builder.header_mut() = req.header();
    builder.header_mut().set_qr(true);
    builder.header_mut().set_aa(true);
    builder.header_mut().set_rcode(Rcode::NoError);

    let mut builder = builder.question();
    for item in req.question().flatten() {
        builder.push(item)?;
    }

    let mut builder = builder.answer();
    for (name, txt) in &fields {
        let dname = domain::base::Dname::<Bytes>::from_str(name)
            .map_err(|_| CoreError::Invariant("debug field name did not parse".into()))?;
        builder.push((&dname, 0, Class::Ch, txt.clone()))?;
    }
    Ok(builder.into_message())
}

#[async_trait]
impl<H, FS> Handler for MainMw<H, FS>
where
    H: Handler,
    FS: FilterStorage + Send + Sync,
{
    async fn handle(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        let profile = self.resolve_profile(ctx).await?;
        let filter = self.filter_storage.filter_from_context(&ctx.info).await;

        let mut effective_req = req.clone();
        let mut short_circuit: Option<Message<Bytes>> = None;
        // Filter-list rule evaluation is out of scope (§1): `FilterResult`
        // carries no rule identifier, so these stay "-" in the debug
        // response; `phase`/`res_type` still record which stage decided.
        let rule_list_id: Option<&str> = None;
        let rule: Option<&str> = None;
        let mut phase = DecisionPhase::Request;
        let mut res_type = "allowed";

        match filter.filter_request(&ctx.info, req).await {
            FilterResult::Allowed => {}
            FilterResult::Blocked => {
                res_type = "blocked";
                short_circuit = Some(build_blocked_response(req, profile.blocked_response_ttl_secs)?);
            }
            FilterResult::Modified(msg) => {
                res_type = "modified";
                short_circuit = Some(msg);
            }
            FilterResult::ModifiedRequest(msg) => {
                res_type = "modified-request";
                effective_req = msg;
            }
        }

        let resp = if let Some(resp) = short_circuit {
            resp
        } else {
            let downstream = self.inner.handle(ctx, &effective_req).await?;
            let resp = match downstream {
                HandlerOutcome::Respond(resp) => resp,
                HandlerOutcome::Drop => return Ok(HandlerOutcome::Drop),
            };
            phase = DecisionPhase::Response;
            match filter.filter_response(&ctx.info, &resp).await {
                FilterResult::Allowed => {
                    res_type = "allowed";
                    resp
                }
                FilterResult::Blocked => {
                    res_type = "blocked";
                    build_blocked_response(req, profile.blocked_response_ttl_secs)?
                }
                FilterResult::Modified(msg) => {
                    res_type = "modified";
                    msg
                }
                FilterResult::ModifiedRequest(_) => resp,
            }
        };

        self.query_log.write(&ctx.info, resp.header().rcode()).await;
        self.bill_stat.record(&ctx.info).await;
        self.rule_stat.collect(&ctx.info, rule_list_id, rule).await;

        if ctx.info.qclass == Class::Ch && ctx.info.qtype == Rtype::Txt {
            return Ok(HandlerOutcome::Respond(debug_response(
                req, ctx, phase, rule_list_id, rule, res_type,
            )?));
        }

        Ok(HandlerOutcome::Respond(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::noop::{Discard, NoopFilterStorage, NoopProfileDb};
    use crate::context::{Protocol, RequestInfo, ServerInfo};
    use domain::base::{Dname, MessageBuilder as MB};
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::time::Instant;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, _ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
            let mut builder = MB::from_target(BytesMut::new()).unwrap();
            builder.header_mut().set_id(req.header().id());
            builder.header_mut().set_qr(true);
            let mut qbuilder = builder.question();
            for item in req.question().flatten() {
                let _ = qbuilder.push(item);
            }
            Ok(HandlerOutcome::Respond(qbuilder.answer().into_message()))
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            server: ServerInfo {
                name: "test".into(),
                bind_addr: "0.0.0.0:53".parse().unwrap(),
                protocol: Protocol::Udp,
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

    fn request() -> Message<Bytes> {
        let dname = Dname::<Bytes>::from_str("example.com.").unwrap();
        let mut builder = MB::from_target(BytesMut::new()).unwrap().question();
        let _ = builder.push((&dname, Rtype::A, Class::In));
        builder.into_message()
    }

    #[tokio::test]
    async fn unfiltered_request_passes_through_to_inner() {
        let mw = MainMw::new(
            EchoHandler,
            Arc::new(NoopProfileDb),
            Arc::new(NoopFilterStorage),
            Arc::new(Discard),
            Arc::new(Discard),
            Arc::new(Discard),
        );
        let outcome = mw.handle(&ctx(), &request()).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Respond(_)));
    }

    #[tokio::test]
    async fn chaos_txt_query_gets_debug_response() {
        let mut c = ctx();
        c.info.qclass = Class::Ch;
        c.info.qtype = Rtype::Txt;
        let mw = MainMw::new(
            EchoHandler,
            Arc::new(NoopProfileDb),
            Arc::new(NoopFilterStorage),
            Arc::new(Discard),
            Arc::new(Discard),
            Arc::new(Discard),
        );
        let outcome = mw.handle(&c, &request()).await.unwrap();
        match outcome {
            HandlerOutcome::Respond(resp) => {
                assert_eq!(resp.header().rcode(), Rcode::NoError);
                let answers: Vec<_> = resp.answer().unwrap().flatten().collect();
                assert_eq!(answers.len(), 8);
                assert!(answers.iter().all(|a| a.rtype() == Rtype::Txt));
            }
            HandlerOutcome::Drop => panic!("debug query must always answer"),
        }
    }
}
