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

//! `InitialMW` (§4.4, §6): the outermost per-query handler below
//! `RateLimitMW`. Rejects malformed multi-question packets, dispatches the
//! special-domain handlers (`crate::special`), consults `ProfileDb` for the
//! two profile-gated special cases, and enforces RFC 6840 §5.8 on every
//! response this engine ever returns: a resolver that does not itself
//! perform DNSSEC validation (a declared non-goal, §1) must never set the
//! `AD` bit, so it is cleared here regardless of which branch produced the
//! response.

use super::handler::{Handler, HandlerOutcome};
use crate::collab::{CollabError, Profile, ProfileDb};
use crate::context::RequestContext;
use crate::special::{self, ddr::DdrTarget, SpecialCase};
use crate::{CoreError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, Message, MessageBuilder};
use domain::rdata::AllRecordData;
use std::sync::Arc;

/// The `InitialMW` wrapper (§4.4). Wraps `MainMW`.
pub struct InitialMw<H, D> {
    inner: H,
    profile_db: Arc<D>,
    ddr_targets: Vec<DdrTarget>,
}

impl<H, D> InitialMw<H, D> {
    /// Wrap `inner`, dispatching DDR/`resolver.arpa`/Firefox-canary/Private
    /// Relay queries before anything reaches it. `ddr_targets` is the
    /// configured set of DDR SVCB answers (§6 "DDR").
    pub fn new(inner: H, profile_db: Arc<D>, ddr_targets: Vec<DdrTarget>) -> Self {
        Self {
            inner,
            profile_db,
            ddr_targets,
        }
    }
}

impl<H, D: ProfileDb> InitialMw<H, D> {
    async fn profile(&self, ctx: &RequestContext) -> Result<Profile> {
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

#[async_trait]
impl<H, D> Handler for InitialMw<H, D>
where
    H: Handler,
    D: ProfileDb,
{
    async fn handle(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        if req.header_counts().qdcount() != 1 {
            return Ok(HandlerOutcome::Respond(strip_ad_bit(special::empty_response(
                req,
                Rcode::FormErr,
            )?)?));
        }

        // §4.4 AD-bit law: a response this engine did not itself validate
        // (every branch below) must never claim AD; only a downstream
        // answer that both asserts AD and whose originating request asked
        // for it (AD or DO) may keep the bit (§8 "AD-bit law").
        let resp = match special::classify(&ctx.info.host, ctx.info.qtype) {
            Some(SpecialCase::Ddr) => {
                special::ddr::build_response(req, &self.ddr_targets, ctx.info.device_id.as_deref())?
            }
            Some(SpecialCase::ResolverArpaOther) => special::resolver_arpa::build_response(req)?,
            Some(SpecialCase::FirefoxCanary) => {
                if self.profile(ctx).await?.block_firefox_canary {
                    special::firefox::build_response(req)?
                } else {
                    return self.forward(ctx, req).await;
                }
            }
            Some(SpecialCase::PrivateRelay) => {
                if self.profile(ctx).await?.block_private_relay {
                    special::private_relay::build_response(req)?
                } else {
                    return self.forward(ctx, req).await;
                }
            }
            None => return self.forward(ctx, req).await,
        };

        Ok(HandlerOutcome::Respond(set_ad_bit(resp, false)?))
    }
}

/// Whether the client asked for AD-bit-aware processing at all: either the
/// AD bit itself, or DO (DNSSEC OK, RFC 6840 §5.8) on the OPT record.
fn wants_ad(req: &Message<Bytes>) -> bool {
    req.header().ad() || req.opt().map(|opt| opt.dnssec_ok()).unwrap_or(false)
}

impl<H: Handler, D: ProfileDb> InitialMw<H, D> {
    async fn forward(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        // §4.4: save the client's AD/DO intent, then force-set AD on the
        // query handed downstream so an upstream that does validate reports
        // it; the saved intent (not the forced bit) gates what reaches the
        // client (§8 "AD-bit law").
        let client_wants_ad = wants_ad(req);
        let forwarded_req = set_ad_bit(req.clone(), true)?;
        match self.inner.handle(ctx, &forwarded_req).await? {
            HandlerOutcome::Respond(resp) => {
                let ad = resp.header().ad() && client_wants_ad;
                Ok(HandlerOutcome::Respond(set_ad_bit(resp, ad)?))
            }
            HandlerOutcome::Drop => Ok(HandlerOutcome::Drop),
        }
    }
}

/// Rewrite the `AD` bit on a response to `ad` (§8 "AD-bit law"). Rebuilds
/// the message the way `pre_upstream::restore_response_name` rebuilds a
/// renamed one, here leaving every name/record untouched and only flipping
/// one header bit.
fn set_ad_bit(msg: Message<Bytes>, ad: bool) -> Result<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(msg.as_slice().len()))?;
    *builder.header_mut() = msg.header();
    builder.header_mut().set_ad(ad);

    let mut builder = builder.question();
    for item in msg.question().flatten() {
        builder.push(item)?;
    }

    let mut builder = builder.answer();
    for item in msg.answer()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push(record)?;
        }
    }

    let mut builder = builder.authority();
    for item in msg.authority()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push(record)?;
        }
    }

    let mut builder = builder.additional();
    for item in msg.additional()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push(record)?;
        }
    }

    Ok(builder.into_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::noop::NoopProfileDb;
    use crate::collab::Device;
    use crate::context::{Protocol, RequestInfo, ServerInfo};
    use domain::base::{iana::Class, iana::Rtype, Dname, MessageBuilder as MB};
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
            builder.header_mut().set_ad(true);
            let mut qbuilder = builder.question();
            for item in req.question().flatten() {
                let _ = qbuilder.push(item);
            }
            Ok(HandlerOutcome::Respond(qbuilder.answer().into_message()))
        }
    }

    struct AlwaysBlockProfileDb;

    #[async_trait]
    impl ProfileDb for AlwaysBlockProfileDb {
        async fn by_device_id(&self, _id: &str) -> std::result::Result<(Profile, Device), CollabError> {
            self.by_ip([127, 0, 0, 1].into()).await
        }
        async fn by_ip(&self, _ip: std::net::IpAddr) -> std::result::Result<(Profile, Device), CollabError> {
            Ok((
                Profile {
                    block_firefox_canary: true,
                    block_private_relay: true,
                    ..Profile::default()
                },
                Device {
                    id: "dev".into(),
                    linked_ip: None,
                },
            ))
        }
    }

    fn ctx(host: &str, qtype: Rtype) -> RequestContext {
        RequestContext {
            server: ServerInfo {
                name: "test".into(),
                bind_addr: "0.0.0.0:53".parse().unwrap(),
                protocol: Protocol::Udp,
                linked_ip_enabled: true,
            },
            info: RequestInfo {
                client_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
                host: host.into(),
                qtype,
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

    fn request(host: &str, qtype: Rtype) -> Message<Bytes> {
        let dname = Dname::<Bytes>::from_str(host).unwrap();
        let mut builder = MB::from_target(BytesMut::new()).unwrap().question();
        let _ = builder.push((&dname, qtype, Class::In));
        builder.into_message()
    }

    #[tokio::test]
    async fn unmatched_host_forwards_and_clears_ad_bit() {
        let mw = InitialMw::new(EchoHandler, Arc::new(NoopProfileDb), Vec::new());
        let outcome = mw.handle(&ctx("example.com.", Rtype::A), &request("example.com.", Rtype::A)).await.unwrap();
        match outcome {
            HandlerOutcome::Respond(resp) => assert!(!resp.header().ad()),
            HandlerOutcome::Drop => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn resolver_arpa_other_is_nodata_without_reaching_inner() {
        let mw = InitialMw::new(EchoHandler, Arc::new(NoopProfileDb), Vec::new());
        let outcome = mw
            .handle(&ctx("foo.resolver.arpa.", Rtype::A), &request("foo.resolver.arpa.", Rtype::A))
            .await
            .unwrap();
        match outcome {
            HandlerOutcome::Respond(resp) => {
                assert_eq!(resp.header().rcode(), Rcode::NoError);
                assert_eq!(resp.header_counts().ancount(), 0);
            }
            HandlerOutcome::Drop => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn firefox_canary_blocked_when_profile_opts_in() {
        let mw = InitialMw::new(EchoHandler, Arc::new(AlwaysBlockProfileDb), Vec::new());
        let outcome = mw
            .handle(
                &ctx("use-application-dns.net.", Rtype::A),
                &request("use-application-dns.net.", Rtype::A),
            )
            .await
            .unwrap();
        match outcome {
            HandlerOutcome::Respond(resp) => assert_eq!(resp.header().rcode(), Rcode::Refused),
            HandlerOutcome::Drop => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn firefox_canary_forwarded_when_profile_allows() {
        let mw = InitialMw::new(EchoHandler, Arc::new(NoopProfileDb), Vec::new());
        let outcome = mw
            .handle(
                &ctx("use-application-dns.net.", Rtype::A),
                &request("use-application-dns.net.", Rtype::A),
            )
            .await
            .unwrap();
        match outcome {
            HandlerOutcome::Respond(resp) => assert_eq!(resp.header().rcode(), Rcode::NoError),
            HandlerOutcome::Drop => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn ad_bit_set_only_when_client_asked_and_downstream_agrees() {
        let mw = InitialMw::new(EchoHandler, Arc::new(NoopProfileDb), Vec::new());
        let mut req = request("example.com.", Rtype::A);
        req.header_mut().set_ad(true);

        let outcome = mw.handle(&ctx("example.com.", Rtype::A), &req).await.unwrap();
        match outcome {
            HandlerOutcome::Respond(resp) => {
                assert!(resp.header().ad(), "downstream AD + client AD must survive");
            }
            HandlerOutcome::Drop => panic!("expected a response"),
        }
    }
}
