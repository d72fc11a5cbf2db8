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

//! The pipeline seam: every middleware and the forward resolver itself
//! implement `Handler`, so the outer-to-inner composition
//! `RateLimitMW(InitialMW(MainMW(PreServiceMW(CacheMW(PreUpstreamMW(..))))))`
//! is just nested struct construction behind one uniform entry point.

use crate::context::RequestContext;
use crate::forward::ForwardResolver;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use domain::base::Message;
use std::{sync::Arc, time::Duration, time::Instant};

/// What a `Handler` produced for one request.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Send `0` back to the client.
    Respond(Message<Bytes>),
    /// Send nothing (§7 "Policy": rate-limit drops, spoofed peers, ...).
    Drop,
}

/// One link in the request-handling pipeline (§4.4). Implementors receive
/// the immutable per-request context plus the message to act on -- which is
/// not always the original wire request, since `PreUpstreamMW` forwards a
/// rewritten copy to its inner handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle `req`, either producing a response or deciding to drop it.
    async fn handle(&self, ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome>;
}

/// The innermost link: hands the request to the forward resolver (§4.1).
/// Everything above this point in the pipeline has already decided the
/// query is worth resolving.
pub struct ForwardHandler {
    resolver: Arc<ForwardResolver>,
    handle_timeout: Duration,
}

impl ForwardHandler {
    /// Wrap `resolver`, bounding every resolution attempt by
    /// `handle_timeout` (§5 "mandatory per-query handle timeout").
    pub fn new(resolver: Arc<ForwardResolver>, handle_timeout: Duration) -> Self {
        Self {
            resolver,
            handle_timeout,
        }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, _ctx: &RequestContext, req: &Message<Bytes>) -> Result<HandlerOutcome> {
        let deadline = Instant::now() + self.handle_timeout;
        let (resp, _network) = self.resolver.resolve(req, deadline).await?;
        Ok(HandlerOutcome::Respond(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Protocol, RequestInfo, ServerInfo};
    use crate::forward::healthcheck::HealthcheckConfig;
    use crate::forward::{Network, Upstream};
    use domain::base::{iana::Class, iana::Rtype, Dname, MessageBuilder};
    use std::fmt;
    use std::net::SocketAddr;
    use std::str::FromStr;

    struct EchoUpstream;

    impl fmt::Display for EchoUpstream {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "echo")
        }
    }

    #[async_trait]
    impl Upstream for EchoUpstream {
        async fn exchange(
            &self,
            req: &Message<Bytes>,
            _deadline: Instant,
        ) -> crate::forward::Result<(Message<Bytes>, Network)> {
            let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
                .unwrap()
                .question();
            let name = Dname::<Bytes>::from_str("example.com.").unwrap();
            let _ = builder.push((&name, Rtype::A, Class::In));
            let mut msg = builder.into_message();
            msg.header_mut().set_id(req.header().id());
            msg.header_mut().set_qr(true);
            Ok((msg, Network::Udp))
        }
        async fn close(&self) {}
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
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
            .unwrap()
            .question();
        let name = Dname::<Bytes>::from_str("example.com.").unwrap();
        let _ = builder.push((&name, Rtype::A, Class::In));
        builder.into_message()
    }

    #[tokio::test]
    async fn forward_handler_delegates_to_resolver() {
        let resolver = Arc::new(ForwardResolver::new(
            vec![Arc::new(EchoUpstream)],
            vec![],
            HealthcheckConfig::default(),
        ));
        let handler = ForwardHandler::new(resolver, Duration::from_secs(2));
        let outcome = handler.handle(&ctx(), &request()).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Respond(_)));
    }
}
