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

//! A single addressable upstream resolver and its UDP-then-TCP-on-truncation
//! exchange.

use super::{
    error::{is_network_io_error, ForwardError, Result},
    pool::{ConnFactory, UpstreamPool},
};
use crate::{MAX_LEN, MAX_MSG_SIZE};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::{Message, ToDname};
use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::timeout,
};

/// Network an exchange actually used, distinct from the configured
/// preference (§3 `Upstream`, §4.1 "return `(resp, actual-network)`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// UDP datagram.
    Udp,
    /// TCP stream.
    Tcp,
}

impl Network {
    /// Canonical label used in metrics (§4.5).
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Udp => "udp",
            Network::Tcp => "tcp",
        }
    }
}

/// Network preference configured for an upstream (§3 `Upstream`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPref {
    /// Prefer UDP, fall back to TCP on truncation.
    Any,
    /// UDP only.
    Udp,
    /// TCP only.
    Tcp,
}

/// Capability set every upstream exposes (§3 `Upstream`): exchange a
/// message, report the network actually used, close, and describe itself.
/// Implementations must never block indefinitely — every exchange is
/// bounded by `deadline`.
#[async_trait]
pub trait Upstream: fmt::Display + Send + Sync {
    /// Exchange `req` with the remote resolver, honoring `deadline`.
    async fn exchange(&self, req: &Message<Bytes>, deadline: Instant) -> Result<(Message<Bytes>, Network)>;

    /// Exchange `req`, forcing `network` for this call only if given,
    /// overriding the upstream's own configured preference (§4.1
    /// "NetworkOverride", used by healthchecking). Defaults to the ordinary
    /// exchange for upstreams that don't support forcing.
    async fn exchange_forced(
        &self,
        req: &Message<Bytes>,
        deadline: Instant,
        _network: Option<NetworkPref>,
    ) -> Result<(Message<Bytes>, Network)> {
        self.exchange(req, deadline).await
    }

    /// Release any held resources (connection pools, sockets).
    async fn close(&self);
}

struct UdpFactory {
    addr: SocketAddr,
}

#[async_trait]
impl ConnFactory for UdpFactory {
    type Conn = UdpSocket;

    async fn dial(&self, _deadline: Option<Instant>) -> Result<UdpSocket> {
        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.addr).await?;
        Ok(socket)
    }
}

struct TcpFactory {
    addr: SocketAddr,
}

#[async_trait]
impl ConnFactory for TcpFactory {
    type Conn = TcpStream;

    async fn dial(&self, _deadline: Option<Instant>) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }
}

/// A plain (non-encrypted) UDP/TCP upstream (§3, §4.1 `UpstreamPlain`).
pub struct UpstreamPlain {
    addr: SocketAddr,
    network: NetworkPref,
    timeout: Duration,
    udp_pool: UpstreamPool<UdpFactory>,
    tcp_pool: UpstreamPool<TcpFactory>,
}

impl fmt::Display for UpstreamPlain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl UpstreamPlain {
    /// Build a new plain upstream for `addr`, preferring `network` and
    /// bounding every exchange to `timeout`.
    pub fn new(addr: SocketAddr, network: NetworkPref, timeout: Duration) -> Self {
        Self {
            addr,
            network,
            timeout,
            udp_pool: UpstreamPool::new(UdpFactory { addr }),
            tcp_pool: UpstreamPool::new(TcpFactory { addr }),
        }
    }

    async fn udp_exchange(&self, req: &Message<Bytes>, deadline: Instant) -> Result<Message<Bytes>> {
        let mut conn = self.udp_pool.get(Some(deadline)).await?;
        match Self::udp_roundtrip(conn.get(), req).await {
            Ok(resp) => {
                self.udp_pool.put(conn).await;
                Ok(resp)
            }
            Err(e) if e.is_network_error() => {
                // The borrowed connection may have silently idled out;
                // dial fresh and retry once (§4.1 step 3).
                drop(conn);
                let fresh = self.udp_pool.get(Some(deadline)).await?;
                let mut fresh = fresh;
                let resp = Self::udp_roundtrip(fresh.get(), req).await?;
                self.udp_pool.put(fresh).await;
                Ok(resp)
            }
            Err(e) => Err(e),
        }
    }

    async fn udp_roundtrip(socket: &mut UdpSocket, req: &Message<Bytes>) -> Result<Message<Bytes>> {
        socket.send(req.as_slice()).await?;
        let mut buf = BytesMut::with_capacity(MAX_LEN);
        buf.resize(MAX_LEN, 0);
        let len = socket.recv(&mut buf).await?;
        buf.resize(len, 0);
        Message::from_octets(buf.freeze()).map_err(|e| ForwardError::Parse(format!("{e:?}")))
    }

    async fn tcp_exchange(&self, req: &Message<Bytes>, deadline: Instant) -> Result<Message<Bytes>> {
        let mut conn = self.tcp_pool.get(Some(deadline)).await?;
        match Self::tcp_roundtrip(conn.get(), req).await {
            Ok(resp) => {
                self.tcp_pool.put(conn).await;
                Ok(resp)
            }
            Err(e) if e.is_network_error() => {
                drop(conn);
                let mut fresh = self.tcp_pool.get(Some(deadline)).await?;
                let resp = Self::tcp_roundtrip(fresh.get(), req).await?;
                self.tcp_pool.put(fresh).await;
                Ok(resp)
            }
            Err(e) => Err(e),
        }
    }

    async fn tcp_roundtrip(stream: &mut TcpStream, req: &Message<Bytes>) -> Result<Message<Bytes>> {
        let body = req.as_slice();
        let len = u16::try_from(body.len()).map_err(|_| {
            ForwardError::Parse("request too large for 2-byte length prefix".into())
        })?;
        let mut framed = Vec::with_capacity(2 + body.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(body);
        stream.write_all(&framed).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = BytesMut::with_capacity(resp_len.min(MAX_MSG_SIZE));
        buf.resize(resp_len, 0);
        stream.read_exact(&mut buf).await?;
        Message::from_octets(buf.freeze()).map_err(|e| ForwardError::Parse(format!("{e:?}")))
    }
}

/// Validate a response against its originating request (§4.1 "Response
/// validation", §8 "Request/response identity"). Violations are distinct
/// errors that are *not* classified as network errors (§7).
pub fn validate_response(req: &Message<Bytes>, resp: &Message<Bytes>) -> Result<()> {
    if resp.header().id() != req.header().id() {
        return Err(ForwardError::Id {
            got: resp.header().id(),
            want: req.header().id(),
        });
    }
    let req_q = req
        .first_question()
        .ok_or(ForwardError::QuestionCount(0))?;
    let resp_questions: Vec<_> = resp
        .question()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ForwardError::Parse("bad question section".into()))?;
    if resp_questions.len() != 1 {
        return Err(ForwardError::QuestionCount(resp_questions.len()));
    }
    let resp_q = &resp_questions[0];
    // `domain`'s `Dname` equality is already case-insensitive per RFC 1035
    // §3.1, so a plain comparison of the owned names gives us the
    // case-insensitive match §4.1/§8 require.
    let req_name = req_q
        .qname()
        .to_dname()
        .map_err(|_| ForwardError::Parse("bad request qname".into()))?;
    let resp_name = resp_q
        .qname()
        .to_dname()
        .map_err(|_| ForwardError::Parse("bad response qname".into()))?;
    if resp_q.qtype() != req_q.qtype() || resp_name != req_name {
        return Err(ForwardError::QuestionMismatch);
    }
    Ok(())
}

impl UpstreamPlain {
    async fn exchange_with(
        &self,
        req: &Message<Bytes>,
        deadline: Instant,
        network: NetworkPref,
    ) -> Result<(Message<Bytes>, Network)> {
        // Step 1: the earlier of the caller's deadline and our own timeout
        // wins (§4.1 step 1).
        let own_deadline = Instant::now() + self.timeout;
        let deadline = deadline.min(own_deadline);
        let remaining = deadline.saturating_duration_since(Instant::now());

        if network == NetworkPref::Tcp {
            let resp = timeout(remaining, self.tcp_exchange(req, deadline)).await??;
            validate_response(req, &resp)?;
            return Ok((resp, Network::Tcp));
        }

        let resp = timeout(remaining, self.udp_exchange(req, deadline)).await??;
        validate_response(req, &resp)?;

        if resp.header().tc() && network != NetworkPref::Udp {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let resp = timeout(remaining, self.tcp_exchange(req, deadline)).await??;
            validate_response(req, &resp)?;
            return Ok((resp, Network::Tcp));
        }

        Ok((resp, Network::Udp))
    }
}

#[async_trait]
impl Upstream for UpstreamPlain {
    async fn exchange(&self, req: &Message<Bytes>, deadline: Instant) -> Result<(Message<Bytes>, Network)> {
        self.exchange_with(req, deadline, self.network).await
    }

    async fn exchange_forced(
        &self,
        req: &Message<Bytes>,
        deadline: Instant,
        network: Option<NetworkPref>,
    ) -> Result<(Message<Bytes>, Network)> {
        self.exchange_with(req, deadline, network.unwrap_or(self.network)).await
    }

    async fn close(&self) {
        self.udp_pool.close().await;
        self.tcp_pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_label_strings() {
        assert_eq!(Network::Udp.as_str(), "udp");
        assert_eq!(Network::Tcp.as_str(), "tcp");
    }
}
