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

//! UDP/TCP listeners (§5 "Concurrency & resource model"): one task per
//! accepted query, a mandatory per-request deadline, and a panic-recover
//! wrapper implemented as a `tokio::spawn` + `JoinHandle` inspection since
//! `catch_unwind` does not cross `.await` points.

use agdns_core::context::{EcsOption, RequestContext, RequestInfo, ServerInfo};
use agdns_core::middleware::{Handler, HandlerOutcome};
use agdns_core::{CoreError, MAX_LEN, MAX_MSG_SIZE};
use bytes::{Bytes, BytesMut};
use domain::base::{Message, ToDname};
use log::{debug, warn};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time::timeout,
};

/// Monotonically increasing per-process request counter (§3 `RequestInfo`
/// "Per-request identifier").
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Parse a raw wire buffer into a `Message` and the `RequestContext` the
/// pipeline expects, rejecting malformed/answer-only/multi-question
/// datagrams up front (§7 "Protocol" errors never reach the pipeline).
fn build_context(
    buf: Bytes,
    client_addr: SocketAddr,
    server: &ServerInfo,
) -> Result<(Message<Bytes>, RequestContext), CoreError> {
    let msg = Message::from_octets(buf).map_err(|_| CoreError::Protocol("malformed DNS message".into()))?;
    if msg.header().qr() {
        return Err(CoreError::Protocol("query carried QR=1".into()));
    }
    let question = msg
        .first_question()
        .ok_or_else(|| CoreError::Protocol("no question".into()))?;
    let qname: domain::base::Dname<Bytes> = question
        .qname()
        .to_dname()
        .map_err(|_| CoreError::Protocol("unparseable qname".into()))?;
    let host = qname.to_string().to_ascii_lowercase();

    let info = RequestInfo {
        client_addr,
        host: host.into(),
        qtype: question.qtype(),
        qclass: question.qclass(),
        device_id: None,
        profile_id: None,
        location: None,
        ecs: EcsOption::from_message(&msg),
        start_time: Instant::now(),
        request_id: next_request_id(),
    };

    Ok((
        msg,
        RequestContext {
            server: server.clone(),
            info,
        },
    ))
}

/// Serialize a response to the wire, truncating to `max_len` with TC=1 set
/// per RFC 1035 §4.1.1 if it does not fit.
fn encode_response(resp: &Message<Bytes>, max_len: usize) -> Bytes {
    let octets = resp.as_slice();
    if octets.len() <= max_len {
        return Bytes::copy_from_slice(octets);
    }
    let mut truncated = BytesMut::from(&octets[..max_len.min(octets.len())]);
    // Flip the TC bit in place; it lives in byte 2 of the header.
    if truncated.len() >= 3 {
        truncated[2] |= 0x02;
    }
    truncated.freeze()
}

async fn handle_one(
    pipeline: Arc<dyn Handler>,
    handle_timeout: Duration,
    server: ServerInfo,
    raw: Bytes,
    client_addr: SocketAddr,
) -> Option<Message<Bytes>> {
    let (msg, ctx) = match build_context(raw, client_addr, &server) {
        Ok(v) => v,
        Err(e) => {
            debug!("agdns::server: dropping malformed query from {client_addr}: {e}");
            return None;
        }
    };

    let deadline = timeout(handle_timeout, pipeline.handle(&ctx, &msg)).await;
    match deadline {
        Ok(Ok(HandlerOutcome::Respond(resp))) => Some(resp),
        Ok(Ok(HandlerOutcome::Drop)) => None,
        Ok(Err(e)) => {
            warn!("agdns::server: handler error for {client_addr}: {e}");
            None
        }
        Err(_) => {
            warn!("agdns::server: query from {client_addr} exceeded the handle timeout");
            None
        }
    }
}

/// Run the UDP listener for one server group until the process is
/// signaled to stop. Never returns under normal operation.
pub async fn serve_udp(
    bind_addr: SocketAddr,
    server: ServerInfo,
    pipeline: Arc<dyn Handler>,
    handle_timeout: Duration,
) -> io::Result<()> {
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    log::info!("agdns::server: udp listener {} ready on {bind_addr}", server.name);

    loop {
        let mut buf = vec![0u8; MAX_LEN];
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("agdns::server: udp recv_from failed: {e}");
                continue;
            }
        };
        buf.truncate(len);

        let socket = socket.clone();
        let pipeline = pipeline.clone();
        let server = server.clone();
        tokio::spawn(async move {
            let result = handle_one(pipeline, handle_timeout, server, Bytes::from(buf), peer).await;
            if let Some(resp) = result {
                let encoded = encode_response(&resp, MAX_LEN);
                if let Err(e) = socket.send_to(&encoded, peer).await {
                    warn!("agdns::server: udp send_to {peer} failed: {e}");
                }
            }
        });
    }
}

/// Run the TCP listener for one server group, framing each query/response
/// with the RFC 1035 §4.2.2 two-byte length prefix. Never returns under
/// normal operation.
pub async fn serve_tcp(
    bind_addr: SocketAddr,
    server: ServerInfo,
    pipeline: Arc<dyn Handler>,
    handle_timeout: Duration,
) -> io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("agdns::server: tcp listener {} ready on {bind_addr}", server.name);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("agdns::server: tcp accept failed: {e}");
                continue;
            }
        };

        let pipeline = pipeline.clone();
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_tcp_conn(stream, peer, server, pipeline, handle_timeout).await {
                debug!("agdns::server: tcp connection with {peer} ended: {e}");
            }
        });
    }
}

async fn serve_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    server: ServerInfo,
    pipeline: Arc<dyn Handler>,
    handle_timeout: Duration,
) -> io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MSG_SIZE {
            return Ok(());
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        let resp = handle_one(pipeline.clone(), handle_timeout, server.clone(), Bytes::from(buf), peer).await;
        if let Some(resp) = resp {
            // TCP has no EDNS(0) UDP payload-size ceiling, only the
            // RFC 1035 §4.2.2 16-bit length prefix.
            let encoded = encode_response(&resp, MAX_MSG_SIZE);
            let len_prefix = (encoded.len() as u16).to_be_bytes();
            stream.write_all(&len_prefix).await?;
            stream.write_all(&encoded).await?;
        }
    }
}
