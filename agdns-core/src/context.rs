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

//! Request-scoped values (§3, §9 "Request-scoped values"). These are passed
//! exclusively through a typed context, never through task-local storage.

use crate::Label;
use domain::base::iana::Rtype;
use std::{
    net::{IpAddr, SocketAddr},
    time::Instant,
};

/// Wire protocol a query arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain UDP.
    Udp,
    /// Plain TCP.
    Tcp,
    /// DNS-over-TLS.
    Dot,
    /// DNS-over-HTTPS.
    Doh,
    /// DNS-over-QUIC.
    Doq,
    /// DNSCrypt v2.
    DnsCrypt,
}

impl Protocol {
    /// Canonical lower-case label used in metrics (§4.5).
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Dot => "dot",
            Protocol::Doh => "doh",
            Protocol::Doq => "doq",
            Protocol::DnsCrypt => "dnscrypt",
        }
    }
}

/// Static per-listener descriptor (§3). Immutable for the life of a
/// listener; cheap to clone (all fields are `Arc`/`Copy`).
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Name of the server group this listener belongs to.
    pub name: Label,
    /// Address the listener is bound to.
    pub bind_addr: SocketAddr,
    /// Protocol served by this listener.
    pub protocol: Protocol,
    /// Whether linked-IP (device-by-client-IP) lookups are enabled for
    /// this listener. Some protocols (DoH/DoT with per-device subdomains)
    /// identify the device out of band and disable this.
    pub linked_ip_enabled: bool,
}

/// Derived per-query context (§3). Immutable once attached to the request;
/// owned by the request task and dropped when the handler returns.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Client's observed network address.
    pub client_addr: SocketAddr,
    /// Lower-cased question host, without a trailing dot stripped (FQDN).
    pub host: compact_str::CompactString,
    /// Question type.
    pub qtype: Rtype,
    /// Question class.
    pub qclass: domain::base::iana::Class,
    /// Device identifier, if resolved via SNI/URL-path or linked-IP lookup.
    pub device_id: Option<Label>,
    /// Profile identifier, if resolved.
    pub profile_id: Option<Label>,
    /// GeoIP location of the client, if resolved.
    pub location: Option<crate::collab::Location>,
    /// EDNS Client Subnet option attached to the query, if any.
    pub ecs: Option<EcsOption>,
    /// Time the request started being processed.
    pub start_time: Instant,
    /// Per-request identifier, generated fresh for every accepted query.
    pub request_id: u64,
}

/// A parsed EDNS Client Subnet option (RFC 7871).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcsOption {
    /// The client (or client-aggregated) subnet address.
    pub addr: IpAddr,
    /// Source prefix length, as sent by the client/resolver.
    pub source_prefix: u8,
    /// Scope prefix length, as certified by the authoritative reply. Zero
    /// until a response has filled it in.
    pub scope_prefix: u8,
}

impl EcsOption {
    /// The subnet this option designates, masked to `source_prefix` bits.
    pub fn network(&self) -> ipnet::IpNet {
        ipnet::IpNet::new(self.addr, self.source_prefix)
            .map(|n| n.trunc())
            .unwrap_or_else(|_| ipnet::IpNet::new(self.addr, 0).unwrap())
    }

    /// Extract the first `ClientSubnet` EDNS option from `msg`'s OPT
    /// record, if any (§3, used both to read a request's ECS option and,
    /// by `middleware::cache_mw`, to read the scope an upstream certified
    /// in its response).
    pub fn from_message(msg: &domain::base::Message<bytes::Bytes>) -> Option<Self> {
        let opt = msg.opt()?;
        opt.iter::<domain::base::opt::AllOptData<bytes::Bytes>>()
            .flatten()
            .find_map(|data| match data {
                domain::base::opt::AllOptData::ClientSubnet(cs) => Some(EcsOption {
                    addr: cs.addr(),
                    source_prefix: cs.source_prefix_len(),
                    scope_prefix: cs.scope_prefix_len(),
                }),
                _ => None,
            })
    }
}

/// Full per-request context threaded through the middleware pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Static listener info.
    pub server: ServerInfo,
    /// Derived per-query info. `None` until `InitialMW` has populated it
    /// from the raw message (host/qtype/qclass are always present from the
    /// moment the message passes validation).
    pub info: RequestInfo,
}
