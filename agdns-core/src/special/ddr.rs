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

//! DDR (Discovery of Designated Resolvers, draft-ietf-add-ddr) response
//! construction. One SVCB RR per enabled protocol (DoH, DoT, DoQ), cloned
//! from a pre-built template and rewritten with the query name and (for
//! device-scoped forms) the device ID prepended to the target. `domain`
//! has no typed SVCB rdata, so the rdata octets are assembled by hand per
//! RFC 9460 and carried as `domain::rdata::UnknownRecordData`.

use super::empty_response;
use bytes::{BufMut, Bytes, BytesMut};
use domain::base::{
    iana::{Class, Rcode, Rtype},
    Dname, Message, MessageBuilder, ShortBuf, ToDname,
};
use domain::rdata::UnknownRecordData;
use std::{
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// SvcParamKey values used by the DDR response (RFC 9460 §14.3.2),
/// assembled in ascending order as the wire format requires.
const SVCPARAM_ALPN: u16 = 1;
const SVCPARAM_PORT: u16 = 3;
const SVCPARAM_IPV4HINT: u16 = 4;
const SVCPARAM_IPV6HINT: u16 = 6;

/// One configured designated-resolver target (§6 "DDR"). `target_host`
/// excludes any device-ID prefix; that is added per-request when the
/// query arrived on a device-scoped listener.
#[derive(Debug, Clone)]
pub struct DdrTarget {
    /// `SvcPriority` for this target.
    pub priority: u16,
    /// Base target hostname (FQDN, trailing dot), before any device
    /// prefix.
    pub target_host: String,
    /// Port the protocol listens on.
    pub port: u16,
    /// ALPN identifiers advertised for this protocol (e.g. `"h2"`, `"dot"`,
    /// `"doq"`).
    pub alpn: Vec<&'static str>,
    /// Optional `ipv4hint` addresses.
    pub ipv4_hints: Vec<Ipv4Addr>,
    /// Optional `ipv6hint` addresses.
    pub ipv6_hints: Vec<Ipv6Addr>,
    /// TTL to serve this SVCB record with.
    pub ttl: u32,
}

/// Build SVCB rdata octets per RFC 9460 §2.2: `SvcPriority`, `TargetName`
/// (uncompressed wire form), then `SvcParams` sorted ascending by key.
fn build_svcb_rdata(t: &DdrTarget, target: &Dname<Bytes>) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(t.priority);
    buf.put_slice(target.as_slice());

    if !t.alpn.is_empty() {
        let mut val = BytesMut::new();
        for proto in &t.alpn {
            val.put_u8(proto.len() as u8);
            val.put_slice(proto.as_bytes());
        }
        buf.put_u16(SVCPARAM_ALPN);
        buf.put_u16(val.len() as u16);
        buf.put_slice(&val);
    }

    buf.put_u16(SVCPARAM_PORT);
    buf.put_u16(2);
    buf.put_u16(t.port);

    if !t.ipv4_hints.is_empty() {
        buf.put_u16(SVCPARAM_IPV4HINT);
        buf.put_u16((t.ipv4_hints.len() * 4) as u16);
        for addr in &t.ipv4_hints {
            buf.put_slice(&addr.octets());
        }
    }

    if !t.ipv6_hints.is_empty() {
        buf.put_u16(SVCPARAM_IPV6HINT);
        buf.put_u16((t.ipv6_hints.len() * 16) as u16);
        for addr in &t.ipv6_hints {
            buf.put_slice(&addr.octets());
        }
    }

    buf.freeze()
}

/// Prefix `device_id` onto `base` (§6 "Device-scoped forms prepend the
/// device ID to the target"). Falls back to the un-prefixed name if the
/// combined string somehow fails to parse as a `Dname`.
fn target_name(base: &str, device_id: Option<&str>) -> Dname<Bytes> {
    let combined = match device_id {
        Some(id) => format!("{id}.{base}"),
        None => base.to_string(),
    };
    Dname::<Bytes>::from_str(&combined)
        .or_else(|_| Dname::<Bytes>::from_str(base))
        .unwrap_or_else(|_| Dname::root_bytes())
}

/// Build the DDR SVCB response for `req` (§6 "DDR", §8 scenario 1). Every
/// configured target becomes one SVCB answer RR named after the query
/// (`_dns.resolver.arpa.`), with its target rewritten to carry the device
/// prefix when `device_id` is present.
pub fn build_response(
    req: &Message<Bytes>,
    targets: &[DdrTarget],
    device_id: Option<&str>,
) -> Result<Message<Bytes>, ShortBuf> {
    let Some(question) = req.first_question() else {
        return empty_response(req, Rcode::FormErr);
    };
    let Ok(qname) = question.qname().to_dname::<Bytes>() else {
        return empty_response(req, Rcode::FormErr);
    };

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
    for t in targets {
        let target = target_name(&t.target_host, device_id);
        let rdata = build_svcb_rdata(t, &target);
        builder.push((
            &qname,
            t.ttl,
            Class::In,
            UnknownRecordData::from_octets(Rtype::Svcb, rdata),
        ))?;
    }
    Ok(builder.into_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::{iana::Class as QClass, MessageBuilder as MB};

    fn sample_targets() -> Vec<DdrTarget> {
        vec![
            DdrTarget {
                priority: 1,
                target_host: "dns.example.com.".to_string(),
                port: 443,
                alpn: vec!["h2"],
                ipv4_hints: vec!["1.2.3.4".parse().unwrap()],
                ipv6_hints: vec![],
                ttl: 300,
            },
            DdrTarget {
                priority: 2,
                target_host: "dns.example.com.".to_string(),
                port: 853,
                alpn: vec!["dot"],
                ipv4_hints: vec![],
                ipv6_hints: vec![],
                ttl: 300,
            },
            DdrTarget {
                priority: 3,
                target_host: "dns.example.com.".to_string(),
                port: 853,
                alpn: vec!["doq"],
                ipv4_hints: vec![],
                ipv6_hints: vec![],
                ttl: 300,
            },
        ]
    }

    fn ddr_request() -> Message<Bytes> {
        let dname = Dname::<Bytes>::from_str("_dns.resolver.arpa.").unwrap();
        let mut builder = MB::from_target(BytesMut::new()).unwrap().question();
        let _ = builder.push((&dname, Rtype::Svcb, QClass::In));
        builder.into_message()
    }

    #[test]
    fn three_targets_yield_three_svcb_answers_named_after_query() {
        let req = ddr_request();
        let resp = build_response(&req, &sample_targets(), Some("dev1234")).unwrap();
        let answers: Vec<_> = resp.answer().unwrap().flatten().collect();
        assert_eq!(answers.len(), 3);
        for rr in &answers {
            assert_eq!(rr.rtype(), Rtype::Svcb);
            let name: Dname<Bytes> = rr.owner().to_dname().unwrap();
            assert_eq!(name.to_string(), "_dns.resolver.arpa.");
        }
    }

    #[test]
    fn device_id_is_prepended_to_target() {
        let target = target_name("dns.example.com.", Some("dev1234"));
        assert!(target.to_string().starts_with("dev1234."));
    }

    #[test]
    fn no_device_id_leaves_target_unprefixed() {
        let target = target_name("dns.example.com.", None);
        assert_eq!(target.to_string(), "dns.example.com.");
    }
}
