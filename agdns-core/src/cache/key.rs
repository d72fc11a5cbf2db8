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

//! Cache key derivation (§3 `CacheKey`): `(qname lowered, qtype, qclass,
//! DO-bit, ECS-network-or-empty)`.

use super::error::{CacheError, Result};
use bytes::Bytes;
use compact_str::CompactString;
use domain::base::{
    iana::{Class, Rtype},
    Message, ToDname,
};

/// `(qname lowered, qtype, qclass, DO-bit, ECS-network-or-empty)` (§3).
/// For the plain cache `ecs_network` is always `None`; the ECS cache fills
/// it in with the subnet the stored response's scope certifies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    qname: CompactString,
    qtype: Rtype,
    qclass: Class,
    do_bit: bool,
    ecs_network: Option<ipnet::IpNet>,
}

impl CacheKey {
    /// Derive the plain (non-ECS) key from a request message.
    pub fn from_request(req: &Message<Bytes>) -> Result<Self> {
        Self::from_request_canonical(req, None)
    }

    /// Derive the plain (non-ECS) key from a request message, substituting
    /// `name_override` for the question's own qname if given. Used by
    /// `CacheMW` so Android metric-collection hostname variants (§4.4
    /// "PreUpstreamMW") share one cache slot: the cache key is computed
    /// against the canonical name even though the request on the wire
    /// still carries the client's original name.
    pub fn from_request_canonical(req: &Message<Bytes>, name_override: Option<&str>) -> Result<Self> {
        let question = req.first_question().ok_or(CacheError::NoQuestion)?;
        let qname = match name_override {
            Some(name) => name.to_ascii_lowercase(),
            None => {
                let qname: domain::base::Dname<Bytes> = question
                    .qname()
                    .to_dname()
                    .map_err(|_| CacheError::NoQuestion)?;
                qname.to_string().to_ascii_lowercase()
            }
        };
        let do_bit = req
            .opt()
            .map(|opt| opt.dnssec_ok())
            .unwrap_or(false);
        Ok(Self {
            qname: CompactString::from(qname),
            qtype: question.qtype(),
            qclass: question.qclass(),
            do_bit,
            ecs_network: None,
        })
    }

    /// Attach (or replace) the ECS network component for the ECS-aware
    /// cache variant.
    pub fn with_ecs_network(mut self, network: Option<ipnet::IpNet>) -> Self {
        self.ecs_network = network;
        self
    }

    /// The ECS network component, if any.
    pub fn ecs_network(&self) -> Option<ipnet::IpNet> {
        self.ecs_network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::{Dname, MessageBuilder};
    use std::str::FromStr;

    fn build_request(name: &str, qtype: Rtype) -> Message<Bytes> {
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
            .unwrap()
            .question();
        let dname = Dname::<Bytes>::from_str(name).unwrap();
        let _ = builder.push((&dname, qtype, Class::In));
        builder.into_message()
    }

    #[test]
    fn qname_is_lowercased() {
        let req = build_request("Example.COM.", Rtype::A);
        let key = CacheKey::from_request(&req).unwrap();
        assert_eq!(key.qname, "example.com.");
    }
}
