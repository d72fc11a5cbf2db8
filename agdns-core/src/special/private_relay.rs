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

//! Apple Private Relay mask-domain handling (§4.4, §6, §8 scenario 3): a
//! profile with `BlockPrivateRelay` answers `mask(.*).icloud.com.`
//! A/AAAA queries with NXDOMAIN so the device falls back to the regular
//! DNS path instead of relaying through Apple's infrastructure.

use super::empty_response;
use bytes::Bytes;
use domain::base::{iana::Rcode, Message, ShortBuf};

/// NXDOMAIN, empty answer section.
pub fn build_response(req: &Message<Bytes>) -> Result<Message<Bytes>, ShortBuf> {
    empty_response(req, Rcode::NXDomain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::{
        iana::{Class, Rtype},
        Dname, MessageBuilder,
    };
    use std::str::FromStr;

    #[test]
    fn nxdomain_with_empty_answer() {
        let dname = Dname::<Bytes>::from_str("mask.icloud.com.").unwrap();
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
            .unwrap()
            .question();
        let _ = builder.push((&dname, Rtype::Aaaa, Class::In));
        let req = builder.into_message();

        let resp = build_response(&req).unwrap();
        assert_eq!(resp.header().rcode(), Rcode::NXDomain);
        assert_eq!(resp.header_counts().ancount(), 0);
    }
}
