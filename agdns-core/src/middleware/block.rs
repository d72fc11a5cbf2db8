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

//! Synthesized blocked-response construction. NXDOMAIN with a synthetic
//! SOA in the authority section carrying the profile's configured TTL,
//! following RFC 2308's negative-caching convention so the sender's
//! resolver stops retrying promptly.

use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, Dname, Message, MessageBuilder, ShortBuf};
use domain::rdata::Soa;
use std::str::FromStr;

/// Build an NXDOMAIN response to `req` carrying a synthesized SOA in the
/// authority section, TTL'd at `ttl` (§4.4 "blocked response with profile
/// TTL").
pub fn build_blocked_response(req: &Message<Bytes>, ttl: u32) -> Result<Message<Bytes>, ShortBuf> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(128))?;
    *builder.header_mut() = req.header();
    builder.header_mut().set_qr(true);
    builder.header_mut().set_aa(true);
    builder.header_mut().set_rcode(Rcode::NXDomain);

    let mut builder = builder.question();
    for item in req.question().flatten() {
        builder.push(item)?;
    }

    let mut builder = builder.answer().authority();
    let soa = Soa::new(
        Dname::<Bytes>::from_str("a.gtld-servers.net.").unwrap(),
        Dname::<Bytes>::from_str("nstld.verisign-grs.com.").unwrap(),
        1.into(),
        1800,
        900,
        604800,
        ttl,
    );
    builder.push((Dname::<Bytes>::root_bytes(), ttl, soa))?;
    Ok(builder.into_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::{iana::Class, iana::Rtype, MessageBuilder as MB};

    #[test]
    fn blocked_response_is_nxdomain_with_soa_authority() {
        let dname = Dname::<Bytes>::from_str("blocked.example.").unwrap();
        let mut builder = MB::from_target(BytesMut::new()).unwrap().question();
        let _ = builder.push((&dname, Rtype::A, Class::In));
        let req = builder.into_message();

        let resp = build_blocked_response(&req, 120).unwrap();
        assert_eq!(resp.header().rcode(), Rcode::NXDomain);
        let authority: Vec<_> = resp.authority().unwrap().flatten().collect();
        assert_eq!(authority.len(), 1);
        assert_eq!(authority[0].ttl(), 120);
    }
}
