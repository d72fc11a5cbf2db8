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

//! Firefox canary detection (§4.4, §6, §8 scenario 2): a blocked profile
//! or filtering group answers `use-application-dns.net.` with REFUSED and
//! an empty answer section so Firefox disables its built-in DoH.

use super::empty_response;
use bytes::Bytes;
use domain::base::{iana::Rcode, Message, ShortBuf};

/// REFUSED, empty answer section.
pub fn build_response(req: &Message<Bytes>) -> Result<Message<Bytes>, ShortBuf> {
    empty_response(req, Rcode::Refused)
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
    fn refused_with_empty_answer() {
        let dname = Dname::<Bytes>::from_str("use-application-dns.net.").unwrap();
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::new())
            .unwrap()
            .question();
        let _ = builder.push((&dname, Rtype::A, Class::In));
        let req = builder.into_message();

        let resp = build_response(&req).unwrap();
        assert_eq!(resp.header().rcode(), Rcode::Refused);
        assert_eq!(resp.header_counts().ancount(), 0);
    }
}
