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

//! Fallback handler for `resolver.arpa.` subdomains that are not the DDR
//! discovery name (§4.4 "Any subdomain of `resolver.arpa` that is not the
//! above → NODATA").

use super::empty_response;
use bytes::Bytes;
use domain::base::{iana::Rcode, Message, ShortBuf};

/// NODATA is a `NOERROR` response with an empty answer section.
pub fn build_response(req: &Message<Bytes>) -> Result<Message<Bytes>, ShortBuf> {
    empty_response(req, Rcode::NoError)
}
