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

//! Hot-path label canonicalization (§4.5): `qtype` is one of a fixed
//! whitelist or `"OTHER"`; `family` is `"0"`/`"1"`/`"2"` for
//! unknown/IPv4/IPv6; `rcode` is a fixed string or its decimal form.

use domain::base::iana::{Rcode, Rtype};
use std::net::IpAddr;

/// IP family, canonicalized per §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// No address associated with this observation.
    Unknown,
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl Family {
    /// The canonical label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Unknown => "0",
            Family::V4 => "1",
            Family::V6 => "2",
        }
    }
}

/// Canonicalize an address into its `Family` label.
pub fn canon_family(addr: Option<IpAddr>) -> Family {
    match addr {
        None => Family::Unknown,
        Some(IpAddr::V4(_)) => Family::V4,
        Some(IpAddr::V6(_)) => Family::V6,
    }
}

const QTYPE_WHITELIST: &[(Rtype, &str)] = &[
    (Rtype::A, "A"),
    (Rtype::Aaaa, "AAAA"),
    (Rtype::Cname, "CNAME"),
    (Rtype::Mx, "MX"),
    (Rtype::Ns, "NS"),
    (Rtype::Ptr, "PTR"),
    (Rtype::Soa, "SOA"),
    (Rtype::Srv, "SRV"),
    (Rtype::Svcb, "SVCB"),
    (Rtype::Https, "HTTPS"),
    (Rtype::Txt, "TXT"),
    (Rtype::Any, "ANY"),
];

/// Canonicalize a query type to a fixed whitelist label or `"OTHER"`.
pub fn canon_qtype(qtype: Rtype) -> &'static str {
    QTYPE_WHITELIST
        .iter()
        .find(|(t, _)| *t == qtype)
        .map(|(_, s)| *s)
        .unwrap_or("OTHER")
}

/// Canonicalize an rcode to its fixed string, falling back to its decimal
/// form for rcodes outside the well-known set.
pub fn canon_rcode(rcode: Rcode) -> String {
    match rcode {
        Rcode::NoError => "NOERROR".to_string(),
        Rcode::FormErr => "FORMERR".to_string(),
        Rcode::ServFail => "SERVFAIL".to_string(),
        Rcode::NXDomain => "NXDOMAIN".to_string(),
        Rcode::NotImp => "NOTIMP".to_string(),
        Rcode::Refused => "REFUSED".to_string(),
        other => other.to_int().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qtype_whitelist_falls_back_to_other() {
        assert_eq!(canon_qtype(Rtype::A), "A");
        assert_eq!(canon_qtype(Rtype::Caa), "OTHER");
    }

    #[test]
    fn family_canonicalizes_none_as_unknown() {
        assert_eq!(canon_family(None).as_str(), "0");
        assert_eq!(canon_family(Some("1.2.3.4".parse().unwrap())).as_str(), "1");
        assert_eq!(canon_family(Some("::1".parse().unwrap())).as_str(), "2");
    }

    #[test]
    fn rcode_canonicalizes_known_and_falls_back_to_decimal() {
        assert_eq!(canon_rcode(Rcode::NoError), "NOERROR");
        assert_eq!(canon_rcode(Rcode::Int(20)), "20");
    }
}
