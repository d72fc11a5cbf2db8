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

//! Special-domain short-circuit handlers (§4.4 "InitialMW"): DDR,
//! `resolver.arpa`, Firefox canary and Apple Private Relay. These never
//! reach the profile/filtering pipeline; `InitialMW` dispatches to them
//! purely from the lowercased question host/type/class.

pub mod ddr;
pub mod firefox;
pub mod private_relay;
pub mod resolver_arpa;

use bytes::{Bytes, BytesMut};
use domain::base::{iana::Rcode, Message, MessageBuilder, ShortBuf};

/// Which special-domain handler a request matches, if any (§4.4
/// "InitialMW"). Checked in the order listed, since `_dns.resolver.arpa`
/// is itself a subdomain of `resolver.arpa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCase {
    /// `_dns.resolver.arpa.` SVCB query: answer with DDR targets.
    Ddr,
    /// Any other `resolver.arpa.` subdomain: answer NODATA.
    ResolverArpaOther,
    /// `use-application-dns.net.` A/AAAA query: Firefox canary detection.
    FirefoxCanary,
    /// An Apple Private Relay mask-hostname A/AAAA query.
    PrivateRelay,
}

const DDR_DISCOVERY_HOST: &str = "_dns.resolver.arpa.";
const RESOLVER_ARPA_SUFFIX: &str = "resolver.arpa.";
const FIREFOX_CANARY_HOST: &str = "use-application-dns.net.";
const PRIVATE_RELAY_HOSTS: &[&str] = &[
    "mask.icloud.com.",
    "mask-h2.icloud.com.",
    "mask-canary.icloud.com.",
];

/// Classify a lowercased, FQDN-form question host/type (§4.4). `host` must
/// already be lowercased by the caller (`InitialMW` does this once for
/// every question, per spec.md §4.4).
pub fn classify(host: &str, qtype: domain::base::iana::Rtype) -> Option<SpecialCase> {
    use domain::base::iana::Rtype;

    if host == DDR_DISCOVERY_HOST && qtype == Rtype::Svcb {
        return Some(SpecialCase::Ddr);
    }
    if host.ends_with(RESOLVER_ARPA_SUFFIX) || host == RESOLVER_ARPA_SUFFIX {
        return Some(SpecialCase::ResolverArpaOther);
    }
    if host == FIREFOX_CANARY_HOST && matches!(qtype, Rtype::A | Rtype::Aaaa) {
        return Some(SpecialCase::FirefoxCanary);
    }
    if PRIVATE_RELAY_HOSTS.contains(&host) && matches!(qtype, Rtype::A | Rtype::Aaaa) {
        return Some(SpecialCase::PrivateRelay);
    }
    None
}

/// Build an empty-section response to `req` carrying `rcode`, echoing the
/// request's ID and question unchanged. Uses the same header-copy /
/// question-copy approach as `cache::entry::rewrite_ttls`, minus the
/// per-RR rewriting since these responses never carry answer records of
/// their own.
pub(crate) fn empty_response(req: &Message<Bytes>, rcode: Rcode) -> Result<Message<Bytes>, ShortBuf> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(crate::MAX_LEN))?;
    *builder.header_mut() = req.header();
    builder.header_mut().set_qr(true);
    builder.header_mut().set_aa(true);
    builder.header_mut().set_rcode(rcode);

    let mut builder = builder.question();
    for item in req.question().flatten() {
        builder.push(item)?;
    }
    Ok(builder.answer().into_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::iana::Rtype;

    #[test]
    fn ddr_discovery_name_matches_only_with_svcb() {
        assert_eq!(classify(DDR_DISCOVERY_HOST, Rtype::Svcb), Some(SpecialCase::Ddr));
        assert_eq!(
            classify(DDR_DISCOVERY_HOST, Rtype::A),
            Some(SpecialCase::ResolverArpaOther)
        );
    }

    #[test]
    fn other_resolver_arpa_subdomain_is_nodata() {
        assert_eq!(
            classify("foo.resolver.arpa.", Rtype::A),
            Some(SpecialCase::ResolverArpaOther)
        );
    }

    #[test]
    fn firefox_canary_requires_matching_qtype() {
        assert_eq!(
            classify(FIREFOX_CANARY_HOST, Rtype::A),
            Some(SpecialCase::FirefoxCanary)
        );
        assert_eq!(classify(FIREFOX_CANARY_HOST, Rtype::Txt), None);
    }

    #[test]
    fn private_relay_hosts_match() {
        for host in PRIVATE_RELAY_HOSTS {
            assert_eq!(classify(host, Rtype::Aaaa), Some(SpecialCase::PrivateRelay));
        }
    }

    #[test]
    fn unrelated_host_does_not_match() {
        assert_eq!(classify("example.com.", Rtype::A), None);
    }
}
