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

//! Persistent and dynamic IP-prefix allowlists (§4.2 "Allowlist").

use ipnet::IpNet;
use std::{net::IpAddr, sync::RwLock};

/// Two prefix lists: an immutable `persistent` set fixed at construction,
/// and a `dynamic` set that a refresher can atomically replace (§4.2
/// "Dynamic list is replaced atomically under an exclusive lock").
pub struct Allowlist {
    persistent: Vec<IpNet>,
    dynamic: RwLock<Vec<IpNet>>,
}

impl Allowlist {
    /// Build an allowlist with a fixed persistent prefix set and an
    /// initially-empty dynamic set.
    pub fn new(persistent: Vec<IpNet>) -> Self {
        Self {
            persistent,
            dynamic: RwLock::new(Vec::new()),
        }
    }

    /// Membership test: "any prefix contains ip" (§4.2 "Allowlist"), checking
    /// the persistent set first, then the dynamic set under a read lock.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.persistent.iter().any(|net| net.contains(&ip)) {
            return true;
        }
        self.dynamic
            .read()
            .unwrap()
            .iter()
            .any(|net| net.contains(&ip))
    }

    /// Atomically replace the dynamic prefix set (§4.2).
    pub fn replace_dynamic(&self, prefixes: Vec<IpNet>) {
        *self.dynamic.write().unwrap() = prefixes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_prefix_matches() {
        let list = Allowlist::new(vec!["10.0.0.0/8".parse().unwrap()]);
        assert!(list.contains("10.1.2.3".parse().unwrap()));
        assert!(!list.contains("11.1.2.3".parse().unwrap()));
    }

    #[test]
    fn dynamic_replace_is_atomic_and_visible() {
        let list = Allowlist::new(vec![]);
        assert!(!list.contains("192.168.1.1".parse().unwrap()));
        list.replace_dynamic(vec!["192.168.0.0/16".parse().unwrap()]);
        assert!(list.contains("192.168.1.1".parse().unwrap()));
    }
}
