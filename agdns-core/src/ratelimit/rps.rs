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

//! Per-subnet RPS ring buffer.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// A ring of `rps + 1` timestamps used to detect whether a subnet is
/// issuing requests faster than `rps` per second: write the current
/// timestamp into a slot and check whether the slot one full lap behind
/// is still within the last second.
pub struct RpsCounter {
    slots: Vec<AtomicI64>,
    next: AtomicUsize,
}

impl RpsCounter {
    /// Build a counter sized for `rps` requests per second.
    pub fn new(rps: usize) -> Self {
        let len = rps + 1;
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, || AtomicI64::new(0));
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    /// Record one request now and report whether the subnet is currently
    /// above its configured RPS (§4.2 "this is the 'hit' signal").
    pub fn add_and_check(&self) -> bool {
        let now = now_unix_nanos();
        let idx = self.next.fetch_add(1, Ordering::SeqCst) % self.slots.len();
        let prev = self.slots[idx].swap(now, Ordering::SeqCst);
        prev != 0 && (now - prev) <= 1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_rps_never_hits() {
        let counter = RpsCounter::new(10);
        for _ in 0..10 {
            assert!(!counter.add_and_check());
        }
    }

    #[test]
    fn exceeding_rps_within_one_second_hits() {
        let counter = RpsCounter::new(2);
        assert!(!counter.add_and_check());
        assert!(!counter.add_and_check());
        assert!(!counter.add_and_check());
        // Fourth request landed on the same ring slot as the first, all
        // within well under a second: above RPS.
        assert!(counter.add_and_check());
    }
}
