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

//! Per-upstream healthchecking: tracks a last-failed timestamp per
//! upstream and rewrites the active list wholesale on each refresh,
//! rather than flipping a shared atomic boolean per upstream.

use super::upstream::{NetworkPref, Upstream};
use crate::MAX_LEN;
use bytes::{Bytes, BytesMut};
use domain::base::{
    iana::{Class, Rcode, Rtype},
    Dname, MessageBuilder,
};
use rand::Rng;
use std::{
    str::FromStr,
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Per-upstream healthcheck configuration.
#[derive(Debug, Clone)]
pub struct HealthcheckConfig {
    /// Probe name template; `${RANDOM}` is substituted with a fresh random
    /// label per probe (§4.1).
    pub probe_name_template: String,
    /// How long a probe is allowed to take before being considered failed.
    pub probe_timeout: Duration,
    /// How long a failed upstream is kept out of the active list before
    /// being retried (§4.1 "BackoffDuration").
    pub backoff_duration: Duration,
    /// Force a specific network for the probe, overriding the upstream's
    /// own preference (§4.1 "NetworkOverride").
    pub network_override: Option<NetworkPref>,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            probe_name_template: "${RANDOM}.agdns-healthcheck.example.".to_string(),
            probe_timeout: Duration::from_secs(1),
            backoff_duration: Duration::from_secs(30),
            network_override: None,
        }
    }
}

/// Per-upstream healthcheck state (§3 `BackoffEntry`-like bookkeeping, but
/// for the forward resolver rather than the rate limiter). `0` means "never
/// failed, or the most recent probe succeeded".
pub struct HealthState {
    last_failed_healthcheck_unix_nanos: AtomicI64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            last_failed_healthcheck_unix_nanos: AtomicI64::new(0),
        }
    }
}

impl HealthState {
    /// True if this upstream is currently in its post-failure backoff
    /// window and should be kept out of the active list.
    pub fn in_backoff(&self, cfg: &HealthcheckConfig) -> bool {
        let last_failed = self.last_failed_healthcheck_unix_nanos.load(Ordering::SeqCst);
        if last_failed == 0 {
            return false;
        }
        let now = now_unix_nanos();
        let elapsed = Duration::from_nanos((now - last_failed).max(0) as u64);
        elapsed <= cfg.backoff_duration
    }

    fn mark_failed(&self) {
        self.last_failed_healthcheck_unix_nanos
            .store(now_unix_nanos(), Ordering::SeqCst);
    }

    fn mark_succeeded(&self) {
        // A success clears the timestamp and reinstates the upstream
        // immediately (§4.1).
        self.last_failed_healthcheck_unix_nanos
            .store(0, Ordering::SeqCst);
    }
}

fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Build the probe query for one healthcheck round, substituting
/// `${RANDOM}` with a fresh random label if present.
fn build_probe_message(cfg: &HealthcheckConfig) -> Bytes {
    let label: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let name_str = cfg.probe_name_template.replace("${RANDOM}", &label);
    let name = Dname::<Bytes>::from_str(&name_str).unwrap_or_else(|_| Dname::root_bytes());

    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN)).unwrap();
    builder.header_mut().set_id(rand::thread_rng().gen());
    builder.header_mut().set_rd(true);
    let mut builder = builder.question();
    let _ = builder.push((&name, Rtype::A, Class::In));
    builder.into_message().into_octets().freeze()
}

/// Probe one upstream; a success is a reply with `RCODE = NOERROR` and a
/// non-empty answer section within `probe_timeout` (§4.1).
pub async fn probe(upstream: &dyn Upstream, cfg: &HealthcheckConfig, state: &HealthState) -> bool {
    let probe_bytes = build_probe_message(cfg);
    let probe_msg = match domain::base::Message::from_octets(probe_bytes) {
        Ok(m) => m,
        Err(_) => {
            state.mark_failed();
            return false;
        }
    };
    let deadline = Instant::now() + cfg.probe_timeout;
    let ok = match upstream
        .exchange_forced(&probe_msg, deadline, cfg.network_override)
        .await
    {
        Ok((resp, _network)) => {
            resp.header().rcode() == Rcode::NoError
                && resp.answer().map(|mut a| a.next().is_some()).unwrap_or(false)
        }
        Err(_) => false,
    };
    if ok {
        state.mark_succeeded();
    } else {
        state.mark_failed();
    }
    ok
}
