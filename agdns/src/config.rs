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

//! On-disk configuration: a `serde` + `serde_yaml` tree naming server
//! groups, upstream groups, rate-limit policy and cache sizes.

use agdns_core::context::Protocol;
use agdns_core::forward::{NetworkPref, Upstream, UpstreamPlain};
use agdns_core::middleware::{CacheBackend, SafeBrowsingConfig};
use agdns_core::ratelimit::{backoff::BackoffConfig, RateLimitConfig};
use agdns_core::special::ddr::DdrTarget;
use serde::Deserialize;
use std::{net::SocketAddr, num::NonZeroUsize, sync::Arc, time::Duration};

/// Default configuration shipped with the binary, used when `--config` is
/// not given.
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.yaml");

fn default_handle_timeout_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_backoff_secs() -> u64 {
    30
}

fn default_response_size_estimate() -> usize {
    64
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listeners to bind, one per server group.
    pub servers: Vec<ServerGroupConfig>,
    /// Upstream resolvers the forward resolver dials, in priority order.
    pub upstreams: UpstreamsConfig,
    /// Rate-limit engine tuning.
    #[serde(default)]
    pub rate_limit: RateLimitConfigFile,
    /// Pre-upstream cache layer.
    pub cache: CacheConfig,
    /// Safe-browsing TXT lookup suffix (§6).
    #[serde(default)]
    pub safe_browsing: SafeBrowsingConfigFile,
    /// Discovery of Designated Resolvers targets (§6 "DDR").
    #[serde(default)]
    pub ddr: Vec<DdrTargetConfig>,
    /// Upper bound on how long a single query may occupy its task (§5).
    #[serde(default = "default_handle_timeout_ms")]
    pub handle_timeout_ms: u64,
}

impl Config {
    /// Per-request deadline as a `Duration`.
    pub fn handle_timeout(&self) -> Duration {
        Duration::from_millis(self.handle_timeout_ms)
    }
}

/// One bound listener (§2, §3 `ServerInfo`).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerGroupConfig {
    /// Name of this server group, used in metrics labels.
    pub name: String,
    /// Local address to bind.
    pub listen: SocketAddr,
    /// Wire protocol this listener serves.
    pub protocol: ProtocolConfig,
    /// Whether linked-IP (device-by-client-IP) lookups apply to this
    /// listener.
    #[serde(default)]
    pub linked_ip_enabled: bool,
    /// Whether the rate-limit engine gates this listener.
    #[serde(default = "default_true")]
    pub rate_limited: bool,
}

fn default_true() -> bool {
    true
}

/// Wire protocol a listener serves, as written in config (§6). Only
/// `udp`/`tcp`/`dot`/`doh` are wired up by this binary; `doq`/`dnscrypt`
/// parse but are rejected at startup since DoQ/DNSCrypt framing is out of
/// scope (§6 "Supplemented features").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolConfig {
    Udp,
    Tcp,
    Dot,
    Doh,
    Doq,
    DnsCrypt,
}

impl ProtocolConfig {
    /// The runtime `Protocol` this config value maps to.
    pub fn as_protocol(self) -> Protocol {
        match self {
            ProtocolConfig::Udp => Protocol::Udp,
            ProtocolConfig::Tcp => Protocol::Tcp,
            ProtocolConfig::Dot => Protocol::Dot,
            ProtocolConfig::Doh => Protocol::Doh,
            ProtocolConfig::Doq => Protocol::Doq,
            ProtocolConfig::DnsCrypt => Protocol::DnsCrypt,
        }
    }
}

/// Active/fallback upstream lists plus shared healthcheck tuning (§4.1).
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamsConfig {
    /// Upstreams queried under normal conditions.
    pub active: Vec<UpstreamConfig>,
    /// Upstreams only queried once every active upstream is unhealthy.
    #[serde(default)]
    pub fallback: Vec<UpstreamConfig>,
    /// Healthcheck probe tuning shared by every configured upstream.
    #[serde(default)]
    pub healthcheck: HealthcheckConfigFile,
}

/// One configured upstream resolver (§3 `Upstream`).
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Address to dial.
    pub addr: SocketAddr,
    /// Network preference for this upstream.
    #[serde(default)]
    pub network: UpstreamNetworkConfig,
    /// Per-exchange timeout.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

impl UpstreamConfig {
    /// Build the runtime `UpstreamPlain` this entry describes.
    pub fn build(&self) -> Arc<dyn Upstream> {
        Arc::new(UpstreamPlain::new(
            self.addr,
            self.network.as_network_pref(),
            Duration::from_millis(self.timeout_ms),
        ))
    }
}

/// Network preference as written in config (§3 `Upstream`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamNetworkConfig {
    Any,
    Udp,
    Tcp,
}

impl Default for UpstreamNetworkConfig {
    fn default() -> Self {
        UpstreamNetworkConfig::Any
    }
}

impl UpstreamNetworkConfig {
    fn as_network_pref(self) -> NetworkPref {
        match self {
            UpstreamNetworkConfig::Any => NetworkPref::Any,
            UpstreamNetworkConfig::Udp => NetworkPref::Udp,
            UpstreamNetworkConfig::Tcp => NetworkPref::Tcp,
        }
    }
}

/// Healthcheck tuning as written in config (§4.1 "Healthcheck").
#[derive(Debug, Clone, Deserialize)]
pub struct HealthcheckConfigFile {
    #[serde(default = "default_probe_name_template")]
    pub probe_name_template: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Force a specific network for probes, overriding the upstream's own
    /// preference (§4.1 "NetworkOverride"). One of `"udp"`/`"tcp"`; absent
    /// or unrecognized means "follow the upstream's own preference".
    #[serde(default)]
    pub network_override: Option<String>,
}

fn default_probe_name_template() -> String {
    "${RANDOM}.agdns-healthcheck.example.".to_string()
}

impl Default for HealthcheckConfigFile {
    fn default() -> Self {
        Self {
            probe_name_template: default_probe_name_template(),
            probe_timeout_ms: default_probe_timeout_ms(),
            backoff_secs: default_backoff_secs(),
            network_override: None,
        }
    }
}

impl HealthcheckConfigFile {
    /// The runtime `HealthcheckConfig` this entry describes.
    pub fn build(&self) -> agdns_core::forward::healthcheck::HealthcheckConfig {
        use agdns_core::forward::NetworkPref;
        let network_override = match self.network_override.as_deref() {
            Some("udp") => Some(NetworkPref::Udp),
            Some("tcp") => Some(NetworkPref::Tcp),
            _ => None,
        };
        agdns_core::forward::healthcheck::HealthcheckConfig {
            probe_name_template: self.probe_name_template.clone(),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            backoff_duration: Duration::from_secs(self.backoff_secs),
            network_override,
        }
    }
}

/// Rate-limit policy as written in config (§4.2).
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfigFile {
    #[serde(default = "default_true")]
    pub refuse_any: bool,
    #[serde(default = "default_response_size_estimate")]
    pub response_size_estimate: usize,
    /// Prefixes exempt from rate limiting regardless of observed traffic.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Listener protocols the rate limiter applies to; empty means all.
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
    /// RPS/backoff tuning (§4.2 "RPS counter", "State expiry").
    #[serde(default)]
    pub backoff: BackoffConfigFile,
}

impl Default for RateLimitConfigFile {
    fn default() -> Self {
        Self {
            refuse_any: true,
            response_size_estimate: default_response_size_estimate(),
            allowlist: Vec::new(),
            protocols: Vec::new(),
            backoff: BackoffConfigFile::default(),
        }
    }
}

impl RateLimitConfigFile {
    /// The runtime `RateLimitConfig` this entry describes.
    pub fn build(&self) -> RateLimitConfig {
        RateLimitConfig {
            backoff: self.backoff.build(),
            refuse_any: self.refuse_any,
            response_size_estimate: self.response_size_estimate,
        }
    }

    /// Parsed persistent allowlist prefixes; malformed entries are skipped
    /// with a warning logged by the caller.
    pub fn allowlist_prefixes(&self) -> Vec<ipnet::IpNet> {
        self.allowlist
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(net) => Some(net),
                Err(_) => {
                    log::warn!("agdns::config: ignoring malformed allowlist prefix {s:?}");
                    None
                }
            })
            .collect()
    }
}

fn default_rps() -> usize {
    10
}

fn default_rps_period_secs() -> u64 {
    60
}

fn default_backoff_count() -> u64 {
    10
}

fn default_backoff_window_secs() -> u64 {
    300
}

fn default_ipv4_subnet_key_len() -> u8 {
    24
}

fn default_ipv6_subnet_key_len() -> u8 {
    64
}

/// RPS/backoff engine tuning as written in config (§4.2 "RPS counter",
/// "State expiry").
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfigFile {
    #[serde(default = "default_rps")]
    pub rps: usize,
    #[serde(default = "default_rps_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_backoff_count")]
    pub count: u64,
    #[serde(default = "default_backoff_window_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_ipv4_subnet_key_len")]
    pub ipv4_subnet_key_len: u8,
    #[serde(default = "default_ipv6_subnet_key_len")]
    pub ipv6_subnet_key_len: u8,
}

impl Default for BackoffConfigFile {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            period_secs: default_rps_period_secs(),
            count: default_backoff_count(),
            duration_secs: default_backoff_window_secs(),
            ipv4_subnet_key_len: default_ipv4_subnet_key_len(),
            ipv6_subnet_key_len: default_ipv6_subnet_key_len(),
        }
    }
}

impl BackoffConfigFile {
    /// The runtime `BackoffConfig` this entry describes.
    pub fn build(&self) -> BackoffConfig {
        BackoffConfig {
            rps: self.rps,
            period: Duration::from_secs(self.period_secs),
            count: self.count,
            duration: Duration::from_secs(self.duration_secs),
            ipv4_subnet_key_len: self.ipv4_subnet_key_len,
            ipv6_subnet_key_len: self.ipv6_subnet_key_len,
        }
    }
}

/// Cache backend selection and sizing (§4.3).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CacheConfig {
    /// Non-ECS LRU cache.
    Plain {
        count: usize,
        #[serde(default)]
        min_ttl: u32,
        #[serde(default)]
        override_ttl: bool,
    },
    /// ECS-aware two-sub-store cache.
    Ecs {
        ecs_count: usize,
        no_ecs_count: usize,
        #[serde(default)]
        min_ttl: u32,
        #[serde(default)]
        override_ttl: bool,
    },
}

impl CacheConfig {
    /// Build the runtime `CacheBackend` this entry describes.
    pub fn build(&self) -> CacheBackend {
        match self {
            CacheConfig::Plain {
                count,
                min_ttl,
                override_ttl,
            } => CacheBackend::Plain(agdns_core::cache::PlainCache::new(agdns_core::cache::PlainCacheConfig {
                count: NonZeroUsize::new(*count).unwrap_or_else(|| NonZeroUsize::new(1).unwrap()),
                min_ttl: *min_ttl,
                override_ttl: *override_ttl,
            })),
            CacheConfig::Ecs {
                ecs_count,
                no_ecs_count,
                min_ttl,
                override_ttl,
            } => CacheBackend::Ecs(agdns_core::cache::EcsCache::new(agdns_core::cache::EcsCacheConfig {
                plain: agdns_core::cache::PlainCacheConfig {
                    count: NonZeroUsize::new(1).unwrap(),
                    min_ttl: *min_ttl,
                    override_ttl: *override_ttl,
                },
                ecs_count: NonZeroUsize::new(*ecs_count).unwrap_or_else(|| NonZeroUsize::new(1).unwrap()),
                no_ecs_count: NonZeroUsize::new(*no_ecs_count).unwrap_or_else(|| NonZeroUsize::new(1).unwrap()),
            })),
        }
    }
}

/// Safe-browsing TXT lookup suffix as written in config (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct SafeBrowsingConfigFile {
    #[serde(default = "default_sb_suffix")]
    pub suffix: String,
}

fn default_sb_suffix() -> String {
    "sb.dns.adguard.com.".to_string()
}

impl Default for SafeBrowsingConfigFile {
    fn default() -> Self {
        Self {
            suffix: default_sb_suffix(),
        }
    }
}

impl SafeBrowsingConfigFile {
    /// The runtime `SafeBrowsingConfig` this entry describes.
    pub fn build(&self) -> SafeBrowsingConfig {
        SafeBrowsingConfig {
            suffix: self.suffix.clone(),
        }
    }
}

/// One DDR SVCB target as written in config (§6 "DDR").
#[derive(Debug, Clone, Deserialize)]
pub struct DdrTargetConfig {
    pub priority: u16,
    pub target_host: String,
    pub port: u16,
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub ipv4_hints: Vec<std::net::Ipv4Addr>,
    #[serde(default)]
    pub ipv6_hints: Vec<std::net::Ipv6Addr>,
    #[serde(default = "default_ddr_ttl")]
    pub ttl: u32,
}

fn default_ddr_ttl() -> u32 {
    300
}

impl DdrTargetConfig {
    /// The runtime `DdrTarget` this entry describes. ALPN tokens are
    /// mapped onto the small fixed set `DdrTarget` accepts (`"dot"`,
    /// `"h2"`, `"doq"`); unrecognized tokens are dropped.
    pub fn build(&self) -> DdrTarget {
        let alpn = self
            .alpn
            .iter()
            .filter_map(|a| match a.as_str() {
                "dot" => Some("dot"),
                "h2" => Some("h2"),
                "doq" => Some("doq"),
                _ => {
                    log::warn!("agdns::config: ignoring unrecognized DDR alpn token {a:?}");
                    None
                }
            })
            .collect();
        DdrTarget {
            priority: self.priority,
            target_host: self.target_host.clone(),
            port: self.port,
            alpn,
            ipv4_hints: self.ipv4_hints.clone(),
            ipv6_hints: self.ipv6_hints.clone(),
            ttl: self.ttl,
        }
    }
}
