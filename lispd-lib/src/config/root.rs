use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

/// The personality this daemon runs as
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Ingress/egress tunnel router
    Xtr,
    /// Mobile node: an xTR with a single EID
    Mn,
    /// Map-server
    Ms,
    /// Re-encapsulating tunnel router for NAT traversal
    Rtr,
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Device personality: "xtr", "mn", "ms" or "rtr"
    pub mode: DeviceMode,
    /// Control datagrams larger than this are dropped; also the MTU the
    /// data plane is asked to program on the tun device
    /// Default: 1500
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Debug verbosity 0..=3; RUST_LOG wins when set
    #[serde(default)]
    pub debug: u8,
    /// Append logs to this file instead of stderr (optional)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Unix socket dumping a JSON status snapshot per connection (optional)
    #[serde(default)]
    pub status_socket: Option<PathBuf>,
    /// Local EID prefixes this device registers (xTR/MN)
    #[serde(default, rename = "eid")]
    pub eids: Vec<EidConfig>,
    /// Map-resolvers queried on cache misses (xTR/MN)
    #[serde(default, rename = "map-resolver")]
    pub map_resolvers: Vec<MapResolverConfig>,
    /// Map-servers that receive our registrations (xTR/MN)
    #[serde(default, rename = "map-server")]
    pub map_servers: Vec<MapServerConfig>,
    /// Static RTR list (RTR mode peers, or forced NAT relays)
    #[serde(default, rename = "rtr")]
    pub rtrs: Vec<RtrConfig>,
    /// Interfaces whose RLOCs we announce
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,
    /// Registered sites (MS mode)
    #[serde(default, rename = "site")]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EidConfig {
    /// EID prefix in CIDR notation, e.g. "10.0.0.0/24"
    #[serde(deserialize_with = "deserialize_ip_net")]
    pub prefix: IpNet,
    /// Instance id qualifying the prefix (optional)
    #[serde(default)]
    pub iid: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapResolverConfig {
    pub address: IpAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapServerConfig {
    pub address: IpAddr,
    /// Shared secret for map-register authentication
    pub key: String,
    /// 1 = HMAC-SHA-1-96, 2 = HMAC-SHA-256-128
    /// Default: 1
    #[serde(default = "default_key_id", rename = "key-id")]
    pub key_id: u16,
    /// Ask the map-server to answer map-requests on our behalf
    #[serde(default, rename = "proxy-reply")]
    pub proxy_reply: bool,
    /// Request a map-notify acknowledging each registration
    /// Default: true
    #[serde(default = "default_true", rename = "want-map-notify")]
    pub want_map_notify: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RtrConfig {
    pub address: IpAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InterfaceConfig {
    pub name: String,
}

/// One site an MS accepts registrations for
#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    #[serde(deserialize_with = "deserialize_ip_net")]
    pub prefix: IpNet,
    #[serde(default)]
    pub iid: Option<u32>,
    pub key: String,
    #[serde(default = "default_key_id", rename = "key-id")]
    pub key_id: u16,
    /// Answer map-requests for this site instead of forwarding them
    #[serde(default, rename = "proxy-reply")]
    pub proxy_reply: bool,
}

fn default_mtu() -> usize {
    1500
}

fn default_key_id() -> u16 {
    1
}

fn default_true() -> bool {
    true
}

/// Parse an IP network from its string form, surfacing parse errors with
/// the offending value
fn deserialize_ip_net<'de, D>(deserializer: D) -> Result<IpNet, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = String::deserialize(deserializer)?;
    s.parse::<IpNet>()
        .map_err(|e| serde::de::Error::custom(format!("Invalid IP network '{}': {}", s, e)))
}
