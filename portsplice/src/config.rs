// portsplice/src/config.rs
//
// Engine configuration plus the on-disk rules file the daemon loads.
//
// The engine itself takes an `EngineConfig` value; there is no process-wide
// singleton; tests and embedders construct as many engines as they like.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{Endpoint, L4Proto, ProxyMode, RuleKey, RuleSpec, SelectMode};

/// Where server certificates live when no directory is configured.
pub const DEFAULT_CERT_DIR: &str = "/opt/portsplice/cert";

/// Default ceiling on bytes parked in one egress queue.
pub const DEFAULT_QUEUE_LIMIT: usize = 1 << 20;

// ── Egress queue overflow ─────────────────────────────────────────────────────

/// What to do when a peer's egress queue hits its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Stall the reading side until the queue drains. No data is lost.
    #[default]
    ReadPressure,
    /// Tear the flow down; the client sees a hangup and may reconnect.
    Drop,
}

// ── Descriptor remap window ───────────────────────────────────────────────────

/// Reserved descriptor window for deployments that relocate new sockets into
/// a dense range (kernel sockmap offload). Absent = identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemapConfig {
    /// First descriptor of the reserved window.
    #[serde(default = "default_remap_start")]
    pub start:   u16,
    /// Descriptors reserved per worker window.
    #[serde(default = "default_remap_span")]
    pub span:    u16,
    /// Number of per-worker windows.
    #[serde(default = "default_remap_workers")]
    pub workers: usize,
}

fn default_remap_start() -> u16 {
    500
}

fn default_remap_span() -> u16 {
    200
}

fn default_remap_workers() -> usize {
    4
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            start:   default_remap_start(),
            span:    default_remap_span(),
            workers: default_remap_workers(),
        }
    }
}

// ── Engine configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server certificates: `<cert_dir>/<host>/server.{crt,key}` per host,
    /// falling back to `<cert_dir>/server.{crt,key}`.
    pub cert_dir:       PathBuf,
    /// CA bundle directory for client-certificate verification (mTLS) and
    /// for backend certificate verification when enabled.
    pub ca_dir:         Option<PathBuf>,
    /// Egress queue byte ceiling per connection entry.
    pub queue_limit:    usize,
    pub overflow:       OverflowPolicy,
    /// Skip certificate verification when originating TLS to backends.
    pub ep_skip_verify: bool,
    /// Optional descriptor-window relocation.
    pub remap:          Option<RemapConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cert_dir:       PathBuf::from(DEFAULT_CERT_DIR),
            ca_dir:         None,
            queue_limit:    DEFAULT_QUEUE_LIMIT,
            overflow:       OverflowPolicy::ReadPressure,
            ep_skip_verify: false,
            remap:          None,
        }
    }
}

// ── Rules file ────────────────────────────────────────────────────────────────

/// The daemon's JSON config: engine settings plus the initial rule set.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub cert_dir:       Option<PathBuf>,
    #[serde(default)]
    pub ca_dir:         Option<PathBuf>,
    #[serde(default = "default_queue_limit")]
    pub queue_limit:    usize,
    #[serde(default)]
    pub overflow:       OverflowPolicy,
    #[serde(default)]
    pub ep_skip_verify: bool,
    #[serde(default)]
    pub remap:          Option<RemapConfig>,
    #[serde(default = "default_threads")]
    pub threads:        usize,
    #[serde(default)]
    pub rules:          Vec<FileRule>,
}

fn default_queue_limit() -> usize {
    DEFAULT_QUEUE_LIMIT
}

fn default_threads() -> usize {
    4
}

/// One rule entry of the rules file; flattens the key and the bucket spec.
#[derive(Debug, Clone, Deserialize)]
pub struct FileRule {
    pub vip:  IpAddr,
    pub port: u16,
    #[serde(default = "default_l4")]
    pub proto: L4Proto,
    #[serde(default = "default_mode")]
    pub mode: ProxyMode,
    #[serde(default = "default_select")]
    pub select: SelectMode,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub ep_tls: bool,
    #[serde(default)]
    pub mtls: bool,
    pub id: u32,
    pub endpoints: Vec<Endpoint>,
}

fn default_l4() -> L4Proto {
    L4Proto::Tcp
}

fn default_mode() -> ProxyMode {
    ProxyMode::Unicast
}

fn default_select() -> SelectMode {
    SelectMode::Host
}

impl FileConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cert_dir:       self.cert_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_DIR)),
            ca_dir:         self.ca_dir.clone(),
            queue_limit:    self.queue_limit,
            overflow:       self.overflow,
            ep_skip_verify: self.ep_skip_verify,
            remap:          self.remap,
        }
    }
}

impl FileRule {
    pub fn key(&self) -> RuleKey {
        RuleKey { vip: self.vip, port: self.port, proto: self.proto }
    }

    pub fn spec(&self) -> RuleSpec {
        RuleSpec {
            host:        self.host.clone(),
            endpoints:   self.endpoints.clone(),
            mode:        self.mode,
            select:      self.select,
            tls_accept:  self.tls,
            tls_connect: self.ep_tls,
            mtls:        self.mtls,
            id:          self.id,
        }
    }
}
