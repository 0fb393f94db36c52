// portsplice/src/types.rs
//
// Shared domain types flowing through the proxy engine: rule keys, endpoint
// descriptors, selection/mode enums, flow five-tuples, traffic counters and
// dump records.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

/// Upper bound on backends per rule bucket.
pub const MAX_ENDPOINTS: usize = 16;

/// Per-connection receive buffer (one TLS record).
pub const RECV_BUF_LEN: usize = 16 * 1024;

/// Read rounds serviced per readiness notification before yielding.
pub const RX_BURST: usize = 1024;

/// Longest host name the sniffer will route on.
pub const MAX_HOST_LEN: usize = 255;

// ── L4 protocol ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Tcp,
    Sctp,
}

impl L4Proto {
    pub fn raw(self) -> i32 {
        match self {
            Self::Tcp  => libc::IPPROTO_TCP,
            Self::Sctp => libc::IPPROTO_SCTP,
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp  => write!(f, "tcp"),
            Self::Sctp => write!(f, "sctp"),
        }
    }
}

// ── Rule key / endpoint ───────────────────────────────────────────────────────

/// The virtual listen endpoint a rule is keyed by. Unique in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    pub vip:   IpAddr,
    pub port:  u16,
    pub proto: L4Proto,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.vip, self.port, self.proto)
    }
}

/// One backend a flow may be spliced to. Backends are always TCP on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip:    IpAddr,
    pub port:  u16,
    #[serde(default = "default_proto")]
    pub proto: L4Proto,
}

fn default_proto() -> L4Proto {
    L4Proto::Tcp
}

impl Endpoint {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self { ip: addr.ip(), port: addr.port(), proto: L4Proto::Tcp }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.proto)
    }
}

// ── Rule behavior knobs ───────────────────────────────────────────────────────

/// How incoming bytes fan out across a rule's backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// One backend per flow, chosen at setup time.
    Unicast,
    /// Every reachable backend gets a copy of every chunk.
    Broadcast,
}

/// When and how backends are picked for a new inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectMode {
    /// Sniff the HTTP Host header on first bytes, then pick the bucket.
    /// Non-HTTP traffic lands in the catch-all bucket.
    Host,
    /// Connect backends immediately after accept; chunks round-robin
    /// across peers when a flow has more than one.
    Eager,
}

/// Admin arguments for one host bucket of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Exact-match host; `""` is the catch-all bucket.
    #[serde(default)]
    pub host:        String,
    pub endpoints:   Vec<Endpoint>,
    pub mode:        ProxyMode,
    pub select:      SelectMode,
    /// Terminate TLS on the accept side.
    #[serde(default)]
    pub tls_accept:  bool,
    /// Originate TLS toward backends.
    #[serde(default)]
    pub tls_connect: bool,
    /// Require and verify client certificates (accept side).
    #[serde(default)]
    pub mtls:        bool,
    /// Opaque rule identifier surfaced in dump/stats records.
    pub id:          u32,
}

// ── Five-tuple ────────────────────────────────────────────────────────────────

/// A flow identity as seen from one socket. `src` is the remote peer for
/// ingress sockets and the local side for egress sockets, so records read
/// client → listener and proxy → backend respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src:   SocketAddr,
    pub dst:   SocketAddr,
    pub proto: L4Proto,
}

impl FiveTuple {
    pub fn from_stream(sock: &TcpStream, odir: bool, proto: L4Proto) -> std::io::Result<Self> {
        let local = sock.local_addr()?;
        let peer  = sock.peer_addr()?;
        Ok(if odir {
            Self { src: local, dst: peer, proto }
        } else {
            Self { src: peer, dst: local, proto }
        })
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {} ({})", self.src, self.dst, self.proto)
    }
}

// ── Traffic accounting ────────────────────────────────────────────────────────

/// Byte/packet counters for one direction pair. Credited under no lock;
/// snapshots are taken with relaxed loads.
#[derive(Debug, Default)]
pub struct TrafficStats {
    pub rx_bytes: AtomicU64,
    pub rx_pkts:  AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_pkts:  AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.rx_pkts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tx(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.tx_pkts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_pkts:  self.rx_pkts.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_pkts:  self.tx_pkts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_bytes: u64,
    pub rx_pkts:  u64,
    pub tx_bytes: u64,
    pub tx_pkts:  u64,
}

impl StatsSnapshot {
    /// Bytes moved in both directions.
    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes + self.tx_bytes
    }

    pub fn total_pkts(&self) -> u64 {
        self.rx_pkts + self.tx_pkts
    }
}

// ── Dump records ──────────────────────────────────────────────────────────────

/// One (ingress × backend) pair of a live flow, as emitted by `dump`.
#[derive(Debug, Clone, Serialize)]
pub struct DumpRecord {
    pub rule_id:       u32,
    pub client:        FiveTuple,
    pub backend:       FiveTuple,
    pub client_stats:  StatsSnapshot,
    pub backend_stats: StatsSnapshot,
    pub at:            DateTime<Utc>,
}
