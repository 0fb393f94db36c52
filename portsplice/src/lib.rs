// portsplice/src/lib.rs
//
// portsplice: user-space L4/L7 socket proxy.
//
// Terminates inbound TCP/SCTP connections on configured virtual endpoints,
// optionally terminates and/or originates TLS, routes by the HTTP Host
// header into per-rule backend buckets, and splices bytes bidirectionally
// with per-peer egress queues, backpressure and per-endpoint accounting.
//
// The daemon lives in main.rs; everything else is usable in-process:
//
//   let engine = ProxyEngine::new(EngineConfig::default(), None);
//   engine.add_rule(key, spec)?;

pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod fdmap;
pub mod queue;
pub mod registry;
pub mod select;
pub mod sniff;
pub mod tls;
pub mod types;

pub use config::{EngineConfig, FileConfig, OverflowPolicy, RemapConfig};
pub use engine::{ProxyEngine, SockmapCb};
pub use error::ProxyError;
pub use types::{
    DumpRecord, Endpoint, FiveTuple, L4Proto, ProxyMode, RuleKey, RuleSpec, SelectMode,
    StatsSnapshot,
};
