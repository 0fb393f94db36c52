// portsplice/src/registry.rs
//
// The rule registry: one entry per virtual listen endpoint, each carrying a
// host → endpoint-bucket map, its TLS configs and the set of live flows
// rooted at it.
//
// One process-wide RW lock guards structural mutation of the rule map.
// Buckets hang off a rule behind its own lock; live connections sit in a
// sharded map so the data path never touches the registry lock. A deleted
// rule is only unhooked here; its memory lives on through the handles held
// by in-flight connections and the listener task, and goes when the last
// handle drops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rustls::{ClientConfig, ServerConfig};
use tokio::sync::Notify;

use crate::conn::ConnEntry;
use crate::error::ProxyError;
use crate::types::{
    DumpRecord, Endpoint, FiveTuple, L4Proto, ProxyMode, RuleKey, RuleSpec, SelectMode,
    TrafficStats,
};

// ── Bucket ────────────────────────────────────────────────────────────────────

/// One host's endpoint set under a rule, with its round-robin cursor and
/// per-backend counters.
pub struct Bucket {
    pub host:     String,
    pub rule_id:  u32,
    pub eps:      Vec<Endpoint>,
    pub ep_stats: Vec<TrafficStats>,
    cursor:       AtomicUsize,
}

impl Bucket {
    pub(crate) fn new(spec: &RuleSpec) -> Self {
        let ep_stats = spec.endpoints.iter().map(|_| TrafficStats::new()).collect();
        Self {
            host:     spec.host.clone(),
            rule_id:  spec.id,
            eps:      spec.endpoints.clone(),
            ep_stats,
            cursor:   AtomicUsize::new(0),
        }
    }

    /// Round-robin pick for the next flow.
    pub(crate) fn next_index(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.eps.len()
    }
}

// ── Rule ──────────────────────────────────────────────────────────────────────

pub struct Rule {
    pub key:    RuleKey,
    pub mode:   ProxyMode,
    pub select: SelectMode,
    /// Actual bound address of the listener (resolves port 0).
    pub local:  SocketAddr,

    pub(crate) tls_accept:  Option<Arc<ServerConfig>>,
    pub(crate) tls_connect: Option<Arc<ClientConfig>>,

    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    /// Live ingress entries rooted at this rule, by connection id.
    pub(crate) conns: DashMap<u64, Arc<ConnEntry>>,

    closing: AtomicBool,
    /// Wakes the listener task on delete.
    pub(crate) closed: Notify,
}

impl Rule {
    pub(crate) fn new(
        key: RuleKey,
        mode: ProxyMode,
        select: SelectMode,
        local: SocketAddr,
        tls_accept: Option<Arc<ServerConfig>>,
        tls_connect: Option<Arc<ClientConfig>>,
    ) -> Self {
        Self {
            key,
            mode,
            select,
            local,
            tls_accept,
            tls_connect,
            buckets: RwLock::new(HashMap::new()),
            conns: DashMap::new(),
            closing: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }

    pub(crate) fn add_bucket(&self, spec: &RuleSpec) -> Result<(), ProxyError> {
        let mut buckets = self.buckets.write();
        if buckets.contains_key(&spec.host) {
            return Err(ProxyError::BucketExists(spec.host.clone()));
        }
        buckets.insert(spec.host.clone(), Arc::new(Bucket::new(spec)));
        Ok(())
    }

    /// Remove a host bucket; returns how many remain.
    pub(crate) fn remove_bucket(&self, host: &str) -> Result<usize, ProxyError> {
        let mut buckets = self.buckets.write();
        buckets
            .remove(host)
            .ok_or_else(|| ProxyError::BucketNotFound(host.to_string()))?;
        Ok(buckets.len())
    }

    /// Exact host match with catch-all fallback.
    pub fn bucket(&self, host: &str) -> Option<Arc<Bucket>> {
        let buckets = self.buckets.read();
        buckets.get(host).or_else(|| buckets.get("")).cloned()
    }

    pub(crate) fn buckets_snapshot(&self) -> Vec<Arc<Bucket>> {
        self.buckets.read().values().cloned().collect()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so the listener wakes even if it is
        // between polls of `closed` when the delete lands.
        self.closed.notify_one();
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub(crate) struct Registry {
    pub(crate) rules: RwLock<HashMap<RuleKey, Arc<Rule>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self { rules: RwLock::new(HashMap::new()) }
    }

    pub(crate) fn get(&self, key: &RuleKey) -> Option<Arc<Rule>> {
        self.rules.read().get(key).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Rule>> {
        self.rules.read().values().cloned().collect()
    }

    /// Per-endpoint transmit totals, aggregated across every bucket carrying
    /// the rule id.
    pub(crate) fn entry_stats(&self, rule_id: u32, ep_id: usize) -> (u64, u64) {
        let mut pkts = 0u64;
        let mut bytes = 0u64;
        for rule in self.rules.read().values() {
            for bucket in rule.buckets_snapshot() {
                if bucket.rule_id != rule_id || ep_id >= bucket.ep_stats.len() {
                    continue;
                }
                let snap = bucket.ep_stats[ep_id].snapshot();
                pkts += snap.tx_pkts;
                bytes += snap.tx_bytes;
            }
        }
        (pkts, bytes)
    }

    /// Emit one record per (ingress × backend) pair of every live flow.
    pub(crate) fn dump<F: FnMut(DumpRecord)>(&self, mut cb: F) {
        let rules = self.snapshot();
        let now = Utc::now();
        for rule in rules {
            let ingresses: Vec<Arc<ConnEntry>> =
                rule.conns.iter().map(|e| e.value().clone()).collect();
            for ingress in ingresses {
                let Ok(client) = FiveTuple::from_stream(ingress.sock(), false, rule.key.proto)
                else {
                    continue;
                };
                for peer in ingress.peers_snapshot() {
                    let Ok(backend) = FiveTuple::from_stream(peer.sock(), true, L4Proto::Tcp)
                    else {
                        continue;
                    };
                    cb(DumpRecord {
                        rule_id:       peer.bucket_id().unwrap_or(0),
                        client,
                        backend,
                        client_stats:  ingress.stats.snapshot(),
                        backend_stats: peer.stats.snapshot(),
                        at:            now,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_ENDPOINTS;

    fn spec(host: &str, id: u32, n_eps: usize) -> RuleSpec {
        RuleSpec {
            host:        host.to_string(),
            endpoints:   (0..n_eps)
                .map(|i| Endpoint {
                    ip:    "127.0.0.1".parse().unwrap(),
                    port:  9000 + i as u16,
                    proto: L4Proto::Tcp,
                })
                .collect(),
            mode:        ProxyMode::Unicast,
            select:      SelectMode::Host,
            tls_accept:  false,
            tls_connect: false,
            mtls:        false,
            id,
        }
    }

    fn rule(key_port: u16) -> Rule {
        Rule::new(
            RuleKey {
                vip:   "127.0.0.1".parse().unwrap(),
                port:  key_port,
                proto: L4Proto::Tcp,
            },
            ProxyMode::Unicast,
            SelectMode::Host,
            "127.0.0.1:0".parse().unwrap(),
            None,
            None,
        )
    }

    #[test]
    fn duplicate_host_bucket_is_rejected() {
        let r = rule(80);
        r.add_bucket(&spec("", 1, 1)).unwrap();
        r.add_bucket(&spec("a.test", 1, 1)).unwrap();
        let err = r.add_bucket(&spec("a.test", 1, 1)).unwrap_err();
        assert!(matches!(err, ProxyError::BucketExists(h) if h == "a.test"));
    }

    #[test]
    fn bucket_lookup_falls_back_to_catch_all() {
        let r = rule(80);
        r.add_bucket(&spec("", 1, 1)).unwrap();
        r.add_bucket(&spec("a.test", 2, 1)).unwrap();

        assert_eq!(r.bucket("a.test").unwrap().rule_id, 2);
        assert_eq!(r.bucket("b.test").unwrap().rule_id, 1);
        assert_eq!(r.bucket("").unwrap().rule_id, 1);
    }

    #[test]
    fn lookup_without_catch_all_can_miss() {
        let r = rule(80);
        r.add_bucket(&spec("only.this", 1, 1)).unwrap();
        assert!(r.bucket("other.host").is_none());
    }

    #[test]
    fn remove_bucket_counts_down() {
        let r = rule(80);
        r.add_bucket(&spec("", 1, 1)).unwrap();
        r.add_bucket(&spec("a.test", 1, 1)).unwrap();
        assert_eq!(r.remove_bucket("a.test").unwrap(), 1);
        assert!(matches!(
            r.remove_bucket("a.test").unwrap_err(),
            ProxyError::BucketNotFound(_)
        ));
        assert_eq!(r.remove_bucket("").unwrap(), 0);
    }

    #[test]
    fn round_robin_cursor_wraps() {
        let b = Bucket::new(&spec("", 1, 3));
        let picks: Vec<usize> = (0..7).map(|_| b.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn entry_stats_aggregate_across_buckets() {
        let registry = Registry::new();
        let r = rule(80);
        r.add_bucket(&spec("", 7, 2)).unwrap();
        r.add_bucket(&spec("a.test", 7, 2)).unwrap();
        r.add_bucket(&spec("b.test", 8, 2)).unwrap();

        for bucket in r.buckets_snapshot() {
            bucket.ep_stats[0].add_tx(100);
            bucket.ep_stats[1].add_tx(1);
        }
        registry
            .rules
            .write()
            .insert(r.key, Arc::new(r));

        // Slot 0 of id 7 sums over two buckets; id 8 contributes separately.
        assert_eq!(registry.entry_stats(7, 0), (2, 200));
        assert_eq!(registry.entry_stats(8, 0), (1, 100));
        assert_eq!(registry.entry_stats(7, 1), (2, 2));
        // Out-of-range slot and unknown id read zero.
        assert_eq!(registry.entry_stats(7, MAX_ENDPOINTS), (0, 0));
        assert_eq!(registry.entry_stats(99, 0), (0, 0));
    }

    #[test]
    fn single_listener_per_key() {
        let registry = Registry::new();
        let r = rule(80);
        let key = r.key;
        registry.rules.write().insert(key, Arc::new(r));
        // A second insert under the same key replaces rather than duplicates;
        // the engine's add path attaches a bucket instead of inserting.
        assert_eq!(registry.rules.read().len(), 1);
        assert!(registry.get(&key).is_some());
    }
}
