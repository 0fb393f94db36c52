// portsplice/src/engine.rs
//
// The engine: a context value tying together the rule registry, the
// descriptor remapper, the optional sockmap-offload callback and the
// per-rule listener tasks. Admin calls (add/delete/dump/stats) are methods
// here; the data path runs in the pump tasks of conn.rs.
//
// One listener task per rule accepts inbound connections, terminates TLS
// when the rule asks for it, and either selects backends eagerly (SCTP and
// eager-select rules) or leaves selection to the first-byte sniff in the
// reader pump.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::conn::{self, ConnEntry};
use crate::error::ProxyError;
use crate::fdmap::{self, FdMapper};
use crate::registry::{Registry, Rule};
use crate::select;
use crate::tls::{self, TlsSession};
use crate::types::{
    DumpRecord, FiveTuple, L4Proto, ProxyMode, RuleKey, RuleSpec, SelectMode, MAX_ENDPOINTS,
    MAX_HOST_LEN,
};

/// Invoked once per direction after a plain-TCP unicast flow is fully
/// established: `(flow tuple, socket fd, egress direction)`. The hook point
/// for pushing flows into a kernel sockmap.
pub type SockmapCb = Arc<dyn Fn(&FiveTuple, RawFd, bool) + Send + Sync>;

pub struct ProxyEngine {
    cfg:        EngineConfig,
    registry:   Registry,
    sockmap_cb: Option<SockmapCb>,
    fdmap:      Option<FdMapper>,
    conn_seq:   AtomicU64,
    /// Handed to listener tasks so they can reach the engine without the
    /// admin API needing an `Arc` receiver.
    self_ref:   Weak<ProxyEngine>,
}

impl ProxyEngine {
    /// Build an engine. Rules are installed with [`add_rule`]; the engine
    /// runs entirely on the caller's tokio runtime.
    ///
    /// [`add_rule`]: ProxyEngine::add_rule
    pub fn new(cfg: EngineConfig, sockmap_cb: Option<SockmapCb>) -> Arc<Self> {
        let fdmap = cfg.remap.as_ref().map(FdMapper::new);
        Arc::new_cyclic(|self_ref| Self {
            cfg,
            registry: Registry::new(),
            sockmap_cb,
            fdmap,
            conn_seq: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub(crate) fn cfg(&self) -> &EngineConfig {
        &self.cfg
    }

    pub(crate) fn fdmapper(&self) -> Option<&FdMapper> {
        self.fdmap.as_ref()
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ── Admin API ────────────────────────────────────────────────────────────

    /// Install a rule, or attach another host bucket when the key already
    /// exists (the listener and TLS configs are left untouched in that
    /// case). Must be called from within the engine's runtime.
    pub fn add_rule(&self, key: RuleKey, spec: RuleSpec) -> Result<(), ProxyError> {
        let engine = self.self_ref.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "engine is shutting down")
        })?;
        if spec.endpoints.is_empty() || spec.endpoints.len() > MAX_ENDPOINTS {
            return Err(ProxyError::BadEndpointCount(spec.endpoints.len()));
        }
        if spec.host.len() > MAX_HOST_LEN {
            return Err(ProxyError::HostTooLong);
        }
        // Fan-out under a TLS session would have to serialize every peer's
        // record stream; refused outright.
        if spec.mode == ProxyMode::Broadcast && spec.tls_connect {
            return Err(ProxyError::BroadcastTls);
        }

        let mut rules = self.registry.rules.write();
        if let Some(rule) = rules.get(&key) {
            rule.add_bucket(&spec)?;
            info!("rule {key}: bucket `{}` attached ({} backends)", spec.host, spec.endpoints.len());
            return Ok(());
        }

        let tls_accept = if spec.tls_accept {
            Some(tls::server_config(
                &self.cfg.cert_dir,
                &spec.host,
                self.cfg.ca_dir.as_deref(),
                spec.mtls,
            )?)
        } else {
            None
        };
        let tls_connect = if spec.tls_connect {
            Some(tls::client_config(self.cfg.ca_dir.as_deref(), self.cfg.ep_skip_verify)?)
        } else {
            None
        };

        let listener = bind_listener(&key)?;
        let local = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;

        let rule = Arc::new(Rule::new(key, spec.mode, spec.select, local, tls_accept, tls_connect));
        rule.add_bucket(&spec)?;
        rules.insert(key, rule.clone());
        drop(rules);

        tokio::spawn(run_listener(engine, rule, listener));
        info!(
            "rule {key} added on {local} (host `{}`, {} backends, {})",
            spec.host,
            spec.endpoints.len(),
            if spec.tls_accept { "tls" } else { "plain" },
        );
        Ok(())
    }

    /// Remove one host bucket; when the last bucket goes, the rule is
    /// unhooked, its listener closed asynchronously and every in-flight
    /// flow torn down.
    pub fn delete_rule(&self, key: &RuleKey, host: &str) -> Result<(), ProxyError> {
        let mut rules = self.registry.rules.write();
        let rule = rules.get(key).ok_or(ProxyError::RuleNotFound)?.clone();
        let remaining = rule.remove_bucket(host)?;
        if remaining == 0 {
            rules.remove(key);
            drop(rules);
            rule.begin_close();
            info!("rule {key} removed");
        } else {
            info!("rule {key}: bucket `{host}` removed, {remaining} left");
        }
        Ok(())
    }

    /// Walk every live flow; one record per (ingress × backend) pair.
    pub fn dump<F: FnMut(DumpRecord)>(&self, cb: F) {
        self.registry.dump(cb);
    }

    /// `(tx_pkts, tx_bytes)` for one endpoint slot, aggregated across all
    /// buckets carrying the rule id.
    pub fn entry_stats(&self, rule_id: u32, ep_id: usize) -> (u64, u64) {
        self.registry.entry_stats(rule_id, ep_id)
    }

    /// Bound address of a rule's listener (resolves port 0 binds).
    pub fn listen_addr(&self, key: &RuleKey) -> Option<SocketAddr> {
        self.registry.get(key).map(|r| r.local)
    }

    /// `(rules, live flows)` for the stats line.
    pub fn summary(&self) -> (usize, usize) {
        let rules = self.registry.snapshot();
        let flows = rules.iter().map(|r| r.conns.len()).sum();
        (rules.len(), flows)
    }

    /// Tear every rule down. Listeners close and flows drain asynchronously.
    pub fn stop(&self) {
        let rules: Vec<Arc<Rule>> = {
            let mut map = self.registry.rules.write();
            map.drain().map(|(_, rule)| rule).collect()
        };
        for rule in rules {
            rule.begin_close();
        }
    }

    pub(crate) fn notify_sockmap(&self, ingress: &ConnEntry, egress: &ConnEntry) {
        let Some(cb) = &self.sockmap_cb else { return };
        let (Ok(ituple), Ok(rtuple)) = (
            FiveTuple::from_stream(ingress.sock(), false, L4Proto::Tcp),
            FiveTuple::from_stream(egress.sock(), true, L4Proto::Tcp),
        ) else {
            return;
        };
        cb(&rtuple, ingress.raw_fd(), true);
        cb(&ituple, egress.raw_fd(), true);
    }
}

// ── Listener path ─────────────────────────────────────────────────────────────

/// Bind the rule's virtual endpoint: SO_REUSEADDR, non-blocking, backlog 32.
/// SCTP rules use a stream socket with IPPROTO_SCTP; everything downstream
/// treats it as a byte stream.
fn bind_listener(key: &RuleKey) -> io::Result<std::net::TcpListener> {
    let domain = if key.vip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::from(key.proto.raw())))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(key.vip, key.port).into())?;
    socket.listen(32)?;
    Ok(socket.into())
}

async fn run_listener(engine: Arc<ProxyEngine>, rule: Arc<Rule>, listener: TcpListener) {
    debug!("listener up on {} for {}", rule.local, rule.key);
    loop {
        tokio::select! {
            _ = rule.closed.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((sock, peer)) => {
                    if rule.is_closing() {
                        break;
                    }
                    trace!("accepted {peer} on {}", rule.key);
                    let engine = engine.clone();
                    let rule = rule.clone();
                    tokio::spawn(handle_accept(engine, rule, sock));
                }
                Err(e) => {
                    // Transient accept errors must not kill the rule.
                    warn!("accept on {} failed: {e}", rule.key);
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    // The listener socket closes here; sweep every flow still rooted at the
    // rule. The rule value itself is freed when the last handle drops.
    let flows: Vec<Arc<ConnEntry>> = rule.conns.iter().map(|e| e.value().clone()).collect();
    for flow in flows {
        flow.teardown();
    }
    debug!("listener for {} drained", rule.key);
}

async fn handle_accept(engine: Arc<ProxyEngine>, rule: Arc<Rule>, sock: TcpStream) {
    let sock = match fdmap::remap_stream(engine.fdmapper(), sock, true) {
        Ok(sock) => sock,
        Err(e) => {
            warn!("fd remap on accept failed: {e}");
            return;
        }
    };
    if rule.key.proto == L4Proto::Tcp {
        let _ = sock.set_nodelay(true);
    }

    let tls = match &rule.tls_accept {
        Some(config) => {
            let mut session = match TlsSession::server(config.clone()) {
                Ok(session) => session,
                Err(e) => {
                    warn!("tls session on {} failed: {e}", rule.key);
                    return;
                }
            };
            if let Err(e) = session.accept(&sock).await {
                debug!("tls accept on {} failed: {e}", rule.key);
                return;
            }
            Some(session)
        }
        None => None,
    };

    let entry = ConnEntry::ingress(
        engine.next_conn_id(),
        rule.clone(),
        sock,
        tls,
        engine.cfg().queue_limit,
        engine.cfg().overflow,
    );
    rule.conns.insert(entry.id, entry.clone());

    // A delete may have swept the rule between accept and insert.
    if rule.is_closing() {
        entry.teardown();
        return;
    }

    // SCTP flows and eager-select rules pick backends at accept time; HTTP
    // rules wait for the sniffer.
    if rule.select == SelectMode::Eager || rule.key.proto == L4Proto::Sctp {
        if let Err(e) = select::establish(&engine, &entry, "").await {
            debug!("eager backend setup on {} failed: {e}", rule.key);
            entry.teardown();
            return;
        }
    }

    conn::spawn_pumps(&entry, &engine);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::Endpoint;

    fn key(port: u16) -> RuleKey {
        RuleKey { vip: "127.0.0.1".parse().unwrap(), port, proto: L4Proto::Tcp }
    }

    fn spec(host: &str, mode: ProxyMode, tls_connect: bool, n_eps: usize) -> RuleSpec {
        RuleSpec {
            host:        host.to_string(),
            endpoints:   (0..n_eps)
                .map(|i| Endpoint {
                    ip:    "127.0.0.1".parse().unwrap(),
                    port:  9100 + i as u16,
                    proto: L4Proto::Tcp,
                })
                .collect(),
            mode,
            select:      SelectMode::Host,
            tls_accept:  false,
            tls_connect,
            mtls:        false,
            id:          1,
        }
    }

    #[tokio::test]
    async fn rejects_bad_endpoint_counts() {
        let engine = ProxyEngine::new(EngineConfig::default(), None);
        let err = engine.add_rule(key(0), spec("", ProxyMode::Unicast, false, 0)).unwrap_err();
        assert!(matches!(err, ProxyError::BadEndpointCount(0)));
        let err = engine
            .add_rule(key(0), spec("", ProxyMode::Unicast, false, MAX_ENDPOINTS + 1))
            .unwrap_err();
        assert!(matches!(err, ProxyError::BadEndpointCount(_)));
    }

    #[tokio::test]
    async fn rejects_broadcast_with_tls_origination() {
        let engine = ProxyEngine::new(EngineConfig::default(), None);
        let err = engine.add_rule(key(0), spec("", ProxyMode::Broadcast, true, 2)).unwrap_err();
        assert!(matches!(err, ProxyError::BroadcastTls));
    }

    #[tokio::test]
    async fn duplicate_bucket_via_admin_api() {
        let engine = ProxyEngine::new(EngineConfig::default(), None);
        let k = key(0);
        engine.add_rule(k, spec("", ProxyMode::Unicast, false, 1)).unwrap();
        let err = engine.add_rule(k, spec("", ProxyMode::Unicast, false, 1)).unwrap_err();
        assert!(matches!(err, ProxyError::BucketExists(_)));
        engine.stop();
    }

    #[tokio::test]
    async fn delete_last_bucket_unhooks_the_rule() {
        let engine = ProxyEngine::new(EngineConfig::default(), None);
        let k = key(0);
        engine.add_rule(k, spec("", ProxyMode::Unicast, false, 1)).unwrap();
        engine.add_rule(k, spec("a.test", ProxyMode::Unicast, false, 1)).unwrap();

        engine.delete_rule(&k, "a.test").unwrap();
        assert!(engine.listen_addr(&k).is_some());

        engine.delete_rule(&k, "").unwrap();
        assert!(engine.listen_addr(&k).is_none());
        assert!(matches!(engine.delete_rule(&k, ""), Err(ProxyError::RuleNotFound)));
    }

    #[tokio::test]
    async fn delete_of_missing_bucket_fails() {
        let engine = ProxyEngine::new(EngineConfig::default(), None);
        let k = key(0);
        engine.add_rule(k, spec("", ProxyMode::Unicast, false, 1)).unwrap();
        assert!(matches!(
            engine.delete_rule(&k, "nope"),
            Err(ProxyError::BucketNotFound(_))
        ));
        engine.stop();
    }
}
