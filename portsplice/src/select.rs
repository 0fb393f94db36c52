// portsplice/src/select.rs
//
// Backend selection and setup for a new flow.
//
// Unicast rules pick one endpoint round-robin from the sniffed host's bucket
// (catch-all fallback) and open exactly one backend connection; broadcast
// rules attempt every endpoint and keep the ones that answer. Connects are
// non-blocking with a 500ms deadline, get TCP_NODELAY, pass through the
// descriptor remapper, and (on unicast TLS-origination rules) complete the
// client handshake before the flow is linked.
//
// A selection failure is final for the flow: the ingress is shut down and
// the client may reconnect. The rule and its listener are untouched.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::conn::{self, ConnEntry};
use crate::engine::ProxyEngine;
use crate::error::ProxyError;
use crate::fdmap;
use crate::tls::TlsSession;
use crate::types::{Endpoint, L4Proto, ProxyMode};

/// How long a backend connect may take before it counts as unreachable.
pub const CONNECT_DEADLINE: Duration = Duration::from_millis(500);

/// Open backends for `ingress` according to its rule and the sniffed host.
/// Returns how many peers were linked.
pub(crate) async fn establish(
    engine: &Arc<ProxyEngine>,
    ingress: &Arc<ConnEntry>,
    host: &str,
) -> Result<usize, ProxyError> {
    let rule = ingress.rule.clone();
    let bucket = rule.bucket(host).ok_or(ProxyError::NoEndpoint)?;

    match rule.mode {
        ProxyMode::Unicast => {
            let idx = bucket.next_index();
            let ep = bucket.eps[idx];
            let sock = connect_backend(engine, &ep).await.map_err(|e| {
                debug!("connect {} failed: {e}", ep);
                ProxyError::NoEndpoint
            })?;

            let tls = match &rule.tls_connect {
                Some(config) => {
                    let name = if host.is_empty() { ep.ip.to_string() } else { host.to_string() };
                    let mut session = TlsSession::client(config.clone(), &name)?;
                    session.connect(&sock).await.map_err(|e| {
                        debug!("tls connect {} failed: {e}", ep);
                        e
                    })?;
                    Some(session)
                }
                None => None,
            };

            let egress = ConnEntry::egress(
                engine.next_conn_id(),
                rule.clone(),
                sock,
                tls,
                bucket.clone(),
                idx,
                engine.cfg().queue_limit,
                engine.cfg().overflow,
            );
            ConnEntry::link(ingress, &egress);
            trace!("flow {} -> {} (slot {idx})", ingress.id, ep);

            if rule.key.proto == L4Proto::Tcp && ep.proto == L4Proto::Tcp {
                engine.notify_sockmap(ingress, &egress);
            }

            conn::spawn_pumps(&egress, engine);
            Ok(1)
        }

        ProxyMode::Broadcast => {
            let mut linked = 0usize;
            for (idx, ep) in bucket.eps.iter().enumerate() {
                let sock = match connect_backend(engine, ep).await {
                    Ok(sock) => sock,
                    Err(e) => {
                        warn!("broadcast backend {} unreachable: {e}", ep);
                        continue;
                    }
                };
                let egress = ConnEntry::egress(
                    engine.next_conn_id(),
                    rule.clone(),
                    sock,
                    None,
                    bucket.clone(),
                    idx,
                    engine.cfg().queue_limit,
                    engine.cfg().overflow,
                );
                ConnEntry::link(ingress, &egress);
                conn::spawn_pumps(&egress, engine);
                linked += 1;
            }
            if linked == 0 {
                return Err(ProxyError::NoEndpoint);
            }
            trace!("flow {} fanned out to {linked} backend(s)", ingress.id);
            Ok(linked)
        }
    }
}

async fn connect_backend(engine: &Arc<ProxyEngine>, ep: &Endpoint) -> io::Result<TcpStream> {
    let addr = ep.addr();
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    let stream = timeout(CONNECT_DEADLINE, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend connect timed out"))??;
    stream.set_nodelay(true)?;
    fdmap::remap_stream(engine.fdmapper(), stream, true)
}
