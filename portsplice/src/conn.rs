// portsplice/src/conn.rs
//
// Per-socket connection entry and the splice paths between paired entries.
//
// Every live socket (the client-facing ingress or one of its backend-facing
// egress peers) owns one `ConnEntry`. An ingress holds strong handles to
// its egress peers; each egress holds a weak back-reference to its ingress,
// so the whole flow is released when the ingress goes.
//
// Two tasks pump each entry:
//   reader: services read-readiness in bursts, drives the host sniffer and
//            backend selection on first ingress bytes, then multiplexes
//            chunks to the peer side
//   writer: parked until the egress queue goes non-empty, then drains it on
//            write-readiness; the queue is non-empty exactly while write
//            interest is held
//
// Teardown is idempotent (`closing`), shuts the socket both ways so the
// opposite pump observes a hangup, and propagates: an egress death takes its
// ingress with it, an ingress death takes every peer.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::OverflowPolicy;
use crate::engine::ProxyEngine;
use crate::queue::{Push, XmitQueue};
use crate::registry::{Bucket, Rule};
use crate::select;
use crate::sniff::{HostSniffer, Sniff};
use crate::tls::{Flush, IoVerdict, TlsSession};
use crate::types::{L4Proto, ProxyMode, SelectMode, TrafficStats, RECV_BUF_LEN, RX_BURST};

pub struct ConnEntry {
    pub id:    u64,
    pub rule:  Arc<Rule>,
    /// false = ingress (client side), true = egress (backend side).
    pub odir:  bool,
    pub stats: TrafficStats,

    sock:     TcpStream,
    tls:      Option<Mutex<TlsSession>>,
    queue:    Mutex<XmitQueue>,
    /// Signalled when the queue goes non-empty (or on teardown).
    wr_kick:  Notify,
    /// Signalled when the queue falls back under its ceiling.
    drained:  Notify,
    /// Egress peers of an ingress entry; empty until selection ran.
    peers:    RwLock<Vec<Arc<ConnEntry>>>,
    /// Ingress owner of an egress entry.
    paired:   OnceLock<Weak<ConnEntry>>,
    /// Endpoint slot credited with this entry's backend-side traffic.
    ep_slot:  Option<(Arc<Bucket>, usize)>,
    overflow: OverflowPolicy,
    closing:  AtomicBool,
    /// Sticky: a fatal TLS verdict happened; never drive the session again.
    ssl_err:  AtomicBool,
    /// Round-robin cursor for chunk selection across multiple peers.
    lsel:     AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    /// Queue empty and TLS backlog flushed.
    Idle,
    /// Socket refused more; keep write interest.
    Blocked,
    /// Transport or session is broken.
    Broken,
}

/// Result of handing a chunk to a peer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    /// Sent, or parked within the queue ceiling.
    Done,
    /// Parked over the ceiling; the reader must wait for drain.
    Pressured,
    /// The peer is unusable.
    Fatal,
}

impl ConnEntry {
    pub(crate) fn ingress(
        id: u64,
        rule: Arc<Rule>,
        sock: TcpStream,
        tls: Option<TlsSession>,
        queue_limit: usize,
        overflow: OverflowPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            rule,
            odir: false,
            stats: TrafficStats::new(),
            sock,
            tls: tls.map(Mutex::new),
            queue: Mutex::new(XmitQueue::new(queue_limit)),
            wr_kick: Notify::new(),
            drained: Notify::new(),
            peers: RwLock::new(Vec::new()),
            paired: OnceLock::new(),
            ep_slot: None,
            overflow,
            closing: AtomicBool::new(false),
            ssl_err: AtomicBool::new(false),
            lsel: AtomicUsize::new(0),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn egress(
        id: u64,
        rule: Arc<Rule>,
        sock: TcpStream,
        tls: Option<TlsSession>,
        bucket: Arc<Bucket>,
        ep_idx: usize,
        queue_limit: usize,
        overflow: OverflowPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            rule,
            odir: true,
            stats: TrafficStats::new(),
            sock,
            tls: tls.map(Mutex::new),
            queue: Mutex::new(XmitQueue::new(queue_limit)),
            wr_kick: Notify::new(),
            drained: Notify::new(),
            peers: RwLock::new(Vec::new()),
            paired: OnceLock::new(),
            ep_slot: Some((bucket, ep_idx)),
            overflow,
            closing: AtomicBool::new(false),
            ssl_err: AtomicBool::new(false),
            lsel: AtomicUsize::new(0),
        })
    }

    /// Cross-link an ingress with a freshly connected egress peer.
    pub(crate) fn link(ingress: &Arc<ConnEntry>, egress: &Arc<ConnEntry>) {
        let _ = egress.paired.set(Arc::downgrade(ingress));
        ingress.peers.write().push(egress.clone());
    }

    pub fn sock(&self) -> &TcpStream {
        &self.sock
    }

    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn peers_snapshot(&self) -> Vec<Arc<ConnEntry>> {
        self.peers.read().clone()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.read().is_empty()
    }

    /// Rule identifier of the bucket this (egress) entry was selected from.
    pub fn bucket_id(&self) -> Option<u32> {
        self.ep_slot.as_ref().map(|(b, _)| b.rule_id)
    }

    fn account_rx(&self, bytes: u64) {
        self.stats.add_rx(bytes);
        if let Some((bucket, idx)) = &self.ep_slot {
            bucket.ep_stats[*idx].add_rx(bytes);
        }
    }

    fn account_tx(&self, bytes: u64) {
        self.stats.add_tx(bytes);
        if let Some((bucket, idx)) = &self.ep_slot {
            bucket.ep_stats[*idx].add_tx(bytes);
        }
    }

    // ── Raw I/O ──────────────────────────────────────────────────────────────

    fn read_some(&self, buf: &mut [u8]) -> IoVerdict {
        match &self.tls {
            Some(tls) => {
                if self.ssl_err.load(Ordering::SeqCst) {
                    return IoVerdict::Fatal;
                }
                let verdict = tls.lock().read(&self.sock, buf);
                if verdict == IoVerdict::Fatal {
                    self.ssl_err.store(true, Ordering::SeqCst);
                }
                verdict
            }
            None => match self.sock.try_read(buf) {
                Ok(0) => IoVerdict::Closed,
                Ok(n) => IoVerdict::Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoVerdict::AgainRead,
                Err(_) => IoVerdict::Fatal,
            },
        }
    }

    fn write_raw(&self, data: &[u8]) -> IoVerdict {
        match &self.tls {
            Some(tls) => {
                if self.ssl_err.load(Ordering::SeqCst) {
                    return IoVerdict::Fatal;
                }
                let verdict = tls.lock().write(&self.sock, data);
                if verdict == IoVerdict::Fatal {
                    self.ssl_err.store(true, Ordering::SeqCst);
                }
                verdict
            }
            None => match self.sock.try_write(data) {
                Ok(n) => IoVerdict::Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoVerdict::AgainWrite,
                Err(_) => IoVerdict::Fatal,
            },
        }
    }

    fn tls_backlog(&self) -> bool {
        self.tls.as_ref().map(|t| t.lock().wants_flush()).unwrap_or(false)
    }

    fn queue_over_limit(&self) -> bool {
        self.queue.lock().over_limit()
    }

    // ── Egress queue drain ───────────────────────────────────────────────────

    fn drain_locked(&self, q: &mut XmitQueue) -> DrainState {
        loop {
            let Some(head) = q.head() else {
                // Queue drained; push any encrypted leftovers onto the wire.
                if let Some(tls) = &self.tls {
                    return match tls.lock().flush(&self.sock) {
                        Flush::Clear => DrainState::Idle,
                        Flush::Blocked => DrainState::Blocked,
                        Flush::Broken => {
                            self.ssl_err.store(true, Ordering::SeqCst);
                            DrainState::Broken
                        }
                    };
                }
                return DrainState::Idle;
            };
            match self.write_raw(&head) {
                IoVerdict::Ok(n) => {
                    self.account_tx(n as u64);
                    q.advance(n);
                }
                IoVerdict::AgainWrite | IoVerdict::AgainRead => return DrainState::Blocked,
                IoVerdict::Closed | IoVerdict::Fatal => return DrainState::Broken,
            }
        }
    }

    fn drain(&self) -> DrainState {
        let mut q = self.queue.lock();
        let state = self.drain_locked(&mut q);
        let relieved = !q.over_limit();
        drop(q);
        if relieved {
            self.drained.notify_waiters();
        }
        state
    }

    // ── Per-peer send path ───────────────────────────────────────────────────

    /// Queue-first ordering: anything already parked for this peer goes out
    /// before the new chunk, and the new chunk is parked whole if the drain
    /// blocks. One send attempt; the remainder is parked on a short count.
    fn try_send(&self, data: &[u8]) -> SendOutcome {
        if self.is_closing() {
            return SendOutcome::Fatal;
        }
        let mut q = self.queue.lock();
        if !q.is_empty() {
            match self.drain_locked(&mut q) {
                DrainState::Blocked => return self.park(&mut q, data),
                DrainState::Broken => return SendOutcome::Fatal,
                DrainState::Idle => {}
            }
        }
        match self.write_raw(data) {
            IoVerdict::Ok(n) => {
                self.account_tx(n as u64);
                if n < data.len() {
                    return self.park(&mut q, &data[n..]);
                }
                if self.tls_backlog() {
                    self.wr_kick.notify_one();
                }
                SendOutcome::Done
            }
            IoVerdict::AgainWrite | IoVerdict::AgainRead => self.park(&mut q, data),
            IoVerdict::Closed | IoVerdict::Fatal => SendOutcome::Fatal,
        }
    }

    fn park(&self, q: &mut XmitQueue, rest: &[u8]) -> SendOutcome {
        let was_empty = q.is_empty();
        let push = q.push(Bytes::copy_from_slice(rest));
        if was_empty {
            self.wr_kick.notify_one();
        }
        match push {
            Push::Queued => SendOutcome::Done,
            Push::Over => match self.overflow {
                OverflowPolicy::ReadPressure => SendOutcome::Pressured,
                OverflowPolicy::Drop => {
                    debug!("egress queue ceiling hit on conn {}, dropping flow", self.id);
                    SendOutcome::Fatal
                }
            },
        }
    }

    async fn feed_peer(&self, peer: &Arc<ConnEntry>, data: &[u8]) -> Result<(), ()> {
        match peer.try_send(data) {
            SendOutcome::Done => Ok(()),
            SendOutcome::Pressured => {
                // The chunk is parked; stall this reader until the peer
                // drains back under its ceiling.
                loop {
                    if peer.is_closing() {
                        return Err(());
                    }
                    if !peer.queue_over_limit() {
                        return Ok(());
                    }
                    let notified = peer.drained.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if peer.is_closing() {
                        return Err(());
                    }
                    if !peer.queue_over_limit() {
                        return Ok(());
                    }
                    notified.await;
                }
            }
            SendOutcome::Fatal => {
                peer.teardown();
                Err(())
            }
        }
    }

    /// Route one chunk to the opposite side of the flow.
    async fn forward(&self, data: &[u8]) -> Result<(), ()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.odir {
            let Some(ingress) = self.paired.get().and_then(Weak::upgrade) else {
                return Err(());
            };
            return self.feed_peer(&ingress, data).await;
        }

        let peers = self.peers.read().clone();
        if peers.is_empty() {
            return Err(());
        }
        match self.rule.mode {
            ProxyMode::Broadcast => {
                for peer in &peers {
                    self.feed_peer(peer, data).await?;
                }
                Ok(())
            }
            ProxyMode::Unicast => {
                let idx = if peers.len() > 1 {
                    self.lsel.fetch_add(1, Ordering::Relaxed) % peers.len()
                } else {
                    0
                };
                self.feed_peer(&peers[idx], data).await
            }
        }
    }

    // ── Pumps ────────────────────────────────────────────────────────────────

    pub(crate) async fn reader_task(self: Arc<Self>, engine: Arc<ProxyEngine>) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut staged = 0usize;
        let mut burst = 0usize;
        let mut sniffer = (!self.odir
            && self.rule.select == SelectMode::Host
            && self.rule.key.proto == L4Proto::Tcp
            && !self.has_peers())
        .then(HostSniffer::new);

        // Read first, wait second: a TLS session may hold plaintext decoded
        // during the handshake that no readiness event will announce.
        loop {
            if self.is_closing() {
                break;
            }
            if burst >= RX_BURST {
                // Burst bound reached; let other flows onto this worker.
                burst = 0;
                tokio::task::yield_now().await;
            }

            let n = match self.read_some(&mut buf[staged..]) {
                IoVerdict::Ok(n) => {
                    burst += 1;
                    n
                }
                IoVerdict::AgainRead => {
                    burst = 0;
                    if self.sock.readable().await.is_err() {
                        self.teardown();
                        break;
                    }
                    continue;
                }
                IoVerdict::AgainWrite => {
                    self.wr_kick.notify_one();
                    burst = 0;
                    if self.sock.writable().await.is_err() {
                        self.teardown();
                        break;
                    }
                    continue;
                }
                IoVerdict::Closed => {
                    trace!("conn {} closed by peer", self.id);
                    self.teardown();
                    break;
                }
                IoVerdict::Fatal => {
                    debug!("conn {} read failed", self.id);
                    self.teardown();
                    break;
                }
            };

            if !self.odir && !self.has_peers() {
                let host = match sniffer.as_mut() {
                    Some(s) => match s.feed(&buf[staged..staged + n]) {
                        Sniff::NeedMore if staged + n < buf.len() => {
                            staged += n;
                            continue;
                        }
                        // Receive buffer exhausted without a verdict.
                        Sniff::NeedMore => String::new(),
                        Sniff::Decided(host) => host.unwrap_or_default(),
                    },
                    None => String::new(),
                };
                if let Err(e) = select::establish(&engine, &self, &host).await {
                    debug!("backend setup failed on {}: {e}", self.rule.key);
                    self.teardown();
                    break;
                }
                sniffer = None;
                let total = staged + n;
                staged = 0;
                self.account_rx(total as u64);
                if self.forward(&buf[..total]).await.is_err() {
                    self.teardown();
                    break;
                }
                continue;
            }

            self.account_rx(n as u64);
            if self.forward(&buf[..n]).await.is_err() {
                self.teardown();
                break;
            }
        }
    }

    pub(crate) async fn writer_task(self: Arc<Self>) {
        loop {
            if self.is_closing() {
                break;
            }
            self.wr_kick.notified().await;
            if self.is_closing() {
                break;
            }
            loop {
                if self.sock.writable().await.is_err() {
                    self.teardown();
                    return;
                }
                match self.drain() {
                    DrainState::Idle => break,
                    DrainState::Blocked => continue,
                    DrainState::Broken => {
                        self.teardown();
                        return;
                    }
                }
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Idempotent. Shuts this socket both ways (the opposite pump sees a
    /// hangup), drops parked bytes, wakes both pumps, unlinks from the rule
    /// and propagates to the rest of the flow.
    pub(crate) fn teardown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("conn {} teardown (odir={})", self.id, self.odir);

        if let Some(tls) = &self.tls {
            if !self.ssl_err.load(Ordering::SeqCst) {
                tls.lock().close_notify(&self.sock);
            }
        }

        self.queue.lock().clear();
        self.wr_kick.notify_one();
        self.drained.notify_waiters();

        unsafe { libc::shutdown(self.sock.as_raw_fd(), libc::SHUT_RDWR) };

        if self.odir {
            if let Some(ingress) = self.paired.get().and_then(Weak::upgrade) {
                ingress.teardown();
            }
        } else {
            self.rule.conns.remove(&self.id);
            let peers = std::mem::take(&mut *self.peers.write());
            for peer in peers {
                peer.teardown();
            }
        }
    }
}

/// Start both pumps for an entry.
pub(crate) fn spawn_pumps(entry: &Arc<ConnEntry>, engine: &Arc<ProxyEngine>) {
    tokio::spawn(entry.clone().reader_task(engine.clone()));
    tokio::spawn(entry.clone().writer_task());
}
