// portsplice/src/sniff.rs
//
// HTTP Host sniffer: an incremental recognizer fed with the first bytes of
// an ingress connection while it has no backends yet. It answers one
// question: which host bucket should this flow land in?
//
// Every feed re-parses the accumulated prefix, so a request head split
// across any number of reads is handled without parser state. The sniffed
// bytes are never consumed here; the caller keeps them staged and forwards
// them to the selected backend verbatim.
//
// A decision of `None` means "route via the catch-all bucket": non-HTTP
// traffic, a request without a Host header, a host too long to route on, or
// a head that did not complete within one receive buffer.

use crate::types::{MAX_HOST_LEN, RECV_BUF_LEN};

/// Most header lines the recognizer will consider before giving up.
const MAX_SNIFF_HEADERS: usize = 64;

/// Accumulation cap; a head that has not completed by now never will
/// (for our purposes) and the flow is routed via the catch-all.
const SNIFF_LIMIT: usize = RECV_BUF_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    /// The request head is incomplete; feed the next read.
    NeedMore,
    /// Routing decision: `Some(host)` for an exact bucket, `None` for the
    /// catch-all.
    Decided(Option<String>),
}

pub struct HostSniffer {
    buf: Vec<u8>,
}

impl HostSniffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Bytes accumulated so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Sniff {
        let room = SNIFF_LIMIT.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_SNIFF_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&self.buf) {
            Ok(httparse::Status::Complete(_)) => Sniff::Decided(host_of(req.headers)),
            Ok(httparse::Status::Partial) => {
                if self.buf.len() >= SNIFF_LIMIT {
                    Sniff::Decided(None)
                } else {
                    Sniff::NeedMore
                }
            }
            Err(_) => Sniff::Decided(None),
        }
    }
}

impl Default for HostSniffer {
    fn default() -> Self {
        Self::new()
    }
}

/// First Host header wins; an unroutable value (empty, oversized, non-UTF8)
/// falls back to the catch-all.
fn host_of(headers: &[httparse::Header<'_>]) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_HOST_LEN)
        .map(str::to_owned)
}
