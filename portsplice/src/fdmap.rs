// portsplice/src/fdmap.rs
//
// Descriptor remapper: relocates freshly accepted/connected sockets into a
// reserved descriptor window so a slot-indexed consumer (kernel sockmap
// offload) can address them densely. Each worker window is probed linearly
// from a scrambled start; in-use detection asks the OS (`fcntl(F_GETFD)`)
// rather than any local table, so descriptors opened by other subsystems are
// skipped correctly.
//
// Remapping is a deployment choice. When no window is configured the mapper
// is absent and every descriptor passes through unchanged.

use std::cell::Cell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use tracing::warn;

use crate::config::RemapConfig;

/// Probes attempted inside a window before giving up on relocation.
pub const ALLOC_RETRIES: u16 = 100;

struct Window {
    start: u16,
    end:   u16,
    next:  AtomicU16,
}

pub struct FdMapper {
    windows: Vec<Window>,
    assign:  AtomicUsize,
}

thread_local! {
    static WORKER_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn fd_in_use(fd: RawFd) -> bool {
    // F_GETFD succeeds for any open descriptor; EBADF is the only negative
    // answer that means "free".
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::EBADF)
}

impl FdMapper {
    pub fn new(cfg: &RemapConfig) -> Self {
        let mut windows = Vec::with_capacity(cfg.workers.max(1));
        let mut start = cfg.start;
        for _ in 0..cfg.workers.max(1) {
            windows.push(Window {
                start,
                end:  start + cfg.span,
                next: AtomicU16::new(start),
            });
            start += cfg.span + ALLOC_RETRIES;
        }
        Self { windows, assign: AtomicUsize::new(0) }
    }

    fn window(&self) -> &Window {
        let slot = WORKER_SLOT.with(|s| match s.get() {
            Some(i) => i,
            None => {
                let i = self.assign.fetch_add(1, Ordering::Relaxed) % self.windows.len();
                s.set(Some(i));
                i
            }
        });
        &self.windows[slot % self.windows.len()]
    }

    fn in_any_window(&self, fd: RawFd) -> bool {
        self.windows
            .iter()
            .any(|w| fd >= w.start as RawFd && fd < w.end as RawFd)
    }

    /// Relocate `fd` into this worker's window. With `keep_in_window` set,
    /// a descriptor that already sits inside a window is left alone.
    /// On probe exhaustion or `dup2` failure the original descriptor is
    /// returned unchanged.
    pub fn remap(&self, fd: OwnedFd, keep_in_window: bool) -> OwnedFd {
        if keep_in_window && self.in_any_window(fd.as_raw_fd()) {
            return fd;
        }

        let win = self.window();
        let span = win.end - win.start;
        // Scramble the probe start so consecutive remaps spread out.
        let mut probe = win.start + win.next.fetch_add(31, Ordering::Relaxed) % span;

        for _ in 0..ALLOC_RETRIES {
            probe += 1;
            if probe >= win.end {
                probe = win.start;
            }
            if fd_in_use(probe as RawFd) {
                continue;
            }
            let src = fd.as_raw_fd();
            if unsafe { libc::dup2(src, probe as RawFd) } < 0 {
                warn!("fdmap: dup2({src} -> {probe}) failed");
                return fd;
            }
            // `fd` drops here and closes the source descriptor.
            return unsafe { OwnedFd::from_raw_fd(probe as RawFd) };
        }

        warn!("fdmap: no free slot for fd {} after {ALLOC_RETRIES} probes", fd.as_raw_fd());
        fd
    }

    /// Remap a tokio stream by round-tripping through its std form.
    pub fn remap_stream(
        &self,
        sock: tokio::net::TcpStream,
        keep_in_window: bool,
    ) -> std::io::Result<tokio::net::TcpStream> {
        let std_sock = sock.into_std()?;
        let fd = self.remap(OwnedFd::from(std_sock), keep_in_window);
        let std_sock = std::net::TcpStream::from(fd);
        std_sock.set_nonblocking(true)?;
        tokio::net::TcpStream::from_std(std_sock)
    }
}

/// Convenience for call sites holding an optional mapper.
pub fn remap_stream(
    mapper: Option<&FdMapper>,
    sock: tokio::net::TcpStream,
    keep_in_window: bool,
) -> std::io::Result<tokio::net::TcpStream> {
    match mapper {
        Some(m) => m.remap_stream(sock, keep_in_window),
        None => Ok(sock),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn mapper(start: u16, span: u16) -> FdMapper {
        FdMapper::new(&RemapConfig { start, span, workers: 1 })
    }

    #[test]
    fn relocates_into_window() {
        let m = mapper(700, 50);
        let (a, b) = UnixStream::pair().unwrap();
        let fd = m.remap(OwnedFd::from(a), false);
        let raw = fd.as_raw_fd();
        assert!((700..750).contains(&raw), "fd {raw} not in window");

        // The relocated descriptor still carries the stream.
        let mut a = UnixStream::from(fd);
        let mut b2 = b;
        a.write_all(b"ping").unwrap();
        let mut out = [0u8; 4];
        b2.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ping");
    }

    #[test]
    fn in_window_descriptor_kept_when_asked() {
        let m = mapper(760, 40);
        let (a, _b) = UnixStream::pair().unwrap();
        let moved = m.remap(OwnedFd::from(a), false);
        let raw = moved.as_raw_fd();
        assert!((760..800).contains(&raw));

        // Second pass with keep_in_window leaves it where it is.
        let kept = m.remap(moved, true);
        assert_eq!(kept.as_raw_fd(), raw);
    }

    #[test]
    fn occupied_slots_are_probed_past() {
        let m = mapper(820, 30);
        let (a, _b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        let first  = m.remap(OwnedFd::from(a), false);
        let second = m.remap(OwnedFd::from(c), false);
        assert_ne!(first.as_raw_fd(), second.as_raw_fd());
        assert!((820..850).contains(&second.as_raw_fd()));
    }
}
