// src/sendq.rs
//
// Per-connection outbound queue: an ordered list of pooled buffer references
// and file extents, drained with batched sendmsg (MSG_ZEROCOPY when the
// batch is worth it) or sendfile. Buffers enrolled in an in-flight zero-copy
// operation are parked on a pending list until the kernel reports the
// matching completion on the socket error queue.
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

// Not exposed by the `libc` crate; values from Linux's <linux/errqueue.h>.
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

use log::debug;
use nix::errno::Errno;

use crate::pool::BufferRef;
use crate::util::now_ms;

const SENDQ_MAX_IOV: usize = 64;
const ZC_MIN_BATCH_BYTES: usize = 8 * 1024;
const FLUSH_THRESHOLD_BYTES: usize = 16 * 1024;
const FLUSH_DEADLINE_MS: i64 = 100;

pub enum SendItem {
    Buf(BufferRef),
    #[allow(dead_code)]
    File { fd: OwnedFd, offset: i64, remaining: usize },
}

struct ZcPending {
    lo: u32,
    hi: u32,
    _bufs: Vec<BufferRef>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Progressed,
    WouldBlock,
    Fatal,
}

pub struct SendQueue {
    items: VecDeque<SendItem>,
    pending: VecDeque<ZcPending>,
    num_queued: usize, // buffer items only
    queued_bytes: usize,
    zc_enabled: bool,
    zc_next_seq: u32,
    oldest_queued_ms: Option<i64>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            pending: VecDeque::new(),
            num_queued: 0,
            queued_bytes: 0,
            zc_enabled: false,
            zc_next_seq: 0,
            oldest_queued_ms: None,
        }
    }

    pub fn set_zerocopy(&mut self, enabled: bool) {
        self.zc_enabled = enabled;
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn queued_buffers(&self) -> usize {
        self.num_queued
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn queue_buf(&mut self, buf: BufferRef) {
        if buf.is_empty() {
            return;
        }
        if self.items.is_empty() {
            self.oldest_queued_ms = Some(now_ms());
        }
        self.queued_bytes += buf.len();
        self.num_queued += 1;
        self.items.push_back(SendItem::Buf(buf));
    }

    /// Append a file extent, transmitted with sendfile. Used by collaborators
    /// that hand over tmpfs fds (snapshot JPEGs, fetched payloads).
    #[allow(dead_code)]
    pub fn queue_file(&mut self, fd: OwnedFd, offset: i64, len: usize) {
        if len == 0 {
            return;
        }
        if self.items.is_empty() {
            self.oldest_queued_ms = Some(now_ms());
        }
        self.queued_bytes += len;
        self.items.push_back(SendItem::File { fd, offset, remaining: len });
    }

    /// Flush gate: buffered bytes over the threshold, or the head of the
    /// queue has been waiting past the deadline. Used to decide when to arm
    /// writable interest, so small control responses still batch.
    pub fn should_flush(&self, now: i64) -> bool {
        if self.items.is_empty() {
            return false;
        }
        if self.queued_bytes >= FLUSH_THRESHOLD_BYTES {
            return true;
        }
        match self.oldest_queued_ms {
            Some(t) => now - t >= FLUSH_DEADLINE_MS,
            None => false,
        }
    }

    /// Drain as much as possible. Byte order on the wire is exactly queue
    /// order; partial sends advance the head item in place.
    pub fn send(&mut self, fd: RawFd) -> SendOutcome {
        let mut progressed = false;
        loop {
            let head_is_file = match self.items.front() {
                None => break,
                Some(SendItem::File { .. }) => true,
                Some(SendItem::Buf(_)) => false,
            };
            let outcome = if head_is_file { self.send_file(fd) } else { self.send_bufs(fd) };
            match outcome {
                SendOutcome::Progressed => progressed = true,
                SendOutcome::WouldBlock => {
                    return if progressed { SendOutcome::Progressed } else { SendOutcome::WouldBlock };
                }
                SendOutcome::Fatal => return SendOutcome::Fatal,
            }
        }
        if self.items.is_empty() {
            self.oldest_queued_ms = None;
        }
        SendOutcome::Progressed
    }

    fn send_file(&mut self, fd: RawFd) -> SendOutcome {
        let (file_fd, mut off, remaining) = match self.items.front() {
            Some(SendItem::File { fd: f, offset, remaining }) => (f.as_raw_fd(), *offset, *remaining),
            _ => return SendOutcome::Progressed,
        };
        let n = unsafe { libc::sendfile(fd, file_fd, &mut off as *mut libc::off_t, remaining) };
        if n < 0 {
            let err = Errno::last();
            if err == Errno::EAGAIN || err == Errno::EINTR {
                return SendOutcome::WouldBlock;
            }
            return SendOutcome::Fatal;
        }
        let sent = n as usize;
        self.queued_bytes -= sent;
        let (done, leftover) = match self.items.front_mut() {
            Some(SendItem::File { offset, remaining, .. }) => {
                *offset += sent as i64;
                *remaining -= sent;
                if *remaining == 0 {
                    (true, 0)
                } else if sent == 0 {
                    // EOF before the advertised extent; drop the item
                    // rather than spin on it.
                    (true, *remaining)
                } else {
                    (false, 0)
                }
            }
            _ => (false, 0),
        };
        if done {
            self.queued_bytes -= leftover;
            self.items.pop_front();
        }
        SendOutcome::Progressed
    }

    fn send_bufs(&mut self, fd: RawFd) -> SendOutcome {
        // Assemble a batch of contiguous buffer items from the head.
        let mut batch_refs: Vec<BufferRef> = Vec::with_capacity(SENDQ_MAX_IOV);
        let mut lens: Vec<usize> = Vec::with_capacity(SENDQ_MAX_IOV);
        for item in self.items.iter() {
            match item {
                SendItem::Buf(b) => {
                    batch_refs.push(b.clone());
                    lens.push(b.len());
                    if batch_refs.len() == SENDQ_MAX_IOV {
                        break;
                    }
                }
                SendItem::File { .. } => break, // never mixed with buffer iovecs
            }
        }
        let total: usize = lens.iter().sum();
        let use_zc = self.zc_enabled && total >= ZC_MIN_BATCH_BYTES;

        let n = {
            let borrows: Vec<_> = batch_refs.iter().map(|b| b.payload()).collect();
            let mut iov: Vec<libc::iovec> = borrows
                .iter()
                .map(|p| libc::iovec {
                    iov_base: p.as_ptr() as *mut libc::c_void,
                    iov_len: p.len(),
                })
                .collect();
            let mut mh: libc::msghdr = unsafe { std::mem::zeroed() };
            mh.msg_iov = iov.as_mut_ptr();
            mh.msg_iovlen = iov.len();
            let mut flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
            if use_zc {
                flags |= libc::MSG_ZEROCOPY;
            }
            unsafe { libc::sendmsg(fd, &mh, flags) }
        };

        if n < 0 {
            let err = Errno::last();
            if err == Errno::EAGAIN || err == Errno::EINTR {
                return SendOutcome::WouldBlock;
            }
            return SendOutcome::Fatal;
        }
        let sent = n as usize;
        if sent == 0 {
            return SendOutcome::WouldBlock;
        }

        if use_zc {
            // One notification sequence per accepted MSG_ZEROCOPY sendmsg.
            // Hold references to every buffer the kernel may still be
            // reading until the completion for this sequence arrives.
            let mut covered = 0usize;
            let mut acc = 0usize;
            for l in &lens {
                covered += 1;
                acc += l;
                if acc >= sent {
                    break;
                }
            }
            batch_refs.truncate(covered);
            let seq = self.zc_next_seq;
            self.zc_next_seq = self.zc_next_seq.wrapping_add(1);
            self.pending.push_back(ZcPending { lo: seq, hi: seq, _bufs: batch_refs });
        }

        // Consume sent bytes from the head of the queue.
        let mut left = sent;
        self.queued_bytes -= sent;
        while left > 0 {
            let done = match self.items.front() {
                Some(SendItem::Buf(b)) => {
                    let l = b.len();
                    if left >= l {
                        left -= l;
                        true
                    } else {
                        b.advance(left);
                        left = 0;
                        false
                    }
                }
                _ => break,
            };
            if done {
                self.items.pop_front();
                self.num_queued -= 1;
            }
        }
        SendOutcome::Progressed
    }

    /// Drop every pending entry whose notification sequence falls inside
    /// `[lo, hi]`. `copied` is the kernel's hint that zero-copy degraded to
    /// an internal copy; further sends on this socket stop asking for it.
    pub fn on_completion(&mut self, lo: u32, hi: u32, copied: bool) {
        if copied && self.zc_enabled {
            debug!("zerocopy: kernel copied, disabling MSG_ZEROCOPY for this connection");
            self.zc_enabled = false;
        }
        self.pending
            .retain(|p| !(seq32_ge(p.lo, lo) && seq32_ge(hi, p.hi)));
    }

    /// Drain the socket error queue for zero-copy completion ranges.
    pub fn reap_completions(&mut self, fd: RawFd) {
        loop {
            let mut cmsg_space = [0u8; 128];
            let mut mh: libc::msghdr = unsafe { std::mem::zeroed() };
            mh.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
            mh.msg_controllen = cmsg_space.len();
            let n = unsafe { libc::recvmsg(fd, &mut mh, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
            if n < 0 {
                return;
            }
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&mh);
                while !cmsg.is_null() {
                    let lvl = (*cmsg).cmsg_level;
                    let ty = (*cmsg).cmsg_type;
                    let is_recverr = (lvl == libc::SOL_IP && ty == libc::IP_RECVERR)
                        || (lvl == libc::SOL_IPV6 && ty == libc::IPV6_RECVERR);
                    if is_recverr {
                        let ee = libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err;
                        if (*ee).ee_errno == 0 && (*ee).ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                            let copied = (*ee).ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0;
                            self.on_completion((*ee).ee_info, (*ee).ee_data, copied);
                        }
                    }
                    cmsg = libc::CMSG_NXTHDR(&mh, cmsg);
                }
            }
        }
    }

    pub fn cleanup(&mut self) {
        self.items.clear();
        self.pending.clear();
        self.num_queued = 0;
        self.queued_bytes = 0;
        self.oldest_queued_ms = None;
    }
}

/// Wrapping u32 compare for completion sequence ranges.
#[inline]
fn seq32_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn pool() -> BufferPool {
        BufferPool::new(64, 128, 8, 32)
    }

    fn buf_with(pool: &BufferPool, data: &[u8]) -> BufferRef {
        let b = pool.alloc().unwrap();
        b.copy_from(data);
        b
    }

    #[test]
    fn queue_accounting() {
        let p = pool();
        let mut q = SendQueue::new();
        assert!(q.is_empty());
        q.queue_buf(buf_with(&p, &[0u8; 100]));
        q.queue_buf(buf_with(&p, &[0u8; 50]));
        assert_eq!(q.queued_buffers(), 2);
        assert_eq!(q.queued_bytes(), 150);
    }

    #[test]
    fn empty_buffers_are_ignored() {
        let p = pool();
        let mut q = SendQueue::new();
        q.queue_buf(p.alloc().unwrap());
        assert!(q.is_empty());
    }

    #[test]
    fn flush_gate_by_bytes() {
        let p = pool();
        let mut q = SendQueue::new();
        let now = now_ms();
        q.queue_buf(buf_with(&p, &[0u8; 512]));
        assert!(!q.should_flush(now));
        for _ in 0..32 {
            q.queue_buf(buf_with(&p, &[0u8; 1024]));
        }
        assert!(q.should_flush(now));
    }

    #[test]
    fn flush_gate_by_deadline() {
        let p = pool();
        let mut q = SendQueue::new();
        q.queue_buf(buf_with(&p, &[0u8; 8]));
        let now = now_ms();
        assert!(!q.should_flush(now));
        assert!(q.should_flush(now + FLUSH_DEADLINE_MS + 1));
    }

    #[test]
    fn completion_releases_pending_range() {
        let p = pool();
        let mut q = SendQueue::new();
        // Manufacture pending entries as if three zero-copy sends happened.
        for seq in 0..3u32 {
            q.pending.push_back(ZcPending { lo: seq, hi: seq, _bufs: vec![buf_with(&p, &[1])] });
        }
        assert!(q.has_pending());
        q.on_completion(0, 1, false);
        assert_eq!(q.pending.len(), 1);
        q.on_completion(2, 2, false);
        assert!(!q.has_pending());
    }

    #[test]
    fn copied_completion_disables_zerocopy() {
        let mut q = SendQueue::new();
        q.set_zerocopy(true);
        q.on_completion(0, 0, true);
        assert!(!q.zc_enabled);
    }

    #[test]
    fn pending_holds_buffer_refs_alive() {
        let p = pool();
        let mut q = SendQueue::new();
        let free_before = p.stats().num_free;
        let b = buf_with(&p, &[1, 2, 3]);
        q.pending.push_back(ZcPending { lo: 0, hi: 0, _bufs: vec![b] });
        assert_eq!(p.stats().num_free, free_before - 1);
        q.on_completion(0, 0, false);
        assert_eq!(p.stats().num_free, free_before);
    }

    #[test]
    fn send_over_loopback_preserves_order() {
        use std::io::Read;
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();

        let p = pool();
        let mut q = SendQueue::new();
        q.queue_buf(buf_with(&p, b"hello "));
        q.queue_buf(buf_with(&p, b"stream "));
        q.queue_buf(buf_with(&p, b"world"));
        assert_eq!(q.send(client.as_raw_fd()), SendOutcome::Progressed);
        assert!(q.is_empty());

        let mut got = [0u8; 64];
        let n = server.read(&mut got).unwrap();
        assert_eq!(&got[..n], b"hello stream world");
    }

    #[test]
    fn file_extent_follows_buffers_in_order() {
        use std::fs::File;
        use std::io::{Read, Write};
        use std::net::{TcpListener, TcpStream};

        let path = std::env::temp_dir().join("rtpgate-test-sendq-extent");
        File::create(&path).unwrap().write_all(b"file body").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();

        let p = pool();
        let mut q = SendQueue::new();
        q.queue_buf(buf_with(&p, b"headers\r\n\r\n"));
        let file = File::open(&path).unwrap();
        q.queue_file(file.into(), 0, 9);
        assert_eq!(q.queued_bytes(), 11 + 9);

        assert_eq!(q.send(client.as_raw_fd()), SendOutcome::Progressed);
        assert!(q.is_empty());
        assert_eq!(q.queued_bytes(), 0);

        let mut got = Vec::new();
        let mut tmp = [0u8; 64];
        while got.len() < 20 {
            let n = server.read(&mut tmp).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&tmp[..n]);
        }
        assert_eq!(&got[..], b"headers\r\n\r\nfile body");
        std::fs::remove_file(&path).ok();
    }
}
