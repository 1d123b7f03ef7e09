//! Chain-of-blocks byte buffer
//!
//! `MioBuffer` is the buffer the I/O core moves bytes through: a chain of
//! fixed-size blocks with a write cursor at the tail and a read cursor at
//! the front. The core fills it from a socket (read side) or drains it into
//! a socket (write side) via scatter/gather span lists; the user fills or
//! drains the opposite end from continuation callbacks.
//!
//! The buffer is shared by `Arc` between the user and the core and is
//! internally spin-locked. Span lists are only ever built and consumed
//! while the lock is held, so the raw pointers they carry never outlive
//! the blocks they point into.
//!
//! Block layout invariant: unread data occupies a prefix run of blocks,
//! write room a suffix run. `consume` pops exhausted front blocks and
//! `fill`/span-building only extend the tail, which preserves byte order.

use crate::spinlock::SpinLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Scatter/gather entries are capped at 16, the portable minimum for
/// readv/writev (POSIX 1003.1g 5.4.1.1).
pub const NET_MAX_IOV: usize = 16;

const DEFAULT_BLOCK_SIZE: usize = 4096;
const DEFAULT_MAX_SIZE: i64 = 256 * 1024;

/// One writable or readable span inside the block chain.
#[derive(Clone, Copy)]
pub struct IoSpan {
    pub ptr: *mut u8,
    pub len: usize,
}

struct Block {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Block {
    fn new(size: usize) -> Block {
        Block {
            data: vec![0u8; size].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    #[inline]
    fn read_avail(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    fn write_avail(&self) -> usize {
        self.data.len() - self.end
    }
}

struct BufInner {
    blocks: VecDeque<Block>,
    block_size: usize,
    max_size: i64,
    read_avail: i64,
}

impl BufInner {
    /// Drop exhausted front blocks; reset the last block when it is the
    /// only one and empty.
    fn compact(&mut self) {
        while self.blocks.len() > 1 {
            let front = self.blocks.front().unwrap();
            if front.read_avail() == 0 && front.write_avail() == 0 {
                self.blocks.pop_front();
            } else if front.read_avail() == 0 && self.front_is_behind_data() {
                // A drained front block with residual tail room would put
                // new bytes ahead of unread ones; drop it.
                self.blocks.pop_front();
            } else {
                break;
            }
        }
        if self.blocks.len() == 1 {
            let b = self.blocks.front_mut().unwrap();
            if b.read_avail() == 0 {
                b.start = 0;
                b.end = 0;
            }
        }
    }

    fn front_is_behind_data(&self) -> bool {
        self.blocks.iter().skip(1).any(|b| b.read_avail() > 0)
    }
}

/// A chained byte buffer with one read cursor and one write cursor.
pub struct MioBuffer {
    inner: SpinLock<BufInner>,
}

impl MioBuffer {
    /// New buffer with explicit block size and total capacity.
    pub fn with_sizes(block_size: usize, max_size: i64) -> Arc<MioBuffer> {
        assert!(block_size > 0 && max_size > 0);
        Arc::new(MioBuffer {
            inner: SpinLock::new(BufInner {
                blocks: VecDeque::new(),
                block_size,
                max_size,
                read_avail: 0,
            }),
        })
    }

    /// New buffer with the default 4 KiB blocks and 256 KiB capacity.
    pub fn new() -> Arc<MioBuffer> {
        Self::with_sizes(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_SIZE)
    }

    /// Bytes buffered and not yet consumed.
    pub fn read_avail(&self) -> i64 {
        self.inner.lock().read_avail
    }

    /// Room left before the capacity cap.
    pub fn write_avail(&self) -> i64 {
        let inner = self.inner.lock();
        inner.max_size - inner.read_avail
    }

    pub fn is_read_avail_more_than(&self, n: i64) -> bool {
        self.read_avail() > n
    }

    /// Commit `n` bytes previously written into spans handed out by
    /// `with_write_spans`. Advances the write cursor across the tail run.
    pub fn fill(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let mut left = n as usize;
        for b in inner.blocks.iter_mut() {
            if left == 0 {
                break;
            }
            let adv = left.min(b.write_avail());
            b.end += adv;
            left -= adv;
        }
        assert_eq!(left, 0, "fill past the allocated tail");
        inner.read_avail += n;
    }

    /// Discard `n` bytes from the front of the chain.
    pub fn consume(&self, n: i64) {
        if n <= 0 {
            return;
        }
        let mut inner = self.inner.lock();
        assert!(n <= inner.read_avail, "consume past read_avail");
        let mut left = n as usize;
        while left > 0 {
            let front = inner.blocks.front_mut().unwrap();
            let adv = left.min(front.read_avail());
            front.start += adv;
            left -= adv;
            if front.read_avail() == 0 && left > 0 {
                inner.blocks.pop_front();
            }
        }
        inner.read_avail -= n;
        inner.compact();
    }

    /// Build up to [`NET_MAX_IOV`] writable spans covering at most `limit`
    /// bytes, skipping the first `offset` bytes of write room (bytes a
    /// caller transferred in an earlier round but has not committed yet).
    /// Tail blocks are allocated as needed, up to the capacity cap. Runs
    /// `f` on the spans and returns `(r, attempted)` where `attempted` is
    /// the total span length offered and `r` is `f`'s return.
    ///
    /// `f` is called with the buffer lock held; it must not call back into
    /// this buffer. On success the caller commits with [`fill`].
    pub fn with_write_spans<F>(&self, offset: i64, limit: i64, f: F) -> (i64, i64)
    where
        F: FnOnce(&[IoSpan]) -> i64,
    {
        let mut inner = self.inner.lock();
        let offset = offset.max(0) as usize;
        let want = limit
            .min(inner.max_size - inner.read_avail - offset as i64)
            .max(0) as usize;
        if want == 0 {
            return (0, 0);
        }

        // Make sure the tail run can hold `offset + want` bytes.
        let mut room: usize = inner.blocks.iter().map(|b| b.write_avail()).sum();
        while room < offset + want {
            let bs = inner.block_size;
            inner.blocks.push_back(Block::new(bs));
            room += bs;
        }

        let mut spans = [IoSpan {
            ptr: std::ptr::null_mut(),
            len: 0,
        }; NET_MAX_IOV];
        let mut nspans = 0;
        let mut skip = offset;
        let mut attempted = 0usize;
        for b in inner.blocks.iter_mut() {
            if nspans == NET_MAX_IOV || attempted == want {
                break;
            }
            let mut avail = b.write_avail();
            let mut from = b.end;
            if avail == 0 {
                continue;
            }
            if skip > 0 {
                let s = skip.min(avail);
                from += s;
                avail -= s;
                skip -= s;
                if avail == 0 {
                    continue;
                }
            }
            let len = avail.min(want - attempted);
            spans[nspans] = IoSpan {
                // Safety: from + len <= data.len().
                ptr: unsafe { b.data.as_mut_ptr().add(from) },
                len,
            };
            nspans += 1;
            attempted += len;
        }

        let r = f(&spans[..nspans]);
        (r, attempted as i64)
    }

    /// Build up to [`NET_MAX_IOV`] readable spans covering at most `limit`
    /// bytes, skipping the first `offset` readable bytes. Returns
    /// `(r, attempted)`.
    ///
    /// Same locking contract as [`with_write_spans`]; on success the caller
    /// commits with [`consume`].
    pub fn with_read_spans<F>(&self, offset: i64, limit: i64, f: F) -> (i64, i64)
    where
        F: FnOnce(&[IoSpan]) -> i64,
    {
        let mut inner = self.inner.lock();
        let offset = offset.max(0) as usize;
        let want = limit.min(inner.read_avail - offset as i64).max(0) as usize;
        if want == 0 {
            return (0, 0);
        }

        let mut spans = [IoSpan {
            ptr: std::ptr::null_mut(),
            len: 0,
        }; NET_MAX_IOV];
        let mut nspans = 0;
        let mut skip = offset;
        let mut attempted = 0usize;
        for b in inner.blocks.iter_mut() {
            if nspans == NET_MAX_IOV || attempted == want {
                break;
            }
            let mut avail = b.read_avail();
            let mut from = b.start;
            if avail == 0 {
                continue;
            }
            if skip > 0 {
                let s = skip.min(avail);
                from += s;
                avail -= s;
                skip -= s;
                if avail == 0 {
                    continue;
                }
            }
            let len = avail.min(want - attempted);
            spans[nspans] = IoSpan {
                // Safety: from + len <= end <= data.len().
                ptr: unsafe { b.data.as_mut_ptr().add(from) },
                len,
            };
            nspans += 1;
            attempted += len;
        }

        let r = f(&spans[..nspans]);
        (r, attempted as i64)
    }

    /// User-side append. Copies as much of `data` as capacity allows and
    /// returns the number of bytes taken.
    pub fn write(&self, data: &[u8]) -> i64 {
        let mut written = 0i64;
        while (written as usize) < data.len() {
            let chunk = &data[written as usize..];
            let (r, _) = self.with_write_spans(0, chunk.len() as i64, |spans| {
                let mut copied = 0usize;
                for s in spans {
                    let n = s.len.min(chunk.len() - copied);
                    // Safety: span points at `n` writable bytes.
                    unsafe {
                        std::ptr::copy_nonoverlapping(chunk.as_ptr().add(copied), s.ptr, n);
                    }
                    copied += n;
                }
                copied as i64
            });
            if r <= 0 {
                break;
            }
            self.fill(r);
            written += r;
        }
        written
    }

    /// User-side drain. Copies up to `out.len()` bytes and consumes them.
    pub fn read(&self, out: &mut [u8]) -> i64 {
        let (r, _) = self.with_read_spans(0, out.len() as i64, |spans| {
            let mut copied = 0usize;
            for s in spans {
                let n = s.len.min(out.len() - copied);
                // Safety: span points at `n` readable bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(s.ptr, out.as_mut_ptr().add(copied), n);
                }
                copied += n;
            }
            copied as i64
        });
        if r > 0 {
            self.consume(r);
        }
        r
    }

    /// Drop all buffered data and blocks.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.blocks.clear();
        inner.read_avail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let buf = MioBuffer::new();
        assert_eq!(buf.write(b"HELLO"), 5);
        assert_eq!(buf.read_avail(), 5);
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out[..5], b"HELLO");
        assert_eq!(buf.read_avail(), 0);
    }

    #[test]
    fn test_multi_block_ordering() {
        let buf = MioBuffer::with_sizes(8, 1024);
        let data: Vec<u8> = (0..100u8).collect();
        assert_eq!(buf.write(&data), 100);
        // Partial consume, then append more; order must hold across blocks.
        let mut out = vec![0u8; 37];
        assert_eq!(buf.read(&mut out), 37);
        assert_eq!(out, (0..37u8).collect::<Vec<_>>());
        assert_eq!(buf.write(&[200, 201, 202]), 3);
        let mut rest = vec![0u8; 66];
        assert_eq!(buf.read(&mut rest), 66);
        let mut expect: Vec<u8> = (37..100u8).collect();
        expect.extend_from_slice(&[200, 201, 202]);
        assert_eq!(rest, expect);
    }

    #[test]
    fn test_span_count_capped() {
        // 1-byte blocks force one span per block; the list must cap at 16.
        let buf = MioBuffer::with_sizes(1, 1024);
        let (_, attempted) = buf.with_write_spans(0, 64, |spans| {
            assert_eq!(spans.len(), NET_MAX_IOV);
            0
        });
        assert_eq!(attempted, NET_MAX_IOV as i64);
    }

    #[test]
    fn test_capacity_cap() {
        let buf = MioBuffer::with_sizes(16, 32);
        assert_eq!(buf.write(&[0u8; 100]), 32);
        assert_eq!(buf.write_avail(), 0);
        buf.consume(10);
        assert_eq!(buf.write_avail(), 10);
    }

    #[test]
    fn test_fill_consume_accounting() {
        let buf = MioBuffer::with_sizes(8, 64);
        let (r, attempted) = buf.with_write_spans(0, 20, |spans| {
            let mut n = 0;
            for s in spans {
                unsafe { std::ptr::write_bytes(s.ptr, 0xAB, s.len) };
                n += s.len;
            }
            n as i64
        });
        assert_eq!(r, attempted);
        buf.fill(r);
        assert_eq!(buf.read_avail(), 20);
        assert!(buf.is_read_avail_more_than(19));
        assert!(!buf.is_read_avail_more_than(20));
        buf.consume(20);
        assert_eq!(buf.read_avail(), 0);
    }

    #[test]
    fn test_offset_spans() {
        // Two uncommitted rounds must cover disjoint regions, and a single
        // fill must commit both.
        let buf = MioBuffer::with_sizes(8, 64);
        let (r1, a1) = buf.with_write_spans(0, 10, |spans| {
            let mut n = 0;
            for s in spans {
                unsafe { std::ptr::write_bytes(s.ptr, 1, s.len) };
                n += s.len;
            }
            n as i64
        });
        assert_eq!(r1, a1);
        let (r2, _) = buf.with_write_spans(r1, 10, |spans| {
            let mut n = 0;
            for s in spans {
                unsafe { std::ptr::write_bytes(s.ptr, 2, s.len) };
                n += s.len;
            }
            n as i64
        });
        buf.fill(r1 + r2);
        let mut out = vec![0u8; (r1 + r2) as usize];
        assert_eq!(buf.read(&mut out), r1 + r2);
        assert!(out[..r1 as usize].iter().all(|&b| b == 1));
        assert!(out[r1 as usize..].iter().all(|&b| b == 2));

        // Read side: offset skips bytes already transferred.
        buf.write(&[9, 8, 7, 6, 5]);
        let (got, _) = buf.with_read_spans(2, 3, |spans| {
            let mut v = Vec::new();
            for s in spans {
                v.extend_from_slice(unsafe { std::slice::from_raw_parts(s.ptr, s.len) });
            }
            assert_eq!(v, vec![7, 6, 5]);
            v.len() as i64
        });
        assert_eq!(got, 3);
    }

    #[test]
    fn test_clear() {
        let buf = MioBuffer::new();
        buf.write(b"data");
        buf.clear();
        assert_eq!(buf.read_avail(), 0);
        assert_eq!(buf.write(b"more"), 4);
    }
}
