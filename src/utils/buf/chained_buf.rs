use std::collections::VecDeque;

use tracing::trace;

pub const DEFAULT_BLK_LEN: usize = 2048;
const BLK_ALIGN: usize = 4;
const MIN_BLK_LEN: usize = 4;

#[derive(Debug)]
struct Blk {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Blk {
    #[inline]
    fn check_rep(&self) {
        assert!(self.head <= self.tail);
        assert!(self.tail <= self.buf.len());
    }

    fn new(cap: usize) -> Self {
        let this = Blk {
            buf: vec![0; cap].into_boxed_slice(),
            head: 0,
            tail: 0,
        };
        this.check_rep();
        this
    }

    #[inline]
    fn cap(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn data_len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    fn back_len(&self) -> usize {
        self.buf.len() - self.tail
    }

    #[inline]
    fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    /// Copies as much of `data` as fits behind the tail and returns the number of bytes written.
    #[inline]
    fn push(&mut self, data: &[u8]) -> usize {
        let len = usize::min(self.back_len(), data.len());
        self.buf[self.tail..self.tail + len].copy_from_slice(&data[..len]);
        self.tail += len;
        self.check_rep();
        len
    }

    #[inline]
    fn rewind(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

/// A byte queue made of a chain of fixed-capacity blocks.
///
/// Writes always land in the back block and reads always come from the front block.
/// A new block is linked whenever the back block runs out of room, so appending never
/// moves bytes that are already queued. [`ChainedBuf::pullup`] coalesces the chain
/// into one block when a contiguous view is needed.
///
/// There is always at least one block in the chain.
#[derive(Debug)]
pub struct ChainedBuf {
    blks: VecDeque<Blk>,
    len: usize,
    alloc_len: usize,
    blk_hint: usize,
}

impl ChainedBuf {
    #[inline]
    fn check_rep(&self) {
        assert!(!self.blks.is_empty());
        if cfg!(debug_assertions) {
            let mut cum_len = 0;
            let mut cum_cap = 0;
            for blk in &self.blks {
                blk.check_rep();
                cum_len += blk.data_len();
                cum_cap += blk.cap();
            }
            assert_eq!(cum_len, self.len);
            assert_eq!(cum_cap, self.alloc_len);
        }
    }

    /// `blk_hint` is the preferred block size; `0` selects [`DEFAULT_BLK_LEN`].
    pub fn new(blk_hint: usize) -> Self {
        let blk_hint = match blk_hint {
            0 => DEFAULT_BLK_LEN,
            x => x,
        };
        let mut this = ChainedBuf {
            blks: VecDeque::new(),
            len: 0,
            alloc_len: 0,
            blk_hint,
        };
        this.push_blk(blk_hint);
        this.check_rep();
        this
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity of all blocks in the chain.
    #[must_use]
    #[inline]
    pub fn alloc_len(&self) -> usize {
        self.alloc_len
    }

    #[must_use]
    #[inline]
    pub fn blk_count(&self) -> usize {
        self.blks.len()
    }

    #[must_use]
    #[inline]
    pub fn blk_hint(&self) -> usize {
        self.blk_hint
    }

    #[inline]
    fn aligned(len: usize) -> usize {
        let len = BLK_ALIGN * ((len + BLK_ALIGN - 1) / BLK_ALIGN);
        usize::max(len, MIN_BLK_LEN)
    }

    fn push_blk(&mut self, min_len: usize) -> &mut Blk {
        let cap = Self::aligned(usize::max(self.blk_hint, min_len));
        trace!(cap, blks = self.blks.len(), "link block");
        self.blks.push_back(Blk::new(cap));
        self.alloc_len += cap;
        let last = self.blks.len() - 1;
        &mut self.blks[last]
    }

    /// Appends `data`, filling the back block first and spilling the rest into a new block.
    pub fn append(&mut self, data: &[u8]) {
        let mut written = 0;
        if let Some(blk) = self.blks.back_mut() {
            written = blk.push(data);
        }
        let rest = &data[written..];
        if !rest.is_empty() {
            let blk = self.push_blk(rest.len());
            let pushed = blk.push(rest);
            assert_eq!(pushed, rest.len());
        }
        self.len += data.len();
        self.check_rep();
    }

    /// Reserves `len` contiguous bytes at the back of the queue for the caller to fill in.
    ///
    /// The region counts as queued data as soon as this returns.
    pub fn allocate(&mut self, len: usize) -> &mut [u8] {
        let fits = matches!(self.blks.back(), Some(blk) if len <= blk.back_len());
        if !fits {
            self.push_blk(len);
        }
        self.len += len;
        let last = self.blks.len() - 1;
        let blk = &mut self.blks[last];
        let start = blk.tail;
        blk.tail += len;
        blk.check_rep();
        &mut blk.buf[start..start + len]
    }

    /// Removes up to `len` bytes from the front.
    ///
    /// With `into`, the removed bytes are copied there and the amount is further bounded by
    /// `into.len()`. Without it, the bytes are discarded. Returns the number of bytes removed.
    pub fn consume(&mut self, mut into: Option<&mut [u8]>, len: usize) -> usize {
        let mut want = usize::min(len, self.len);
        if let Some(into) = &into {
            want = usize::min(want, into.len());
        }

        let mut done = 0;
        while done < want {
            let blk = match self.blks.front_mut() {
                Some(x) => x,
                None => break,
            };
            let n = usize::min(blk.data_len(), want - done);
            if let Some(into) = into.as_deref_mut() {
                into[done..done + n].copy_from_slice(&blk.data()[..n]);
            }
            blk.head += n;
            done += n;
            self.len -= n;
            self.release_drained_front();
        }
        self.release_drained_front();

        self.check_rep();
        done
    }

    /// Discards up to `len` bytes from the front and returns how many were discarded.
    #[inline]
    pub fn drain(&mut self, len: usize) -> usize {
        self.consume(None, len)
    }

    fn release_drained_front(&mut self) {
        while self.blks.len() > 1 {
            match self.blks.front() {
                Some(blk) if blk.data_len() == 0 => {}
                _ => break,
            }
            if let Some(blk) = self.blks.pop_front() {
                self.alloc_len -= blk.cap();
            }
        }
        if self.blks.len() == 1 && self.len == 0 {
            if let Some(blk) = self.blks.front_mut() {
                blk.rewind();
            }
        }
    }

    /// Returns every queued byte as one contiguous slice, coalescing the chain if needed.
    pub fn pullup(&mut self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        if self.blks.len() > 1 {
            self.blks.retain(|blk| blk.data_len() > 0);
        }
        if self.blks.len() > 1 {
            let mut merged = Blk::new(Self::aligned(self.len));
            for blk in self.blks.drain(..) {
                merged.push(blk.data());
            }
            trace!(len = self.len, cap = merged.cap(), "pullup");
            self.blks.push_back(merged);
        }
        self.alloc_len = self.blks.iter().map(|blk| blk.cap()).sum();
        self.check_rep();
        match self.blks.front() {
            Some(blk) => blk.data(),
            None => &[],
        }
    }

    /// Empties the queue.
    ///
    /// A single block at least `hint` bytes large is kept and rewound. Otherwise the chain is
    /// freed and rebuilt around one block sized to the larger of `hint` and the old capacity.
    pub fn reset(&mut self, hint: usize) {
        if self.blks.len() > 1 || hint > self.alloc_len {
            self.blk_hint = usize::max(hint, self.alloc_len);
            self.blks.clear();
            self.alloc_len = 0;
            let blk_hint = self.blk_hint;
            self.push_blk(blk_hint);
        } else if let Some(blk) = self.blks.front_mut() {
            blk.rewind();
        }
        self.len = 0;
        self.check_rep();
    }
}
