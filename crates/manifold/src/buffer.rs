use std::{
    fmt,
    io::IoSlice,
    sync::{Arc, Mutex, Weak},
};

use manifold_utils::safe_assert;

/// Scatter/gather cap applied when the caller does not supply one. Matches
/// the portable floor of IOV_MAX across the supported platforms.
pub const MAX_BUFFERS_PER_SEND: usize = 64;

/// Byte and buffer caps applied while flattening queue entries into one
/// scatter/gather syscall. Zero means unlimited (buffers still fall back to
/// [`MAX_BUFFERS_PER_SEND`]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GatherLimits {
    pub max_buffers: usize,
    pub max_bytes: usize,
}

impl GatherLimits {
    #[inline]
    pub fn effective_max_buffers(&self) -> usize {
        if self.max_buffers == 0 { MAX_BUFFERS_PER_SEND } else { self.max_buffers }
    }
}

/// Recycles fixed-size segments so the receive hot path does not allocate
/// per read.
#[derive(Clone)]
pub struct BlobPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    segment_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BlobPool {
    pub fn new(segment_size: usize) -> Self {
        Self { shared: Arc::new(PoolShared { segment_size, free: Mutex::new(Vec::new()) }) }
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.shared.segment_size
    }

    /// Takes a recycled segment, or allocates when the free list is empty.
    pub fn segment(&self) -> Segment {
        let storage = self
            .shared
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0_u8; self.shared.segment_size].into_boxed_slice());
        Segment { storage, len: 0, pool: Some(Arc::downgrade(&self.shared)) }
    }

    /// Number of segments currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.shared.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

impl PoolShared {
    fn recycle(&self, storage: Box<[u8]>) {
        if storage.len() == self.segment_size {
            self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(storage);
        }
    }
}

impl fmt::Debug for BlobPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobPool")
            .field("segment_size", &self.shared.segment_size)
            .field("idle", &self.idle())
            .finish()
    }
}

/// One contiguous byte run, optionally owned by a pool. The segment returns
/// its storage to the pool on drop.
pub struct Segment {
    storage: Box<[u8]>,
    len: usize,
    pool: Option<Weak<PoolShared>>,
}

impl Segment {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { storage: vec![0_u8; capacity].into_boxed_slice(), len: 0, pool: None }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self { storage: bytes.to_vec().into_boxed_slice(), len: bytes.len(), pool: None }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.storage.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Unfilled tail for the next read syscall.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.len..]
    }

    /// Marks `n` bytes of the spare region as filled.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        safe_assert!(self.len + n <= self.storage.len(), "advance past segment capacity");
        self.len += n;
    }

    /// Truncates the filled region to the first `n` bytes.
    #[inline]
    pub fn truncate(&mut self, n: usize) {
        self.len = self.len.min(n);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            pool.recycle(std::mem::take(&mut self.storage));
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}

/// Segmented owned byte sequence: an ordered run of [`Segment`]s.
#[derive(Debug, Default)]
pub struct Blob {
    segments: Vec<Segment>,
    len: usize,
}

impl Blob {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_segment(&mut self, segment: Segment) {
        self.len += segment.len();
        self.segments.push(segment);
    }

    /// Appends bytes, filling the last segment's spare capacity before
    /// drawing fresh segments from `pool` (or plain allocations without one).
    pub fn extend_from_slice(&mut self, mut bytes: &[u8], pool: Option<&BlobPool>) {
        self.len += bytes.len();

        if let Some(last) = self.segments.last_mut() {
            let spare = last.spare_mut();
            let take = spare.len().min(bytes.len());
            spare[..take].copy_from_slice(&bytes[..take]);
            last.advance(take);
            bytes = &bytes[take..];
        }

        while !bytes.is_empty() {
            let mut segment = match pool {
                Some(pool) => pool.segment(),
                None => Segment::with_capacity(bytes.len()),
            };
            let spare = segment.spare_mut();
            let take = spare.len().min(bytes.len());
            spare[..take].copy_from_slice(&bytes[..take]);
            segment.advance(take);
            self.segments.push(segment);
            bytes = &bytes[take..];
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment.as_slice());
        }
        out
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        let mut blob = Blob::new();
        blob.extend_from_slice(bytes, None);
        blob
    }
}

/// Payload attached to a queued send, in whichever shape the producer had
/// it. Every variant is a sequence of contiguous byte runs, so any entry
/// can be coalesced with its neighbours into one scatter/gather syscall.
#[derive(Debug)]
pub enum Data {
    Blob(Blob),
    SharedBlob(Arc<Blob>),
    Bytes(Vec<u8>),
    Shared(Arc<[u8]>),
    Text(String),
}

impl Data {
    pub fn len(&self) -> usize {
        match self {
            Data::Blob(blob) => blob.len(),
            Data::SharedBlob(blob) => blob.len(),
            Data::Bytes(bytes) => bytes.len(),
            Data::Shared(bytes) => bytes.len(),
            Data::Text(text) => text.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slices(&self) -> SliceIter<'_> {
        match self {
            Data::Blob(blob) => SliceIter::Blob(blob.segments.iter()),
            Data::SharedBlob(blob) => SliceIter::Blob(blob.segments.iter()),
            Data::Bytes(bytes) => SliceIter::One(Some(bytes.as_slice())),
            Data::Shared(bytes) => SliceIter::One(Some(bytes)),
            Data::Text(text) => SliceIter::One(Some(text.as_bytes())),
        }
    }

    /// Appends this data's byte runs to `out`, skipping the first `skip`
    /// bytes (already transmitted) and honouring `limits` the way the send
    /// batcher does: caps are checked before each run is appended, runs are
    /// never split by `max_bytes`. Returns false when a cap stopped the
    /// append early.
    pub fn gather<'a>(
        &'a self,
        mut skip: usize,
        limits: &GatherLimits,
        total_bytes: &mut usize,
        out: &mut Vec<IoSlice<'a>>,
    ) -> bool {
        let max_buffers = limits.effective_max_buffers();

        for run in self.slices() {
            let run = if skip >= run.len() {
                skip -= run.len();
                continue;
            } else {
                let trimmed = &run[skip..];
                skip = 0;
                trimmed
            };

            if limits.max_bytes > 0 && *total_bytes >= limits.max_bytes {
                return false;
            }
            if out.len() >= max_buffers {
                return false;
            }

            *total_bytes += run.len();
            out.push(IoSlice::new(run));
        }

        true
    }

    /// Copies the byte content out, front to back. Test and diagnostics
    /// path; the hot paths gather slices instead.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for run in self.slices() {
            out.extend_from_slice(run);
        }
        out
    }
}

enum SliceIter<'a> {
    One(Option<&'a [u8]>),
    Blob(std::slice::Iter<'a, Segment>),
}

impl<'a> Iterator for SliceIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SliceIter::One(slot) => slot.take(),
            SliceIter::Blob(iter) => iter.next().map(Segment::as_slice),
        }
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Data::Bytes(bytes)
    }
}

impl From<&[u8]> for Data {
    fn from(bytes: &[u8]) -> Self {
        Data::Bytes(bytes.to_vec())
    }
}

impl From<String> for Data {
    fn from(text: String) -> Self {
        Data::Text(text)
    }
}

impl From<&str> for Data {
    fn from(text: &str) -> Self {
        Data::Text(text.to_owned())
    }
}

impl From<Blob> for Data {
    fn from(blob: Blob) -> Self {
        Data::Blob(blob)
    }
}
