//! Cache manager: multiplexes one stream reader across N worker threads
//!
//! Each worker owns a private byte segment refilled from the shared stream
//! in strict rotation, so the concatenation of all segments in fill order
//! reconstructs the stream byte-exactly. Records that straddle a segment
//! boundary are stitched through a copyaside store: the consumer that owns
//! the record's start donates or claims the missing piece, and every stream
//! byte is delivered to exactly one consumer.
//!
//! # Architecture
//!
//! * `segment_to_fill` elects the next filler; the elected worker reads
//!   into its own slab, registers a fresh monotonic fill id, and advances
//!   the rotation. Fills never wait on other workers' consumption.
//! * The copyaside store holds two fragment kinds, both keyed by fill id:
//!   *prefix* fragments deposited by [`SegmentHandle::split_at`] and
//!   stitched in front of that fill at registration, and *tail* fragments
//!   deposited by a consumer entering a raw segment mid-record, claimed by
//!   the predecessor that holds the record's head.
//! * A worker that finds the stream exhausted and its segment drained
//!   retires into the termination barrier; `has_more_data` returns false
//!   to everyone once the last worker arrives.
//!
//! Rotation and the barrier count are plain atomics; the copyaside store
//! sits behind a spin lock held only across single map operations. The
//! stream reader is serialized by the rotation itself and wrapped in a
//! mutex only so the shared core is `Sync`.

use crate::error::{Result, SeqCacheError};
use crate::io::stream::StreamReader;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Smallest per-thread segment the manager will accept
pub const MIN_SEGMENT_SIZE: u64 = 1024;

/// Spins before a waiting thread starts yielding its timeslice
const MAX_SPINS: u32 = 64;

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < MAX_SPINS {
        std::hint::spin_loop();
        *spins += 1;
    } else {
        std::thread::yield_now();
    }
}

/// Cumulative per-segment counters, additive across workers at shutdown
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheSegmentStats {
    /// Bytes read from the stream into this worker's slab
    pub numbytes_filled_from_stream: u64,
    /// Bytes served to the caller out of copyaside fragments
    pub numbytes_copied_from_ca_buffer: u64,
    /// Bytes this worker deposited into the copyaside store
    pub numbytes_reserved_as_ca_buffer: u64,
    /// Bytes copied out through `get_bytes`
    pub numbytes_copied_to_caller_buffer: u64,
    /// Wall-clock nanoseconds spent waiting for the fill rotation
    pub clock_nsecs_waiting_to_fill: u64,
    /// Wall-clock nanoseconds spent inside the stream reader
    pub clock_nsecs_filling: u64,
    /// Wall-clock nanoseconds spent waiting on a copyaside rendezvous
    pub clock_nsecs_waiting_for_ca_buffer: u64,
    /// Wall-clock nanoseconds spent in the termination barrier
    pub clock_nsecs_in_barrier: u64,
}

impl CacheSegmentStats {
    /// Fold another worker's counters into this one
    pub fn accumulate(&mut self, other: &CacheSegmentStats) {
        self.numbytes_filled_from_stream += other.numbytes_filled_from_stream;
        self.numbytes_copied_from_ca_buffer += other.numbytes_copied_from_ca_buffer;
        self.numbytes_reserved_as_ca_buffer += other.numbytes_reserved_as_ca_buffer;
        self.numbytes_copied_to_caller_buffer += other.numbytes_copied_to_caller_buffer;
        self.clock_nsecs_waiting_to_fill += other.clock_nsecs_waiting_to_fill;
        self.clock_nsecs_filling += other.clock_nsecs_filling;
        self.clock_nsecs_waiting_for_ca_buffer += other.clock_nsecs_waiting_for_ca_buffer;
        self.clock_nsecs_in_barrier += other.clock_nsecs_in_barrier;
    }
}

// ---------------------------------------------------------------------------
// Spin lock
// ---------------------------------------------------------------------------

/// Minimal spin lock for the copyaside store
///
/// Held only across single insert/lookup operations, at most a few times
/// per segment refill, so contention never builds.
struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the lock grants exclusive access to `value`, so sharing the lock
// itself is sound whenever the payload can move between threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    fn lock(&self) -> SpinGuard<'_, T> {
        let mut spins = 0;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff(&mut spins);
        }
        SpinGuard { lock: self }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: the flag was acquired in `lock` and is held until drop.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above; &mut self prevents aliasing through the guard.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Copyaside store
// ---------------------------------------------------------------------------

/// Boundary tail deposited by the consumer of a raw-entered segment
struct TailDeposit {
    bytes: Vec<u8>,
    /// True when the whole segment was donated (no record start was found),
    /// which allows the claimant to keep chaining into the next fill
    complete_fill: bool,
}

/// Shared copyaside state, everything behind the spin lock
struct CaStore {
    /// Prefix fragments waiting for the fill id they will be stitched onto
    prefixes: HashMap<u64, Vec<u8>>,
    /// Boundary tails deposited on raw segment entry, keyed by that fill id
    tails: HashMap<u64, TailDeposit>,
    /// Next fill id to hand out
    next_fill_id: u64,
    /// Highest fill id registered so far
    last_fill_id: Option<u64>,
    /// A fill is between its stream read and its registration
    fill_active: bool,
    /// Final raw byte of the most recently registered fill
    last_raw_byte: u8,
    /// A refill failed; everyone else drains and finishes
    poisoned: bool,
}

/// State shared by all segment handles of one cache manager
struct CacheShared {
    stream: Mutex<StreamReader>,
    ca: SpinLock<CaStore>,
    segment_to_fill: AtomicU32,
    live_threads: AtomicU32,
    at_eos: AtomicBool,
    number_of_threads: u32,
    segment_size: usize,
    fill_counter: AtomicU64,
}

impl CacheShared {
    fn at_eos(&self) -> bool {
        self.at_eos.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Cache manager and segment handles
// ---------------------------------------------------------------------------

/// Owner of the shared refill state; hands out one [`SegmentHandle`] per
/// worker thread id in `[0, N)`
pub struct CacheManager {
    shared: Arc<CacheShared>,
    handles: Option<Vec<SegmentHandle>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager").finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Build a manager over `stream` for `number_of_threads` workers
    /// sharing `cache_size` total bytes of segment memory
    pub fn new(stream: StreamReader, number_of_threads: u32, cache_size: u64) -> Result<Self> {
        let minimum = MIN_SEGMENT_SIZE * number_of_threads.max(1) as u64;
        if number_of_threads == 0 || cache_size < minimum {
            return Err(SeqCacheError::InvalidCacheSizeRequested {
                requested: cache_size,
                threads: number_of_threads,
                minimum,
            });
        }

        let mut segment_size = (cache_size / number_of_threads as u64) as usize;
        let alignment = stream.alignment();
        if alignment > 0 {
            segment_size = segment_size.div_ceil(alignment) * alignment;
        }

        let shared = Arc::new(CacheShared {
            stream: Mutex::new(stream),
            ca: SpinLock::new(CaStore {
                prefixes: HashMap::new(),
                tails: HashMap::new(),
                next_fill_id: 0,
                last_fill_id: None,
                fill_active: false,
                last_raw_byte: b'\n',
                poisoned: false,
            }),
            segment_to_fill: AtomicU32::new(0),
            live_threads: AtomicU32::new(number_of_threads),
            at_eos: AtomicBool::new(false),
            number_of_threads,
            segment_size,
            fill_counter: AtomicU64::new(0),
        });

        let handles = (0..number_of_threads)
            .map(|thread_id| SegmentHandle {
                shared: Arc::clone(&shared),
                thread_id,
                memory: vec![0u8; segment_size].into_boxed_slice(),
                size: 0,
                cursor: 0,
                ca_buffer: Vec::new(),
                ca_is_terminal: false,
                fill_id: 0,
                prev_fill_ended_with_newline: true,
                avail: false,
                retired: false,
                stats: CacheSegmentStats::default(),
            })
            .collect();

        Ok(Self {
            shared,
            handles: Some(handles),
        })
    }

    /// Take the per-worker handles; yields them exactly once
    pub fn segments(&mut self) -> Vec<SegmentHandle> {
        self.handles.take().unwrap_or_default()
    }

    /// Per-thread segment size in bytes after alignment rounding
    pub fn segment_size(&self) -> usize {
        self.shared.segment_size
    }

    /// Fragments still sitting in the copyaside store
    ///
    /// Nonzero after shutdown only when a boundary scan disagreed with the
    /// parse on malformed input; clean runs leave at most empty tails.
    pub fn orphaned_fragments(&self) -> usize {
        let ca = self.shared.ca.lock();
        ca.prefixes.len() + ca.tails.values().filter(|t| !t.bytes.is_empty()).count()
    }

    /// Total fills performed so far
    pub fn fill_count(&self) -> u64 {
        self.shared.fill_counter.load(Ordering::Acquire)
    }
}

enum RefillOutcome {
    Filled,
    EndOfStream,
}

enum BoundaryStep {
    /// The successor's ceded tail arrived
    Tail(TailDeposit),
    /// The stream ended before the awaited fill could exist
    NoFill,
    /// The rotation elected this worker to perform the awaited fill
    OwnTurn,
}

/// A worker's exclusive view of its own cache segment
///
/// All operations act on the invoking worker's segment only; the handle is
/// `Send` and moves to its worker thread. Positions (`whereis_cursor`,
/// `split_at`) are expressed in the stitched view: copyaside prefix bytes
/// first, then the raw slab.
pub struct SegmentHandle {
    shared: Arc<CacheShared>,
    thread_id: u32,
    memory: Box<[u8]>,
    /// Live raw bytes in `memory`; `split_at` may truncate it
    size: usize,
    /// Stitched cursor in `[0, ca_buffer.len() + size]`
    cursor: usize,
    /// Copyaside bytes stitched before the raw slab
    ca_buffer: Vec<u8>,
    /// The copyaside bytes are a reclaimed stitch: once they run out, no
    /// more bytes can ever arrive for the record being parsed
    ca_is_terminal: bool,
    fill_id: u64,
    prev_fill_ended_with_newline: bool,
    avail: bool,
    retired: bool,
    stats: CacheSegmentStats,
}

impl SegmentHandle {
    /// Worker id of this segment, in `[0, N)`
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Fill id of the segment's current contents
    pub fn fill_id(&self) -> u64 {
        self.fill_id
    }

    /// Number of workers sharing the stream
    pub fn number_of_threads(&self) -> u32 {
        self.shared.number_of_threads
    }

    /// Cumulative counters for this worker
    pub fn stats(&self) -> CacheSegmentStats {
        self.stats
    }

    fn stitched_size(&self) -> usize {
        self.ca_buffer.len() + self.size
    }

    fn drained(&self) -> bool {
        self.cursor >= self.stitched_size()
    }

    /// Segment-local position of the consumer in the stitched view
    pub fn whereis_cursor(&self) -> u64 {
        self.cursor as u64
    }

    /// True while the cursor sits inside copyaside bytes
    pub fn is_cursor_in_ca_buffer(&self) -> bool {
        self.avail && self.cursor < self.ca_buffer.len()
    }

    /// True when the previous fill's final raw byte was a line terminator
    ///
    /// Lets a consumer entering a raw segment decide whether its first byte
    /// can start a line at all.
    pub fn prev_fill_ended_with_newline(&self) -> bool {
        self.prev_fill_ended_with_newline
    }

    /// True when exhausting the current stitched bytes is final: no later
    /// fill can ever continue the record being parsed here
    ///
    /// Holds for a reclaimed boundary stitch (which ends at the next record
    /// start or at end-of-stream) and for the last fill of the stream.
    pub fn at_segment_terminus(&self) -> bool {
        if self.ca_is_terminal {
            return true;
        }
        if !self.shared.at_eos() {
            return false;
        }
        let ca = self.shared.ca.lock();
        !ca.fill_active && ca.last_fill_id == Some(self.fill_id)
    }

    /// True if this worker still has bytes to consume; blocks while its
    /// segment awaits its refill turn, and inside the termination barrier
    ///
    /// Returns false only once the stream is exhausted and every worker has
    /// drained its segment.
    pub fn has_more_data(&mut self) -> Result<bool> {
        loop {
            if self.avail && !self.drained() {
                return Ok(true);
            }
            if self.retired {
                return Ok(false);
            }
            match self.try_refill()? {
                RefillOutcome::Filled => continue,
                RefillOutcome::EndOfStream => {
                    self.retire();
                    return Ok(false);
                }
            }
        }
    }

    /// Copy up to `dst.len()` bytes from the segment, returning how many
    /// were copied; a short count means the segment ran out
    ///
    /// Never blocks and never crosses into another worker's segment.
    pub fn get_bytes(&mut self, dst: &mut [u8]) -> Result<usize> {
        if !self.avail {
            return Err(SeqCacheError::CacheSegmentUnavailable {
                thread_id: self.thread_id,
            });
        }
        let mut copied = 0;
        while copied < dst.len() {
            let ca_len = self.ca_buffer.len();
            if self.cursor < ca_len {
                let n = (dst.len() - copied).min(ca_len - self.cursor);
                dst[copied..copied + n].copy_from_slice(&self.ca_buffer[self.cursor..self.cursor + n]);
                self.stats.numbytes_copied_from_ca_buffer += n as u64;
                self.cursor += n;
                copied += n;
            } else {
                let raw_off = self.cursor - ca_len;
                if raw_off >= self.size {
                    break;
                }
                let n = (dst.len() - copied).min(self.size - raw_off);
                dst[copied..copied + n].copy_from_slice(&self.memory[raw_off..raw_off + n]);
                self.cursor += n;
                copied += n;
            }
        }
        self.stats.numbytes_copied_to_caller_buffer += copied as u64;
        Ok(copied)
    }

    /// Declare that stitched bytes `[pos, end)` belong to a later segment
    ///
    /// The donated head either becomes the copyaside prefix of the next
    /// fill (when that fill has not registered yet), or — when the next
    /// fill raced ahead — is stitched together with the boundary tail its
    /// consumer deposited, rebasing this segment onto the combined bytes so
    /// the caller can parse the straddling record itself. After the call,
    /// check [`is_cursor_in_ca_buffer`]: true means the record is now
    /// readable here, false means it was handed to the next segment.
    ///
    /// [`is_cursor_in_ca_buffer`]: SegmentHandle::is_cursor_in_ca_buffer
    pub fn split_at(&mut self, pos: u64) -> Result<()> {
        if !self.avail {
            return Err(SeqCacheError::CacheSegmentUnavailable {
                thread_id: self.thread_id,
            });
        }
        let pos = pos as usize;
        let stitched = self.stitched_size();
        if pos > stitched {
            return Err(SeqCacheError::CacheSegmentBoundaryViolation {
                pos: pos as u64,
                size: stitched as u64,
            });
        }

        let head = self.stitched_copy(pos);
        self.stats.numbytes_reserved_as_ca_buffer += head.len() as u64;
        let target = self.fill_id + 1;

        let reclaimed = {
            let mut ca = self.shared.ca.lock();
            let registered = ca.last_fill_id.is_some_and(|last| last >= target);
            if registered {
                Some(head)
            } else {
                ca.prefixes.insert(target, head);
                None
            }
        };

        let Some(mut stitched_bytes) = reclaimed else {
            // The head will be stitched in front of the next fill; this
            // segment ends at the split point.
            self.truncate_to(pos);
            self.cursor = pos;
            return Ok(());
        };

        // The next fill raced ahead: reclaim the boundary tail(s) its
        // consumer set aside and rebase onto head + tail. A tail covering a
        // whole fill means the record keeps going, so the claim chains into
        // the next fill id.
        let mut claim = target;
        loop {
            match self.await_boundary(claim)? {
                BoundaryStep::Tail(deposit) => {
                    stitched_bytes.extend_from_slice(&deposit.bytes);
                    if deposit.complete_fill {
                        claim += 1;
                        continue;
                    }
                    break;
                }
                // Stream ended before the record's continuation existed;
                // give the parser whatever was assembled.
                BoundaryStep::NoFill => break,
                // Our own rotation turn arrived while the record was still
                // open: fill our slab and let the record continue straight
                // into the fresh bytes.
                BoundaryStep::OwnTurn => {
                    if matches!(self.perform_fill()?, RefillOutcome::Filled) {
                        self.ca_buffer = stitched_bytes;
                        self.ca_is_terminal = false;
                        self.cursor = 0;
                        return Ok(());
                    }
                    break;
                }
            }
        }

        self.ca_buffer = stitched_bytes;
        self.ca_is_terminal = true;
        self.size = 0;
        self.cursor = 0;
        Ok(())
    }

    /// Cede the first `pos` stitched bytes to the predecessor's rendezvous
    ///
    /// Called by a consumer entering a freshly filled raw segment whose
    /// first bytes continue a record owned by the previous fill's consumer.
    /// The bytes are deposited as this fill's boundary tail and the cursor
    /// moves to `pos`, where the caller's own first record begins.
    pub fn cede_prefix(&mut self, pos: u64) -> Result<()> {
        if !self.avail {
            return Err(SeqCacheError::CacheSegmentUnavailable {
                thread_id: self.thread_id,
            });
        }
        let pos = pos as usize;
        let stitched = self.stitched_size();
        if pos > stitched {
            return Err(SeqCacheError::CacheSegmentBoundaryViolation {
                pos: pos as u64,
                size: stitched as u64,
            });
        }

        let mut bytes = vec![0u8; pos];
        let ca_len = self.ca_buffer.len();
        if pos <= ca_len {
            bytes.copy_from_slice(&self.ca_buffer[..pos]);
        } else {
            bytes[..ca_len].copy_from_slice(&self.ca_buffer);
            bytes[ca_len..].copy_from_slice(&self.memory[..pos - ca_len]);
        }
        self.stats.numbytes_reserved_as_ca_buffer += bytes.len() as u64;

        let deposit = TailDeposit {
            bytes,
            complete_fill: pos == stitched,
        };
        {
            let mut ca = self.shared.ca.lock();
            ca.tails.insert(self.fill_id, deposit);
        }
        self.cursor = pos;
        Ok(())
    }

    // Copy stitched bytes `[from, end)` out of the segment.
    fn stitched_copy(&self, from: usize) -> Vec<u8> {
        let ca_len = self.ca_buffer.len();
        let mut out = Vec::with_capacity(self.stitched_size() - from);
        if from < ca_len {
            out.extend_from_slice(&self.ca_buffer[from..]);
            out.extend_from_slice(&self.memory[..self.size]);
        } else {
            out.extend_from_slice(&self.memory[from - ca_len..self.size]);
        }
        out
    }

    // Truncate the stitched view at `pos`.
    fn truncate_to(&mut self, pos: usize) {
        let ca_len = self.ca_buffer.len();
        if pos <= ca_len {
            self.ca_buffer.truncate(pos);
            self.size = 0;
        } else {
            self.size = pos - ca_len;
        }
    }

    // Block until the boundary tail for `fill` is deposited, the stream
    // proves no such fill will ever exist, or the rotation elects this
    // worker to perform that fill itself.
    fn await_boundary(&mut self, fill: u64) -> Result<BoundaryStep> {
        let start = Instant::now();
        let mut spins = 0;
        let step = loop {
            {
                let mut ca = self.shared.ca.lock();
                if let Some(deposit) = ca.tails.remove(&fill) {
                    break BoundaryStep::Tail(deposit);
                }
                let registered = ca.last_fill_id.is_some_and(|last| last >= fill);
                if !registered && !ca.fill_active {
                    if self.shared.at_eos() || ca.poisoned {
                        break BoundaryStep::NoFill;
                    }
                    if self.shared.segment_to_fill.load(Ordering::Acquire) == self.thread_id
                        || self.shared.live_threads.load(Ordering::Acquire) == 1
                    {
                        break BoundaryStep::OwnTurn;
                    }
                }
            }
            backoff(&mut spins);
        };
        self.stats.clock_nsecs_waiting_for_ca_buffer += start.elapsed().as_nanos() as u64;
        if let BoundaryStep::Tail(deposit) = &step {
            self.stats.numbytes_copied_from_ca_buffer += deposit.bytes.len() as u64;
        }
        Ok(step)
    }

    // Wait for this worker's turn in the rotation, then fill its slab.
    fn try_refill(&mut self) -> Result<RefillOutcome> {
        let wait_start = Instant::now();
        let mut spins = 0;
        loop {
            if self.shared.at_eos() {
                self.stats.clock_nsecs_waiting_to_fill += wait_start.elapsed().as_nanos() as u64;
                if self.adopt_orphan_prefix() {
                    return Ok(RefillOutcome::Filled);
                }
                return Ok(RefillOutcome::EndOfStream);
            }
            if self.shared.segment_to_fill.load(Ordering::Acquire) == self.thread_id {
                break;
            }
            // Sole survivor: every other worker retired or was dropped, so
            // the rotation marker may point at a segment that will never
            // fill again.
            if self.shared.live_threads.load(Ordering::Acquire) == 1 {
                break;
            }
            backoff(&mut spins);
        }
        self.stats.clock_nsecs_waiting_to_fill += wait_start.elapsed().as_nanos() as u64;

        match self.perform_fill()? {
            RefillOutcome::Filled => Ok(RefillOutcome::Filled),
            RefillOutcome::EndOfStream => {
                if self.adopt_orphan_prefix() {
                    Ok(RefillOutcome::Filled)
                } else {
                    Ok(RefillOutcome::EndOfStream)
                }
            }
        }
    }

    // Read one segment's worth from the stream and register the fill; the
    // caller must hold the rotation election.
    fn perform_fill(&mut self) -> Result<RefillOutcome> {
        {
            let mut ca = self.shared.ca.lock();
            ca.fill_active = true;
        }

        let fill_start = Instant::now();
        let read = {
            // A poisoned lock means a filler panicked mid-read; the reader
            // itself is still usable and the next read reports the damage.
            let mut stream = self
                .shared
                .stream
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let result = stream.read_into_cache(&mut self.memory);
            if stream.is_at_end_of_stream() {
                self.shared.at_eos.store(true, Ordering::Release);
            }
            result
        };
        self.stats.clock_nsecs_filling += fill_start.elapsed().as_nanos() as u64;

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                {
                    let mut ca = self.shared.ca.lock();
                    ca.fill_active = false;
                    ca.poisoned = true;
                }
                self.shared.at_eos.store(true, Ordering::Release);
                self.advance_rotation();
                return Err(e);
            }
        };

        if n == 0 {
            {
                let mut ca = self.shared.ca.lock();
                ca.fill_active = false;
            }
            self.advance_rotation();
            return Ok(RefillOutcome::EndOfStream);
        }

        // Register the fill and pick up any copyaside prefix destined for it.
        let (id, prefix, prev_nl) = {
            let mut ca = self.shared.ca.lock();
            let id = ca.next_fill_id;
            ca.next_fill_id += 1;
            ca.last_fill_id = Some(id);
            ca.fill_active = false;
            let prev_nl = ca.last_raw_byte == b'\n';
            ca.last_raw_byte = self.memory[n - 1];
            (id, ca.prefixes.remove(&id), prev_nl)
        };
        self.shared.fill_counter.store(id + 1, Ordering::Release);

        self.fill_id = id;
        self.prev_fill_ended_with_newline = prev_nl;
        self.size = n;
        self.ca_buffer = prefix.unwrap_or_default();
        self.ca_is_terminal = false;
        self.cursor = 0;
        self.avail = true;
        self.stats.numbytes_filled_from_stream += n as u64;
        self.advance_rotation();
        Ok(RefillOutcome::Filled)
    }

    // A record head donated for a fill that never happened would be lost
    // when the stream ends exactly at a segment boundary. Whichever worker
    // first discovers the dead end adopts the fragment and parses it out.
    fn adopt_orphan_prefix(&mut self) -> bool {
        let fragment = {
            let mut ca = self.shared.ca.lock();
            if ca.fill_active {
                return false;
            }
            let key = ca.next_fill_id;
            ca.prefixes.remove(&key)
        };
        match fragment {
            Some(bytes) if !bytes.is_empty() => {
                self.stats.numbytes_copied_from_ca_buffer += bytes.len() as u64;
                self.ca_buffer = bytes;
                self.ca_is_terminal = true;
                self.size = 0;
                self.cursor = 0;
                self.avail = true;
                true
            }
            _ => false,
        }
    }

    fn advance_rotation(&self) {
        let next = (self.thread_id + 1) % self.shared.number_of_threads;
        self.shared.segment_to_fill.store(next, Ordering::Release);
    }

    // Leave the live set and wait for everyone else at the barrier.
    fn retire(&mut self) {
        if !self.retired {
            self.retired = true;
            self.avail = false;
            self.shared.live_threads.fetch_sub(1, Ordering::AcqRel);
        }
        let start = Instant::now();
        let mut spins = 0;
        while self.shared.live_threads.load(Ordering::Acquire) != 0 {
            backoff(&mut spins);
        }
        self.stats.clock_nsecs_in_barrier += start.elapsed().as_nanos() as u64;
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        // A handle dropped before exhaustion must still leave the live set,
        // or the remaining workers would wait at the barrier forever.
        if !self.retired {
            self.retired = true;
            self.shared.live_threads.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    fn reader_over(content: &[u8]) -> StreamReader {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        StreamReader::from_file(f).unwrap()
    }

    #[test]
    fn test_rejects_zero_threads_and_tiny_cache() {
        let err = CacheManager::new(reader_over(b"x"), 0, 1 << 20).unwrap_err();
        assert!(matches!(err, SeqCacheError::InvalidCacheSizeRequested { .. }));

        let err = CacheManager::new(reader_over(b"x"), 4, 64).unwrap_err();
        assert!(matches!(err, SeqCacheError::InvalidCacheSizeRequested { .. }));
    }

    #[test]
    fn test_single_thread_drains_whole_stream() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut mgr = CacheManager::new(reader_over(&payload), 1, 2048).unwrap();
        let mut seg = mgr.segments().pop().unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 300];
        while seg.has_more_data().unwrap() {
            let n = seg.get_bytes(&mut buf).unwrap();
            assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
        assert!(mgr.fill_count() > 1, "payload must span several refills");
        assert_eq!(mgr.orphaned_fragments(), 0);
    }

    #[test]
    fn test_get_bytes_before_fill_is_unavailable() {
        let mut mgr = CacheManager::new(reader_over(b"abc"), 1, 2048).unwrap();
        let mut seg = mgr.segments().pop().unwrap();
        let mut buf = [0u8; 4];
        let err = seg.get_bytes(&mut buf).unwrap_err();
        assert!(matches!(err, SeqCacheError::CacheSegmentUnavailable { .. }));
    }

    #[test]
    fn test_empty_stream_reports_no_data() {
        let mut mgr = CacheManager::new(reader_over(b""), 1, 2048).unwrap();
        let mut seg = mgr.segments().pop().unwrap();
        assert!(!seg.has_more_data().unwrap());
        assert!(!seg.has_more_data().unwrap());
    }

    #[test]
    fn test_split_at_bounds_checked() {
        let mut mgr = CacheManager::new(reader_over(&[7u8; 500]), 1, 2048).unwrap();
        let mut seg = mgr.segments().pop().unwrap();
        assert!(seg.has_more_data().unwrap());
        let err = seg.split_at(501).unwrap_err();
        assert!(matches!(err, SeqCacheError::CacheSegmentBoundaryViolation { .. }));
    }

    #[test]
    fn test_split_before_next_fill_becomes_prefix() {
        // 1500 bytes through a 1024-byte single segment: the tail of fill 0
        // donated at 1000 must arrive stitched in front of fill 1.
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let mut mgr = CacheManager::new(reader_over(&payload), 1, 1024).unwrap();
        let mut seg = mgr.segments().pop().unwrap();

        assert!(seg.has_more_data().unwrap());
        assert_eq!(seg.fill_id(), 0);
        let mut sink = vec![0u8; 1000];
        assert_eq!(seg.get_bytes(&mut sink).unwrap(), 1000);

        seg.split_at(1000).unwrap();
        // Handed forward: nothing left to read here.
        assert!(!seg.is_cursor_in_ca_buffer());

        assert!(seg.has_more_data().unwrap());
        assert_eq!(seg.fill_id(), 1);
        assert!(seg.is_cursor_in_ca_buffer());

        let mut rest = Vec::new();
        let mut buf = [0u8; 128];
        loop {
            let n = seg.get_bytes(&mut buf).unwrap();
            rest.extend_from_slice(&buf[..n]);
            if n < buf.len() {
                break;
            }
        }
        assert_eq!(rest, &payload[1000..]);
        assert!(!seg.has_more_data().unwrap());
    }

    #[test]
    fn test_split_after_next_fill_reclaims_ceded_tail() {
        // Two workers, driven from one thread in fill order. Worker 1 cedes
        // its first 24 bytes, then worker 0's split reclaims them.
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let mut mgr = CacheManager::new(reader_over(&payload), 2, 2048).unwrap();
        let mut segs = mgr.segments();
        let mut seg1 = segs.pop().unwrap();
        let mut seg0 = segs.pop().unwrap();

        assert!(seg0.has_more_data().unwrap()); // fill 0: bytes 0..1024
        assert!(seg1.has_more_data().unwrap()); // fill 1: bytes 1024..2048
        assert_eq!(seg1.fill_id(), 1);

        seg1.cede_prefix(24).unwrap();
        assert_eq!(seg1.whereis_cursor(), 24);

        // Worker 0 consumed up to byte 1000 when its record overran.
        let mut sink = vec![0u8; 1000];
        seg0.get_bytes(&mut sink).unwrap();
        seg0.split_at(1000).unwrap();

        // Fill 1 was already registered, so the head is reclaimed and
        // stitched with worker 1's ceded tail.
        assert!(seg0.is_cursor_in_ca_buffer());
        let mut stitched = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = seg0.get_bytes(&mut buf).unwrap();
            stitched.extend_from_slice(&buf[..n]);
            if n < buf.len() {
                break;
            }
        }
        assert_eq!(stitched, &payload[1000..1048]);
        assert_eq!(mgr.orphaned_fragments(), 0);
    }

    #[test]
    fn test_fill_ids_strictly_increase_across_workers() {
        let payload = vec![1u8; 8192];
        let mut mgr = CacheManager::new(reader_over(&payload), 2, 4096).unwrap();
        let mut segs = mgr.segments();
        let mut seg1 = segs.pop().unwrap();
        let mut seg0 = segs.pop().unwrap();

        assert!(seg0.has_more_data().unwrap());
        assert!(seg1.has_more_data().unwrap());
        assert_eq!(seg0.fill_id(), 0);
        assert_eq!(seg1.fill_id(), 1);

        // Drain both; refills alternate in rotation.
        let mut buf = vec![0u8; 2048];
        seg0.get_bytes(&mut buf).unwrap();
        seg1.get_bytes(&mut buf).unwrap();
        assert!(seg0.has_more_data().unwrap());
        assert_eq!(seg0.fill_id(), 2);
        assert!(seg1.has_more_data().unwrap());
        assert_eq!(seg1.fill_id(), 3);
    }

    #[test]
    fn test_barrier_releases_all_workers() {
        let payload = vec![9u8; 4096];
        let mut mgr = CacheManager::new(reader_over(&payload), 4, 8192).unwrap();
        let segs = mgr.segments();

        std::thread::scope(|scope| {
            let mut joins = Vec::new();
            for mut seg in segs {
                joins.push(scope.spawn(move || {
                    let mut total = 0u64;
                    let mut buf = [0u8; 256];
                    while seg.has_more_data().unwrap() {
                        total += seg.get_bytes(&mut buf).unwrap() as u64;
                    }
                    total
                }));
            }
            let total: u64 = joins.into_iter().map(|j| j.join().unwrap()).sum();
            assert_eq!(total, 4096);
        });
    }

    #[test]
    fn test_dropped_worker_unblocks_barrier() {
        let payload = vec![3u8; 2048];
        let mut mgr = CacheManager::new(reader_over(&payload), 2, 4096).unwrap();
        let mut segs = mgr.segments();
        let seg1 = segs.pop().unwrap();
        let mut seg0 = segs.pop().unwrap();

        drop(seg1);
        let mut buf = [0u8; 512];
        let mut total = 0;
        while seg0.has_more_data().unwrap() {
            total += seg0.get_bytes(&mut buf).unwrap();
        }
        assert_eq!(total, 2048);
    }
}
