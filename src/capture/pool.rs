//! Fixed ring of raw capture buffers shared between the driver and processing

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::{instrument, trace};

use crate::capture::frame::{FrameMetadata, ImageGeometry, PixelFormat};
use crate::error::{Error, Result};

/// The number of frame buffers used.
pub const NR_FRAME_BUFFERS: usize = 3;

/// Timeout when waiting for a new picture.
pub const CAMERA_TIMEOUT: Duration = Duration::from_millis(1);

/// Ownership of a single raw buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// Reusable by the driver
    Free = 0,
    /// Owned by the driver while a capture is in flight
    Capturing = 1,
    /// Complete capture waiting for processing
    Ready = 2,
    /// Held by processing for the current cycle
    Borrowed = 3,
}

impl BufferState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BufferState::Capturing,
            2 => BufferState::Ready,
            3 => BufferState::Borrowed,
            _ => BufferState::Free,
        }
    }
}

/// Pixel storage of one buffer and the metadata of its last capture
pub struct SlotData {
    pixels: Box<[u8]>,
    meta: FrameMetadata,
}

struct Slot {
    state: AtomicU8,
    sequence: AtomicU64,
    /// Only the current state owner ever locks this, so it is never contended
    data: Mutex<SlotData>,
}

impl Slot {
    fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }
}

#[derive(Default)]
struct Stats {
    captured: AtomicU64,
    acquired: AtomicU64,
    superseded: AtomicU64,
    stalls: AtomicU64,
}

/// Snapshot of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub captured: u64,
    pub acquired: u64,
    pub superseded: u64,
    pub stalls: u64,
}

struct Shared {
    slots: Box<[Slot]>,
    frame_len: usize,
    sequence: AtomicU64,
    consecutive_stalls: AtomicU32,
    ready_tx: flume::Sender<u64>,
    stats: CachePadded<Stats>,
}

impl Shared {
    fn transition(&self, index: usize, from: BufferState, to: BufferState) -> bool {
        self.slots[index]
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock(&self, index: usize) -> Result<MutexGuard<'_, SlotData>> {
        self.slots[index]
            .data
            .lock()
            .map_err(|_| Error::fault(format!("frame buffer {index} lock poisoned")))
    }
}

/// Processing side of the frame buffer pool.
///
/// Buffers are handed to the driver round-robin through the paired
/// [`CaptureHandle`]. Acquisition always yields the most recently completed
/// capture and returns older ready buffers to the free set, so the driver is
/// never given a buffer processing still holds.
pub struct FrameBufferPool {
    shared: Arc<Shared>,
    ready_rx: flume::Receiver<u64>,
    stall_limit: u32,
}

impl FrameBufferPool {
    /// Create a pool of `count` buffers of `frame_len` bytes each.
    ///
    /// Once the driver has stalled `stall_limit` times in a row the pool
    /// reports exhaustion to processing.
    pub fn new(count: usize, frame_len: usize, stall_limit: u32) -> Result<(Self, CaptureHandle)> {
        if count == 0 || frame_len == 0 {
            return Err(Error::Config(format!(
                "frame buffer pool needs buffers and bytes, got {count} x {frame_len}"
            )));
        }

        let slots = (0..count)
            .map(|_| Slot {
                state: AtomicU8::new(BufferState::Free as u8),
                sequence: AtomicU64::new(0),
                data: Mutex::new(SlotData {
                    pixels: vec![0; frame_len].into_boxed_slice(),
                    meta: FrameMetadata::new(ImageGeometry::new(0, 0, 1), PixelFormat::Uyvy, 0),
                }),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let (ready_tx, ready_rx) = flume::bounded(count);
        let shared = Arc::new(Shared {
            slots,
            frame_len,
            sequence: AtomicU64::new(0),
            consecutive_stalls: AtomicU32::new(0),
            ready_tx,
            stats: CachePadded::new(Stats::default()),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            ready_rx,
            stall_limit: stall_limit.max(1),
        };
        let capture = CaptureHandle { shared, next: 0 };
        Ok((pool, capture))
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn frame_len(&self) -> usize {
        self.shared.frame_len
    }

    /// Wait up to `timeout` for the most recently completed frame.
    ///
    /// Driver stalls only count as exhaustion while no frame can be claimed.
    #[instrument(level = "trace", skip(self))]
    pub fn try_acquire_ready(&mut self, timeout: Duration) -> Result<FrameHandle> {
        if self.states().contains(&BufferState::Borrowed) {
            return Err(Error::fault("previous frame was not released"));
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Notifications only wake us up, the slot states are authoritative
            while self.ready_rx.try_recv().is_ok() {}

            if let Some(frame) = self.claim_latest() {
                return Ok(frame);
            }
            self.check_exhausted()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            if self.ready_rx.recv_timeout(remaining).is_err() {
                return match self.claim_latest() {
                    Some(frame) => Ok(frame),
                    None => self.check_exhausted().and(Err(Error::Timeout)),
                };
            }
        }
    }

    fn check_exhausted(&self) -> Result<()> {
        let stalls = self.shared.consecutive_stalls.load(Ordering::Acquire);
        if stalls >= self.stall_limit {
            return Err(Error::ResourceExhausted { stalls });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn record_stalls(&self, stalls: u32) {
        self.shared
            .consecutive_stalls
            .store(stalls, Ordering::Release);
    }

    /// Give a borrowed frame back to the free set.
    pub fn release(&mut self, frame: FrameHandle) {
        drop(frame);
    }

    pub fn states(&self) -> Vec<BufferState> {
        self.shared.slots.iter().map(Slot::state).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let stats = &self.shared.stats;
        PoolStats {
            captured: stats.captured.load(Ordering::Relaxed),
            acquired: stats.acquired.load(Ordering::Relaxed),
            superseded: stats.superseded.load(Ordering::Relaxed),
            stalls: stats.stalls.load(Ordering::Relaxed),
        }
    }

    fn claim_latest(&self) -> Option<FrameHandle> {
        let shared = &self.shared;
        let (index, sequence) = shared
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state() == BufferState::Ready)
            .map(|(index, slot)| (index, slot.sequence.load(Ordering::Acquire)))
            .max_by_key(|&(_, sequence)| sequence)?;

        if !shared.transition(index, BufferState::Ready, BufferState::Borrowed) {
            return None;
        }

        // Only this side moves a buffer out of Ready, so a slot seen Ready
        // keeps the sequence read after it until the swap below
        for (other, slot) in shared.slots.iter().enumerate() {
            if other != index
                && slot.state() == BufferState::Ready
                && slot.sequence.load(Ordering::Acquire) < sequence
                && shared.transition(other, BufferState::Ready, BufferState::Free)
            {
                shared.stats.superseded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_superseded").increment(1);
            }
        }

        shared.stats.acquired.fetch_add(1, Ordering::Relaxed);
        trace!(index, sequence, "frame borrowed");
        Some(FrameHandle {
            shared: Arc::clone(shared),
            index,
            sequence,
        })
    }
}

/// Exclusive, cycle-scoped access to a ready buffer.
///
/// Dropping the handle returns the buffer to the free set.
pub struct FrameHandle {
    shared: Arc<Shared>,
    index: usize,
    sequence: u64,
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("index", &self.index)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl FrameHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn lock(&self) -> Result<RawFrame<'_>> {
        Ok(RawFrame {
            guard: self.shared.lock(self.index)?,
        })
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.shared
            .transition(self.index, BufferState::Borrowed, BufferState::Free);
    }
}

/// Read view of a borrowed buffer
pub struct RawFrame<'a> {
    guard: MutexGuard<'a, SlotData>,
}

impl RawFrame<'_> {
    pub fn pixels(&self) -> &[u8] {
        let len = self.guard.meta.len.min(self.guard.pixels.len());
        &self.guard.pixels[..len]
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.guard.meta
    }
}

/// Driver side of the frame buffer pool.
pub struct CaptureHandle {
    shared: Arc<Shared>,
    next: usize,
}

impl CaptureHandle {
    /// Claim the next free buffer for a capture.
    ///
    /// The lease borrows the handle, so only one capture is ever in flight.
    /// Fails with [`Error::ResourceExhausted`] when no buffer is free; the
    /// driver must stall and retry.
    pub fn begin_capture(&mut self) -> Result<CaptureLease<'_>> {
        let count = self.shared.slots.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            if self
                .shared
                .transition(index, BufferState::Free, BufferState::Capturing)
            {
                self.next = (index + 1) % count;
                self.shared.consecutive_stalls.store(0, Ordering::Release);
                return Ok(CaptureLease {
                    shared: &self.shared,
                    index,
                    completed: false,
                });
            }
        }

        let stalls = self
            .shared
            .consecutive_stalls
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        self.shared.stats.stalls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("capture_stalls").increment(1);
        Err(Error::ResourceExhausted { stalls })
    }

    pub fn frame_len(&self) -> usize {
        self.shared.frame_len
    }
}

/// A buffer owned by the driver while it is being filled.
///
/// Dropping the lease without completing it aborts the capture.
pub struct CaptureLease<'a> {
    shared: &'a Shared,
    index: usize,
    completed: bool,
}

impl CaptureLease<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Run `f` over the full pixel buffer.
    pub fn fill<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut data = self.shared.lock(self.index)?;
        Ok(f(&mut data.pixels))
    }

    /// Publish the buffer as the latest ready frame and return its sequence.
    pub fn complete(mut self, mut meta: FrameMetadata) -> Result<u64> {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut data = self.shared.lock(self.index)?;
            meta.sequence = sequence;
            meta.len = meta.len.min(data.pixels.len());
            data.meta = meta;
        }

        let slot = &self.shared.slots[self.index];
        slot.sequence.store(sequence, Ordering::Release);
        self.completed = true;
        self.shared
            .transition(self.index, BufferState::Capturing, BufferState::Ready);
        self.shared.stats.captured.fetch_add(1, Ordering::Relaxed);

        // A full channel already holds a wakeup
        let _ = self.shared.ready_tx.try_send(sequence);
        Ok(sequence)
    }
}

impl Drop for CaptureLease<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.shared
                .transition(self.index, BufferState::Capturing, BufferState::Free);
            trace!(index = self.index, "capture aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn meta(len: usize) -> FrameMetadata {
        FrameMetadata::new(ImageGeometry::new(4, 2, 1), PixelFormat::Uyvy, len)
    }

    fn capture_one(capture: &mut CaptureHandle, value: u8) -> u64 {
        let mut lease = capture.begin_capture().unwrap();
        lease.fill(|buf| buf.fill(value)).unwrap();
        lease.complete(meta(16)).unwrap()
    }

    #[test]
    fn test_acquire_times_out_without_frames() {
        let (mut pool, _capture) = FrameBufferPool::new(3, 16, 10).unwrap();
        let err = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn test_acquire_returns_latest_and_frees_older() {
        let (mut pool, mut capture) = FrameBufferPool::new(3, 16, 10).unwrap();
        capture_one(&mut capture, 1);
        let latest = capture_one(&mut capture, 2);

        let frame = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap();
        assert_eq!(frame.sequence(), latest);
        assert_eq!(frame.lock().unwrap().pixels()[0], 2);

        let states = pool.states();
        assert_eq!(states[frame.index()], BufferState::Borrowed);
        assert_eq!(
            states.iter().filter(|s| **s == BufferState::Free).count(),
            2
        );
        assert_eq!(pool.stats().superseded, 1);

        pool.release(frame);
        assert!(pool.states().iter().all(|s| *s == BufferState::Free));
    }

    #[test]
    fn test_driver_stalls_when_pool_is_full() {
        let (mut pool, mut capture) = FrameBufferPool::new(NR_FRAME_BUFFERS, 16, 100).unwrap();
        for value in 0..3 {
            capture_one(&mut capture, value);
        }
        assert!(matches!(
            capture.begin_capture(),
            Err(Error::ResourceExhausted { stalls: 1 })
        ));

        let frame = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap();
        let borrowed = frame.index();
        assert_eq!(frame.lock().unwrap().pixels()[0], 2);

        // The two superseded buffers are reused, the borrowed one never is
        for value in 10..12 {
            let mut lease = capture.begin_capture().unwrap();
            assert_ne!(lease.index(), borrowed);
            lease.fill(|buf| buf.fill(value)).unwrap();
            lease.complete(meta(16)).unwrap();
        }
        assert!(capture.begin_capture().is_err());
        assert!(frame.lock().unwrap().pixels().iter().all(|b| *b == 2));
    }

    #[test]
    fn test_persistent_stalls_exhaust_the_pool() {
        let (mut pool, _capture) = FrameBufferPool::new(3, 16, 2).unwrap();
        pool.record_stalls(2);

        let err = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { stalls: 2 }));
    }

    #[test]
    fn test_stalls_do_not_hide_ready_frames() {
        let (mut pool, mut capture) = FrameBufferPool::new(3, 16, 2).unwrap();
        for value in 0..3 {
            capture_one(&mut capture, value);
        }
        let frame = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap();
        capture_one(&mut capture, 3);
        capture_one(&mut capture, 4);
        assert!(capture.begin_capture().is_err());
        assert!(capture.begin_capture().is_err());
        pool.release(frame);
        assert_eq!(
            pool.states(),
            vec![BufferState::Ready, BufferState::Ready, BufferState::Free]
        );

        let frame = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap();
        assert_eq!(frame.lock().unwrap().pixels()[0], 4);
        drop(frame);
        // The driver gets going again and clears its stall count
        capture_one(&mut capture, 5);
        assert_eq!(pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap().sequence(), 6);
    }

    #[test]
    fn test_capturing_slot_is_not_superseded() {
        let (mut pool, mut capture) = FrameBufferPool::new(3, 16, 10).unwrap();
        capture_one(&mut capture, 1);
        let lease = capture.begin_capture().unwrap();
        let in_flight = lease.index();

        let frame = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap();
        assert_eq!(pool.states()[in_flight], BufferState::Capturing);
        drop(frame);
        lease.complete(meta(16)).unwrap();
        assert_eq!(pool.states()[in_flight], BufferState::Ready);
        assert_eq!(pool.stats().superseded, 0);
    }

    #[test]
    fn test_aborted_capture_returns_buffer() {
        let (pool, mut capture) = FrameBufferPool::new(3, 16, 10).unwrap();
        {
            let lease = capture.begin_capture().unwrap();
            assert_eq!(pool.states()[lease.index()], BufferState::Capturing);
        }
        assert!(pool.states().iter().all(|s| *s == BufferState::Free));
    }

    #[test]
    fn test_second_borrow_is_refused() {
        let (mut pool, mut capture) = FrameBufferPool::new(3, 16, 10).unwrap();
        capture_one(&mut capture, 1);
        let _frame = pool.try_acquire_ready(CAMERA_TIMEOUT).unwrap();
        capture_one(&mut capture, 2);
        assert!(matches!(
            pool.try_acquire_ready(CAMERA_TIMEOUT),
            Err(Error::UnrecoverableFault(_))
        ));
    }

    #[test]
    fn test_concurrent_capture_never_tears_frames() {
        let (mut pool, mut capture) = FrameBufferPool::new(NR_FRAME_BUFFERS, 64, u32::MAX).unwrap();

        let driver = thread::spawn(move || {
            let mut done = 0u32;
            while done < 300 {
                match capture.begin_capture() {
                    Ok(mut lease) => {
                        lease.fill(|buf| buf.fill(done as u8)).unwrap();
                        lease.complete(meta(64)).unwrap();
                        done += 1;
                    }
                    Err(Error::ResourceExhausted { .. }) => thread::yield_now(),
                    Err(err) => panic!("unexpected capture error: {err}"),
                }
            }
        });

        let mut last = 0;
        loop {
            let capturing = pool
                .states()
                .iter()
                .filter(|s| **s == BufferState::Capturing)
                .count();
            assert!(capturing <= 1);

            match pool.try_acquire_ready(Duration::from_millis(5)) {
                Ok(frame) => {
                    assert!(frame.sequence() > last);
                    last = frame.sequence();
                    let raw = frame.lock().unwrap();
                    let first = raw.pixels()[0];
                    assert!(raw.pixels().iter().all(|b| *b == first));
                }
                Err(Error::Timeout) if driver.is_finished() => {
                    if let Ok(frame) = pool.try_acquire_ready(CAMERA_TIMEOUT) {
                        last = frame.sequence();
                    }
                    break;
                }
                Err(Error::Timeout) => {}
                Err(err) => panic!("unexpected acquire error: {err}"),
            }
        }
        driver.join().unwrap();
        assert_eq!(last, 300);
    }
}
