//! Captured frames and the bounded frame queue.
//!
//! - `Frame`: one captured image of one camera. Immutable once created; no `Clone`.
//! - `FrameQueue`: bounded buffer shared by every camera worker and the evaluation pool.
//!
//! The queue keeps one lane per camera. Each lane holds at most `capacity` frames, so
//! the queue as a whole never holds more than `capacity x cameras` frames. Dequeue is
//! round-robin across lanes, and a lane is leased to a single consumer at a time:
//! frames of one camera are evaluated strictly in capture order while a slow camera
//! can never starve the others.
//!
//! Saturation policy: a producer facing a full lane waits up to its enqueue timeout,
//! then the OLDEST frame of that lane is dropped and the new frame is admitted.
//! Fresh frames matter more than a complete history.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default per-camera lane capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured frame. Fields are private so a frame cannot be mutated after capture.
pub struct Frame {
    camera_id: String,
    sequence: u64,
    captured_at: DateTime<Utc>,
    image: RgbImage,
}

// Explicitly NOT implementing Clone: a frame is owned by exactly one stage at a time.

impl Frame {
    pub fn new(
        camera_id: impl Into<String>,
        sequence: u64,
        captured_at: DateTime<Utc>,
        image: RgbImage,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            sequence,
            captured_at,
            image,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Per-camera capture counter, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Capture time as fractional seconds since the Unix epoch.
    pub fn timestamp_secs(&self) -> f64 {
        self.captured_at.timestamp_micros() as f64 / 1_000_000.0
    }

    /// Raw pixel byte length (for queue memory tracking).
    pub fn byte_len(&self) -> usize {
        self.image.as_raw().len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameQueue
// ----------------------------------------------------------------------------

/// Result of offering a frame to the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Admitted without loss.
    Enqueued,
    /// The lane stayed full past the timeout; its oldest frame was dropped.
    DroppedOldest,
    /// The queue is closed; the frame was discarded.
    Closed,
}

/// Per-camera queue statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaneStats {
    pub camera_id: String,
    pub depth: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub bytes: usize,
}

/// Snapshot of the whole queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub lanes: Vec<LaneStats>,
}

impl QueueStats {
    pub fn depth(&self) -> usize {
        self.lanes.iter().map(|l| l.depth).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.lanes.iter().map(|l| l.dropped).sum()
    }

    pub fn bytes(&self) -> usize {
        self.lanes.iter().map(|l| l.bytes).sum()
    }
}

struct Lane {
    camera_id: String,
    frames: VecDeque<Frame>,
    leased: bool,
    enqueued: u64,
    dropped: u64,
}

struct QueueState {
    lanes: Vec<Lane>,
    cursor: usize,
    closed: bool,
}

impl QueueState {
    fn lane_index(&self, camera_id: &str) -> Option<usize> {
        self.lanes.iter().position(|l| l.camera_id == camera_id)
    }

    /// Next lane with a frame and no outstanding lease, round-robin from the cursor.
    fn next_ready_lane(&mut self) -> Option<usize> {
        let n = self.lanes.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            let lane = &self.lanes[idx];
            if !lane.leased && !lane.frames.is_empty() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn depth(&self) -> usize {
        self.lanes.iter().map(|l| l.frames.len()).sum()
    }
}

/// Bounded, per-camera-fair frame queue.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    frame_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue with one lane per camera, each holding at most `capacity` frames.
    pub fn new<I, S>(cameras: I, capacity: usize) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if capacity == 0 {
            return Err(anyhow!("frame queue capacity must be at least 1"));
        }
        let mut lanes: Vec<Lane> = Vec::new();
        for camera in cameras {
            let camera_id = camera.into();
            if lanes.iter().any(|l| l.camera_id == camera_id) {
                return Err(anyhow!("duplicate camera '{}' in frame queue", camera_id));
            }
            lanes.push(Lane {
                camera_id,
                frames: VecDeque::with_capacity(capacity),
                leased: false,
                enqueued: 0,
                dropped: 0,
            });
        }
        if lanes.is_empty() {
            return Err(anyhow!("frame queue needs at least one camera"));
        }
        Ok(Self {
            state: Mutex::new(QueueState {
                lanes,
                cursor: 0,
                closed: false,
            }),
            frame_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a frame, waiting at most `timeout` for room in its camera's lane.
    ///
    /// Never blocks past `timeout`. Errors only for a camera without a lane.
    pub fn push(&self, frame: Frame, timeout: Duration) -> Result<EnqueueOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        let idx = state
            .lane_index(frame.camera_id())
            .ok_or_else(|| anyhow!("no queue lane for camera '{}'", frame.camera_id()))?;

        loop {
            if state.closed {
                return Ok(EnqueueOutcome::Closed);
            }
            let lane = &mut state.lanes[idx];
            if lane.frames.len() < self.capacity {
                lane.frames.push_back(frame);
                lane.enqueued += 1;
                self.frame_ready.notify_one();
                return Ok(EnqueueOutcome::Enqueued);
            }

            let now = Instant::now();
            if now >= deadline {
                let evicted = lane.frames.pop_front();
                lane.frames.push_back(frame);
                lane.enqueued += 1;
                lane.dropped += 1;
                if let Some(evicted) = evicted {
                    log::debug!(
                        "frame queue full for {}: dropped frame #{}",
                        lane.camera_id,
                        evicted.sequence()
                    );
                }
                self.frame_ready.notify_one();
                return Ok(EnqueueOutcome::DroppedOldest);
            }

            let (guard, _) = self
                .space_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Take the next frame, waiting at most `timeout`.
    ///
    /// The returned lease keeps the frame's camera lane reserved until it is dropped.
    pub fn pop(&self, timeout: Duration) -> Option<FrameLease<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(idx) = state.next_ready_lane() {
                let lane = &mut state.lanes[idx];
                if let Some(frame) = lane.frames.pop_front() {
                    lane.leased = true;
                    self.space_ready.notify_all();
                    return Some(FrameLease {
                        queue: self,
                        lane: idx,
                        frame,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline || (state.closed && state.depth() == 0) {
                return None;
            }
            let (guard, _) = self
                .frame_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn release(&self, lane: usize) {
        let mut state = self.lock();
        if let Some(lane) = state.lanes.get_mut(lane) {
            lane.leased = false;
        }
        self.frame_ready.notify_all();
    }

    /// Stop admitting frames. Queued frames stay available to consumers.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.frame_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Closed and empty: nothing more will ever be dequeued.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.closed && state.depth() == 0
    }

    pub fn len(&self) -> usize {
        self.lock().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            lanes: state
                .lanes
                .iter()
                .map(|l| LaneStats {
                    camera_id: l.camera_id.clone(),
                    depth: l.frames.len(),
                    enqueued: l.enqueued,
                    dropped: l.dropped,
                    bytes: l.frames.iter().map(Frame::byte_len).sum(),
                })
                .collect(),
        }
    }
}

/// A dequeued frame. Dropping the lease frees its camera lane for the next consumer.
pub struct FrameLease<'a> {
    queue: &'a FrameQueue,
    lane: usize,
    frame: Frame,
}

impl Deref for FrameLease<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        self.queue.release(self.lane);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_frame(camera: &str, sequence: u64) -> Frame {
        Frame::new(camera, sequence, Utc::now(), RgbImage::new(4, 4))
    }

    #[test]
    fn saturated_lane_drops_oldest_frames() -> Result<()> {
        let queue = FrameQueue::new(["a"], 5)?;
        let mut drops = 0;
        for seq in 0..10 {
            if queue.push(make_frame("a", seq), Duration::ZERO)? == EnqueueOutcome::DroppedOldest {
                drops += 1;
            }
        }
        assert_eq!(drops, 5);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.stats().dropped(), 5);

        let mut kept = Vec::new();
        while let Some(lease) = queue.pop(Duration::ZERO) {
            kept.push(lease.sequence());
        }
        assert_eq!(kept, vec![5, 6, 7, 8, 9]);
        Ok(())
    }

    #[test]
    fn full_lane_push_is_bounded_by_timeout() -> Result<()> {
        let queue = FrameQueue::new(["a"], 1)?;
        queue.push(make_frame("a", 1), Duration::ZERO)?;

        let started = Instant::now();
        let outcome = queue.push(make_frame("a", 2), Duration::from_millis(50))?;
        let waited = started.elapsed();

        assert_eq!(outcome, EnqueueOutcome::DroppedOldest);
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));
        assert_eq!(queue.len(), 1);
        Ok(())
    }

    #[test]
    fn blocked_producer_resumes_when_consumer_drains() -> Result<()> {
        let queue = Arc::new(FrameQueue::new(["a"], 1)?);
        queue.push(make_frame("a", 1), Duration::ZERO)?;

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.pop(Duration::from_secs(1)).map(|lease| lease.sequence())
            })
        };

        let outcome = queue.push(make_frame("a", 2), Duration::from_secs(5))?;
        assert_eq!(outcome, EnqueueOutcome::Enqueued);
        assert_eq!(consumer.join().unwrap(), Some(1));
        Ok(())
    }

    #[test]
    fn dequeue_is_round_robin_across_cameras() -> Result<()> {
        let queue = FrameQueue::new(["a", "b"], 5)?;
        for seq in 0..4 {
            queue.push(make_frame("a", seq), Duration::ZERO)?;
        }
        queue.push(make_frame("b", 0), Duration::ZERO)?;

        let mut order = Vec::new();
        while let Some(lease) = queue.pop(Duration::ZERO) {
            order.push(lease.camera_id().to_string());
        }
        assert_eq!(order, vec!["a", "b", "a", "a", "a"]);
        Ok(())
    }

    #[test]
    fn leased_lane_is_not_handed_out_twice() -> Result<()> {
        let queue = FrameQueue::new(["a", "b"], 5)?;
        queue.push(make_frame("a", 1), Duration::ZERO)?;
        queue.push(make_frame("a", 2), Duration::ZERO)?;
        queue.push(make_frame("b", 1), Duration::ZERO)?;

        let first = queue.pop(Duration::ZERO).unwrap();
        assert_eq!(first.camera_id(), "a");
        let second = queue.pop(Duration::ZERO).unwrap();
        assert_eq!(second.camera_id(), "b");
        assert!(queue.pop(Duration::ZERO).is_none());

        drop(first);
        let third = queue.pop(Duration::ZERO).unwrap();
        assert_eq!((third.camera_id(), third.sequence()), ("a", 2));
        Ok(())
    }

    #[test]
    fn closed_queue_rejects_new_frames_but_drains() -> Result<()> {
        let queue = FrameQueue::new(["a"], 2)?;
        queue.push(make_frame("a", 1), Duration::ZERO)?;
        queue.close();

        assert_eq!(
            queue.push(make_frame("a", 2), Duration::ZERO)?,
            EnqueueOutcome::Closed
        );
        assert!(!queue.is_drained());
        assert_eq!(queue.pop(Duration::ZERO).map(|l| l.sequence()), Some(1));
        assert!(queue.is_drained());
        assert!(queue.pop(Duration::from_secs(1)).is_none());
        Ok(())
    }

    #[test]
    fn unknown_camera_is_an_error() -> Result<()> {
        let queue = FrameQueue::new(["a"], 2)?;
        assert!(queue.push(make_frame("zzz", 1), Duration::ZERO).is_err());
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(FrameQueue::new(["a"], 0).is_err());
    }
}
