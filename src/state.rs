//! Recording state machine.
//!
//! The state lives inside the main queue's lock as its admission policy, so
//! every admission decision and every transition it causes is serialized
//! with the writes it guards.

use std::fmt;

use crate::error::Result;
use crate::frame::RecordHeader;
use crate::queue::{Admission, CyclicQueue, Ring};

/// Recorder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Capture is off and no queues are allocated.
    Disabled,
    /// Capture runs into a sliding pre-record buffer.
    Monitoring,
    /// Fragments are kept until delivered.
    Recording,
    /// The main queue overflowed; frames are dropped until the next
    /// fragment start.
    Paused,
}

impl RecorderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderState::Disabled => "Disabled",
            RecorderState::Monitoring => "Monitoring",
            RecorderState::Recording => "Recording",
            RecorderState::Paused => "Paused",
        }
    }

    /// Recording or paused: a trigger is active.
    pub fn is_active(&self) -> bool {
        matches!(self, RecorderState::Recording | RecorderState::Paused)
    }
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission policy of the main queue.
#[derive(Debug)]
pub struct StateMachine {
    state: RecorderState,
    /// Queue position of the most recent fragment-start record.
    fragment_start: Option<usize>,
    /// Frames older than `now - prebuffer_margin` are dropped in Monitoring.
    prebuffer_margin: u64,
}

impl StateMachine {
    pub fn new(prebuffer_margin: u64) -> Self {
        Self {
            state: RecorderState::Disabled,
            fragment_start: None,
            prebuffer_margin,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn set_state(&mut self, state: RecorderState) {
        if self.state != state {
            tracing::info!("Camera recorder set to {}", state);
            self.state = state;
        }
    }

    fn admit_monitoring(&mut self, ring: &mut Ring, header: &RecordHeader) -> bool {
        // Slide the pre-record window; frames inside it are never dropped.
        if let Some(limit) = header.sample_time.checked_sub(self.prebuffer_margin) {
            while let Some(oldest) = ring.oldest() {
                if oldest.sample_time >= limit {
                    break;
                }
                if self.fragment_start == Some(ring.tail()) {
                    self.fragment_start = None;
                }
                ring.discard_oldest();
            }
        }
        ring.fits(header.record_len())
    }

    fn admit_recording(&mut self, ring: &mut Ring, header: &RecordHeader) -> bool {
        if ring.fits(header.record_len()) {
            return true;
        }
        // Drop the incomplete fragment and wait for the next fragment start.
        match self.fragment_start {
            Some(pos) => ring.truncate(pos),
            None => ring.clear(),
        }
        self.set_state(RecorderState::Paused);
        false
    }
}

impl Admission for StateMachine {
    fn admit(&mut self, ring: &mut Ring, header: &mut RecordHeader) -> Result<bool> {
        if header.sample_type.is_fragment_start() {
            self.fragment_start = Some(ring.head());
            if self.state == RecorderState::Paused {
                self.set_state(RecorderState::Recording);
                header.sample_type = header.sample_type.with_restart();
            }
        }

        Ok(match self.state {
            RecorderState::Monitoring => self.admit_monitoring(ring, header),
            RecorderState::Recording => self.admit_recording(ring, header),
            RecorderState::Paused | RecorderState::Disabled => false,
        })
    }
}

/// The main recording queue.
pub type MainQueue = CyclicQueue<StateMachine>;

impl CyclicQueue<StateMachine> {
    pub fn state(&self) -> RecorderState {
        self.with_policy(|machine, _| machine.state())
    }

    pub fn set_state(&self, state: RecorderState) {
        self.with_policy(|machine, _| machine.set_state(state));
    }

    /// Move from `from` to `to`; returns whether the transition happened.
    pub fn transition(&self, from: RecorderState, to: RecorderState) -> bool {
        self.with_policy(|machine, _| {
            if machine.state() == from {
                machine.set_state(to);
                true
            } else {
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{nal_unit_type, SampleType};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const MS: u64 = 1_000_000;

    fn key() -> SampleType {
        SampleType::video(nal_unit_type::IDR_SLICE).with_fragment_start()
    }

    fn slice() -> SampleType {
        SampleType::video(nal_unit_type::NON_IDR_SLICE)
    }

    fn times(queue: &MainQueue) -> Vec<u64> {
        let mut cursor = queue.begin_scan();
        std::iter::from_fn(|| queue.scan_frame(&mut cursor))
            .map(|h| h.sample_time)
            .collect()
    }

    #[test]
    fn test_disabled_drops_everything() {
        let queue = MainQueue::new("main", 1024, StateMachine::new(0));
        assert!(!queue.put(0, key(), &[0x65]).unwrap());
        assert!(queue.is_empty());
        assert_eq!(queue.state(), RecorderState::Disabled);
    }

    #[test]
    fn test_monitoring_slides_prebuffer_window() {
        let queue = MainQueue::new("main", 4096, StateMachine::new(100 * MS));
        queue.set_state(RecorderState::Monitoring);

        for t in (0..=300).step_by(50) {
            assert!(queue.put(t * MS, SampleType::AUDIO, &[0u8; 8]).unwrap());
        }
        // Only frames within 100 ms of the newest remain.
        assert_eq!(times(&queue), vec![200 * MS, 250 * MS, 300 * MS]);
    }

    #[test]
    fn test_monitoring_never_discards_prebuffer() {
        let queue = MainQueue::new("main", 200, StateMachine::new(1000 * MS));
        queue.set_state(RecorderState::Monitoring);

        let mut accepted = Vec::new();
        for t in 0..10u64 {
            if queue.put(t * MS, SampleType::AUDIO, &[0u8; 40]).unwrap() {
                accepted.push(t * MS);
            }
        }
        // Everything is inside the window, so new frames are refused instead.
        assert_eq!(times(&queue), accepted);
        assert_eq!(accepted, vec![0, MS, 2 * MS]);
    }

    #[test]
    fn test_prebuffer_retention_randomized() {
        let mut rng = StdRng::seed_from_u64(42);
        let margin = 300 * MS;
        let queue = MainQueue::new("main", 3000, StateMachine::new(margin));
        queue.set_state(RecorderState::Monitoring);

        let mut now = 0u64;
        let mut kept: Vec<u64> = Vec::new();
        for _ in 0..2000 {
            now += rng.random_range(1..40) * MS;
            let len = rng.random_range(1..200);
            if queue.put(now, SampleType::AUDIO, &vec![0u8; len]).unwrap() {
                kept.push(now);
            }
            let present = times(&queue);
            for t in kept.iter().filter(|&&t| t + margin >= now) {
                assert!(present.contains(t), "frame {} inside the prebuffer was dropped", t);
            }
        }
    }

    #[test]
    fn test_recording_overflow_pauses_and_rolls_back() {
        let queue = MainQueue::new("main", 300, StateMachine::new(0));
        queue.set_state(RecorderState::Recording);

        assert!(queue.put(0, key(), &[0x65; 20]).unwrap());
        assert!(queue.put(MS, slice(), &[0x41; 20]).unwrap());
        assert!(queue.put(2 * MS, key(), &[0x65; 20]).unwrap());
        assert!(queue.put(3 * MS, slice(), &[0x41; 20]).unwrap());
        assert!(queue.put(4 * MS, slice(), &[0x41; 20]).unwrap());

        // Next frame does not fit: the fragment started at 2 ms is dropped.
        assert!(!queue.put(5 * MS, slice(), &[0x41; 80]).unwrap());
        assert_eq!(queue.state(), RecorderState::Paused);
        assert_eq!(times(&queue), vec![0, MS]);

        // Paused ignores everything but a fragment start.
        assert!(!queue.put(6 * MS, slice(), &[0x41; 4]).unwrap());
        assert!(!queue.put(6 * MS, SampleType::AUDIO, &[0; 4]).unwrap());

        assert!(queue.put(7 * MS, key(), &[0x65; 4]).unwrap());
        assert_eq!(queue.state(), RecorderState::Recording);

        let mut cursor = queue.begin_scan();
        let restarted: Vec<RecordHeader> = std::iter::from_fn(|| queue.scan_frame(&mut cursor)).collect();
        assert_eq!(restarted.len(), 3);
        assert!(restarted[2].sample_type.is_restart());
        assert!(!restarted[0].sample_type.is_restart());
    }

    #[test]
    fn test_rollback_after_fragment_start_was_trimmed() {
        let queue = MainQueue::new("main", 200, StateMachine::new(10 * MS));
        queue.set_state(RecorderState::Monitoring);
        queue.put(0, key(), &[0x65; 10]).unwrap();
        // The key frame slides out of the window.
        queue.put(20 * MS, slice(), &[0x41; 10]).unwrap();
        queue.put(25 * MS, slice(), &[0x41; 10]).unwrap();

        queue.set_state(RecorderState::Recording);
        assert!(!queue.put(30 * MS, slice(), &[0x41; 150]).unwrap());
        // Nothing in the queue belongs to a complete fragment.
        assert!(queue.is_empty());
        assert_eq!(queue.state(), RecorderState::Paused);
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let queue = MainQueue::new("main", 1024, StateMachine::new(0));
        assert!(!queue.transition(RecorderState::Monitoring, RecorderState::Recording));
        queue.set_state(RecorderState::Monitoring);
        assert!(queue.transition(RecorderState::Monitoring, RecorderState::Recording));
        assert_eq!(queue.state(), RecorderState::Recording);
        assert!(RecorderState::Paused.is_active());
        assert_eq!(RecorderState::Paused.to_string(), "Paused");
    }
}
