//! Thread-safe metering for the processed path.
//!
//! The renderer publishes the gain controller state after every render
//! quantum; the control side reads it without locks. Values are stored as
//! `f32` bit patterns in `AtomicU32`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::dsp::ProcessorState;

/// Point-in-time copy of [`GainMeters`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeterSnapshot {
    pub smoothed_rms: f32,
    pub current_gain_db: f32,
    pub target_gain_db: f32,
    pub limiter_reduction_db: f32,
    pub quanta_processed: u64,
}

impl MeterSnapshot {
    pub fn processor_state(&self) -> ProcessorState {
        ProcessorState {
            smoothed_rms: self.smoothed_rms,
            current_gain_db: self.current_gain_db,
            target_gain_db: self.target_gain_db,
        }
    }
}

#[derive(Default)]
pub struct GainMeters {
    smoothed_rms: AtomicU32,
    current_gain_db: AtomicU32,
    target_gain_db: AtomicU32,
    limiter_reduction_db: AtomicU32,
    quanta_processed: AtomicU64,
}

impl GainMeters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the audio thread once per processed quantum.
    pub fn publish(&self, state: &ProcessorState, limiter_reduction_db: f32) {
        self.smoothed_rms
            .store(state.smoothed_rms.to_bits(), Ordering::Relaxed);
        self.current_gain_db
            .store(state.current_gain_db.to_bits(), Ordering::Relaxed);
        self.target_gain_db
            .store(state.target_gain_db.to_bits(), Ordering::Relaxed);
        self.limiter_reduction_db
            .store(limiter_reduction_db.to_bits(), Ordering::Relaxed);
        self.quanta_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_current_gain_db(&self) -> f32 {
        f32::from_bits(self.current_gain_db.load(Ordering::Relaxed))
    }

    pub fn get_limiter_reduction_db(&self) -> f32 {
        f32::from_bits(self.limiter_reduction_db.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            smoothed_rms: f32::from_bits(self.smoothed_rms.load(Ordering::Relaxed)),
            current_gain_db: self.get_current_gain_db(),
            target_gain_db: f32::from_bits(self.target_gain_db.load(Ordering::Relaxed)),
            limiter_reduction_db: self.get_limiter_reduction_db(),
            quanta_processed: self.quanta_processed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_round_trips_state() {
        let meters = GainMeters::new();
        let state = ProcessorState {
            smoothed_rms: 0.02,
            current_gain_db: 7.5,
            target_gain_db: 9.0,
        };
        meters.publish(&state, 1.25);
        meters.publish(&state, 1.25);

        let snap = meters.snapshot();
        assert_eq!(snap.processor_state(), state);
        assert_eq!(snap.limiter_reduction_db, 1.25);
        assert_eq!(snap.quanta_processed, 2);
    }

    #[test]
    fn test_fresh_meters_read_zero() {
        assert_eq!(GainMeters::new().snapshot(), MeterSnapshot::default());
    }
}
