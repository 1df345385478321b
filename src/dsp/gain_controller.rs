//! Block-Rate Auto Gain Control
//!
//! # Perceptual Contract
//! - **Target Source**: Any live program material (speech, music, mixed).
//! - **Intended Effect**: Pull the short-term level toward a target RMS and add a
//!   constant "floor" lift so quiet material is always perceptibly louder.
//! - **Failure Modes**:
//!   - Slow pumping if attack/release are set much shorter than the defaults.
//!   - Noise floor is raised during long pauses (silence asks for max boost).
//! - **Will Not Do**:
//!   - LUFS gating or K-weighting (plain RMS of channel 0 is the loudness proxy).
//!   - Per-channel correction (one gain for every channel).
//!   - Peak control (handled by the downstream limiter).
//!
//! # Block Semantics
//! One gain value is computed per block and applied uniformly to the block.
//! The time-constant formula `exp(-1 / (tau * fs))` is evaluated once per block,
//! so the effective smoothing depends on the render quantum; the routing layer
//! always feeds fixed 128-frame quanta.

use serde::{Deserialize, Serialize};

use crate::dsp::utils::{
    db_to_lin, frame_rms, lin_to_db, sanitize_sample_rate, time_constant_coeff,
};

// =============================================================================
// Parameter ranges
// =============================================================================

/// Inclusive range for a block-rate parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamRange {
    pub min: f32,
    pub max: f32,
}

impl ParamRange {
    const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Clamp into range; non-finite input falls back to `default`.
    #[inline]
    pub fn clamp(&self, value: f32, default: f32) -> f32 {
        if value.is_finite() {
            value.max(self.min).min(self.max)
        } else {
            default
        }
    }
}

pub const TARGET_RMS_RANGE: ParamRange = ParamRange::new(0.0001, 1.0);
pub const MAX_BOOST_DB_RANGE: ParamRange = ParamRange::new(0.0, 24.0);
pub const MAX_CUT_DB_RANGE: ParamRange = ParamRange::new(0.0, 24.0);
pub const FLOOR_BOOST_DB_RANGE: ParamRange = ParamRange::new(0.0, 24.0);
pub const ATTACK_SECONDS_RANGE: ParamRange = ParamRange::new(0.01, 4.0);
pub const RELEASE_SECONDS_RANGE: ParamRange = ParamRange::new(0.01, 8.0);

// =============================================================================
// Data model
// =============================================================================

/// Block-rate ("k-rate") controls of the gain controller.
///
/// Read once at block start and held for the whole block.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainParameters {
    /// Target loudness as a linear RMS amplitude (0.075 is roughly -22.5 dBFS RMS).
    pub target_rms: f32,
    pub max_boost_db: f32,
    pub max_cut_db: f32,
    /// Unconditional lift added on top of the measured correction.
    pub floor_boost_db: f32,
    pub attack_seconds: f32,
    pub release_seconds: f32,
}

impl Default for GainParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl GainParameters {
    pub const DEFAULT: GainParameters = GainParameters {
        target_rms: 0.075,
        max_boost_db: 9.0,
        max_cut_db: 6.0,
        floor_boost_db: 4.0,
        attack_seconds: 0.25,
        release_seconds: 0.50,
    };

    /// Copy with every field forced into its documented range.
    pub fn clamped(&self) -> Self {
        let d = Self::DEFAULT;
        Self {
            target_rms: TARGET_RMS_RANGE.clamp(self.target_rms, d.target_rms),
            max_boost_db: MAX_BOOST_DB_RANGE.clamp(self.max_boost_db, d.max_boost_db),
            max_cut_db: MAX_CUT_DB_RANGE.clamp(self.max_cut_db, d.max_cut_db),
            floor_boost_db: FLOOR_BOOST_DB_RANGE.clamp(self.floor_boost_db, d.floor_boost_db),
            attack_seconds: ATTACK_SECONDS_RANGE.clamp(self.attack_seconds, d.attack_seconds),
            release_seconds: RELEASE_SECONDS_RANGE.clamp(self.release_seconds, d.release_seconds),
        }
    }
}

/// Numeric state carried from block to block.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcessorState {
    /// Smoothed RMS (linear, >= 0).
    pub smoothed_rms: f32,
    /// Gain actually applied to the last block (dB).
    pub current_gain_db: f32,
    /// Clamped correction the smoother is moving toward (dB).
    pub target_gain_db: f32,
}

/// Why a block produced silence instead of processed audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SilenceReason {
    /// No input channel, or channel 0 has zero frames.
    MissingInput,
    /// An input channel contains NaN or infinite samples.
    NonFiniteInput,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BlockStatus {
    Processed { gain: f32 },
    Silenced(SilenceReason),
}

/// A stage that turns one input block into one output block.
///
/// Implementations must not block or allocate and must never fail: degenerate
/// input degrades to silence and is reported through [`BlockStatus`].
pub trait AudioBlockProcessor {
    type Params;

    fn process_block(
        &mut self,
        input: &[&[f32]],
        output: &mut [&mut [f32]],
        params: &Self::Params,
    ) -> BlockStatus;
}

// =============================================================================
// Gain Controller
// =============================================================================

pub struct GainController {
    state: ProcessorState,
    sample_rate: f32,
}

impl GainController {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            state: ProcessorState::default(),
            sample_rate: sanitize_sample_rate(sample_rate),
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Advance the state by one block with the given block RMS.
    /// Returns the linear gain for the block.
    fn update(&mut self, rms_block: f32, params: &GainParameters) -> f32 {
        let attack = time_constant_coeff(params.attack_seconds, self.sample_rate);
        let release = time_constant_coeff(params.release_seconds, self.sample_rate);
        let st = &mut self.state;

        // RMS smoothing always runs on the attack constant.
        st.smoothed_rms = (1.0 - attack) * rms_block + attack * st.smoothed_rms;

        let current_db = lin_to_db(st.smoothed_rms);
        let target_db = lin_to_db(params.target_rms);
        let needed_db = target_db - current_db + params.floor_boost_db;

        // min/max rather than f32::clamp: unvalidated params must not panic
        st.target_gain_db = needed_db.min(params.max_boost_db).max(-params.max_cut_db);

        let coeff = if st.target_gain_db > st.current_gain_db {
            attack
        } else {
            release
        };
        st.current_gain_db = (1.0 - coeff) * st.target_gain_db + coeff * st.current_gain_db;

        db_to_lin(st.current_gain_db)
    }
}

fn fill_silence(output: &mut [&mut [f32]]) {
    for ch in output.iter_mut() {
        ch.fill(0.0);
    }
}

impl AudioBlockProcessor for GainController {
    type Params = GainParameters;

    fn process_block(
        &mut self,
        input: &[&[f32]],
        output: &mut [&mut [f32]],
        params: &GainParameters,
    ) -> BlockStatus {
        let reference = match input.first() {
            Some(ch) if !ch.is_empty() => *ch,
            _ => {
                fill_silence(output);
                return BlockStatus::Silenced(SilenceReason::MissingInput);
            }
        };

        let rms_block = frame_rms(reference);
        let other_channels_finite = input
            .iter()
            .skip(1)
            .all(|ch| ch.iter().all(|s| s.is_finite()));
        if !rms_block.is_finite() || !other_channels_finite {
            fill_silence(output);
            return BlockStatus::Silenced(SilenceReason::NonFiniteInput);
        }

        let gain = self.update(rms_block, params);
        let frames = reference.len();

        for (ch, out) in output.iter_mut().enumerate() {
            // Missing channels reuse channel 0.
            let src = match input.get(ch) {
                Some(c) if !c.is_empty() => *c,
                _ => reference,
            };
            for (i, o) in out.iter_mut().enumerate() {
                *o = if i < frames {
                    src.get(i).copied().unwrap_or(0.0) * gain
                } else {
                    0.0
                };
            }
        }

        BlockStatus::Processed { gain }
    }
}

// =============================================================================
// Tests
// =============================================================================
