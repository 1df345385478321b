//! Output Limiter
//!
//! # Perceptual Contract
//! - **Target Source**: Output of the gain controller, before the path gain.
//! - **Intended Effect**: Catch the overshoot that floor boost plus max boost can
//!   stack up, so the processed path does not clip.
//! - **Failure Modes**:
//!   - Audible crunch if driven far over threshold for long stretches.
//! - **Will Not Do**:
//!   - Makeup gain (loudness is owned by the gain controller).
//!   - Lookahead (a 3 ms attack lets the very first edge of a transient through).
//!
//! # Lifecycle
//! Parameters are session constants; there is no mutation API.

use serde::Serialize;

use crate::dsp::utils::{db_to_lin, lin_to_db, sanitize_sample_rate, time_constant_coeff};

/// Feed-forward dynamics parameters of the limiter stage.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LimiterConfig {
    pub threshold_db: f32,
    /// Knee width in dB; 0 is a hard knee.
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_seconds: f32,
    pub release_seconds: f32,
}

impl LimiterConfig {
    pub const DEFAULT: LimiterConfig = LimiterConfig {
        threshold_db: -3.0,
        knee_db: 0.0,
        ratio: 20.0,
        attack_seconds: 0.003,
        release_seconds: 0.150,
    };

    /// Static curve: gain reduction in dB (>= 0) for a detector level in dBFS.
    #[inline]
    fn reduction_db(&self, level_db: f32) -> f32 {
        let over_db = level_db - self.threshold_db;
        let slope = 1.0 - 1.0 / self.ratio.max(1.0);

        if self.knee_db <= 0.0 {
            return over_db.max(0.0) * slope;
        }

        let half = 0.5 * self.knee_db;
        if over_db <= -half {
            0.0
        } else if over_db >= half {
            over_db * slope
        } else {
            let x = over_db + half;
            (x * x) / (2.0 * self.knee_db) * slope
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Stereo-linked peak limiter with the fixed [`LimiterConfig::DEFAULT`] curve.
pub struct LimiterStage {
    config: LimiterConfig,
    attack_coeff: f32,
    release_coeff: f32,
    // Smoothed gain reduction (dB, >= 0)
    reduction_db: f32,
}

impl LimiterStage {
    pub fn new(sample_rate: f32) -> Self {
        let sr = sanitize_sample_rate(sample_rate);
        let config = LimiterConfig::DEFAULT;
        Self {
            attack_coeff: time_constant_coeff(config.attack_seconds, sr),
            release_coeff: time_constant_coeff(config.release_seconds, sr),
            config,
            reduction_db: 0.0,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Current gain reduction in dB (for metering).
    pub fn gain_reduction_db(&self) -> f32 {
        self.reduction_db
    }

    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }

    /// Limit `channels` in place. Every channel gets the same gain per frame.
    pub fn process(&mut self, channels: &mut [&mut [f32]]) {
        let frames = channels.iter().map(|c| c.len()).max().unwrap_or(0);

        for i in 0..frames {
            let mut peak = 0.0f32;
            for ch in channels.iter() {
                if let Some(&s) = ch.get(i) {
                    peak = peak.max(s.abs());
                }
            }

            let target = self.config.reduction_db(lin_to_db(peak));
            let coeff = if target > self.reduction_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.reduction_db = coeff * self.reduction_db + (1.0 - coeff) * target;

            let gain = db_to_lin(-self.reduction_db);
            for ch in channels.iter_mut() {
                if let Some(s) = ch.get_mut(i) {
                    *s *= gain;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_constants() {
        let c = *LimiterStage::new(48_000.0).config();
        assert_eq!(c.threshold_db, -3.0);
        assert_eq!(c.knee_db, 0.0);
        assert_eq!(c.ratio, 20.0);
        assert_eq!(c.attack_seconds, 0.003);
        assert_eq!(c.release_seconds, 0.150);
    }

    #[test]
    fn test_below_threshold_is_untouched() {
        let mut lim = LimiterStage::new(48_000.0);
        let mut l = vec![0.5f32; 4800];
        let mut r = vec![-0.4f32; 4800];
        {
            let mut chans: [&mut [f32]; 2] = [&mut l, &mut r];
            lim.process(&mut chans);
        }
        assert!(l.iter().all(|&s| s == 0.5));
        assert!(r.iter().all(|&s| s == -0.4));
        assert_eq!(lim.gain_reduction_db(), 0.0);
    }

    #[test]
    fn test_sustained_overshoot_is_pulled_to_threshold() {
        // 0 dBFS held for one second: 3 dB over, 20:1 -> about -2.85 dBFS out
        let mut lim = LimiterStage::new(48_000.0);
        let mut buf = vec![1.0f32; 48_000];
        {
            let mut chans: [&mut [f32]; 1] = [&mut buf];
            lim.process(&mut chans);
        }
        let settled = *buf.last().unwrap();
        let expected = db_to_lin(-3.0 + 3.0 / 20.0);
        assert!((settled - expected).abs() < 0.01, "settled at {settled}");
        assert!((lim.gain_reduction_db() - 2.85).abs() < 0.05);
    }

    #[test]
    fn test_linked_reduction_applies_to_quiet_channel() {
        let mut lim = LimiterStage::new(48_000.0);
        let mut loud = vec![1.0f32; 4800];
        let mut quiet = vec![0.1f32; 4800];
        {
            let mut chans: [&mut [f32]; 2] = [&mut loud, &mut quiet];
            lim.process(&mut chans);
        }
        let ratio = quiet[4799] / loud[4799];
        assert!((ratio - 0.1).abs() < 1e-5);
        assert!(quiet[4799] < 0.1);
    }

    #[test]
    fn test_release_after_overshoot() {
        let mut lim = LimiterStage::new(48_000.0);
        let mut hot = vec![1.0f32; 4800];
        {
            let mut chans: [&mut [f32]; 1] = [&mut hot];
            lim.process(&mut chans);
        }
        let held = lim.gain_reduction_db();
        let mut quiet = vec![0.1f32; 48_000];
        {
            let mut chans: [&mut [f32]; 1] = [&mut quiet];
            lim.process(&mut chans);
        }
        assert!(held > 2.0);
        assert!(lim.gain_reduction_db() < 0.01);
    }

    #[test]
    fn test_soft_knee_curve_is_continuous() {
        let cfg = LimiterConfig {
            knee_db: 6.0,
            ..LimiterConfig::DEFAULT
        };
        let below = cfg.reduction_db(cfg.threshold_db - 3.0);
        let above = cfg.reduction_db(cfg.threshold_db + 3.0);
        assert_eq!(below, 0.0);
        assert!((above - 3.0 * (1.0 - 1.0 / 20.0)).abs() < 1e-5);
        assert!(cfg.reduction_db(cfg.threshold_db) > 0.0);
    }
}
