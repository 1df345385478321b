//! Session configuration.
//!
//! Loaded from JSON; anything missing takes its default and anything out of
//! range is clamped (with a warning) rather than rejected.

use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::dsp::gain_controller::ParamRange;
use crate::dsp::GainParameters;

pub const SWITCH_RAMP_SECONDS_RANGE: ParamRange = ParamRange { min: 0.0, max: 1.0 };

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub gain: GainParameters,
    /// Length of the raw/processed crossfade on enable/disable. 0 switches
    /// at the next render quantum.
    pub switch_ramp_seconds: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gain: GainParameters::DEFAULT,
            switch_ramp_seconds: 0.0,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: EngineConfig =
            serde_json::from_str(json).context("Failed to parse engine config JSON")?;
        Ok(raw.validated())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config '{}'", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Invalid engine config '{}'", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize engine config")
    }

    /// Copy with every value clamped into range.
    pub fn validated(&self) -> Self {
        let clamped = Self {
            gain: self.gain.clamped(),
            switch_ramp_seconds: SWITCH_RAMP_SECONDS_RANGE.clamp(self.switch_ramp_seconds, 0.0),
        };
        if clamped != *self {
            warn!("Engine config out of range, using {clamped:?} instead of {self:?}");
        }
        clamped
    }
}
