/// Offset added before taking a logarithm so silence maps to a finite level.
pub const DB_EPS: f32 = 1e-8;

/// Shortest time constant accepted by [`time_constant_coeff`] (1 ms).
pub const MIN_TIME_CONSTANT_SEC: f32 = 0.001;

/// Sample rate assumed when the runtime reports something unusable.
pub const FALLBACK_SAMPLE_RATE: f32 = 48_000.0;

#[inline]
pub fn db_to_lin(db: f32) -> f32 {
    (10.0f32).powf(db / 20.0)
}

/// Amplitude to dBFS. `DB_EPS` keeps zero at roughly -160 dB instead of -inf.
#[inline]
pub fn lin_to_db(x: f32) -> f32 {
    20.0 * (x + DB_EPS).log10()
}

/// One-pole smoothing coefficient `exp(-1 / (tau * fs))`.
///
/// The time constant is floored at [`MIN_TIME_CONSTANT_SEC`] so that tiny or
/// zero values cannot blow up the division.
#[inline]
pub fn time_constant_coeff(tau_sec: f32, sample_rate: f32) -> f32 {
    let tau = if tau_sec.is_finite() {
        tau_sec.max(MIN_TIME_CONSTANT_SEC)
    } else {
        MIN_TIME_CONSTANT_SEC
    };
    (-1.0 / (tau * sample_rate)).exp()
}

pub fn sanitize_sample_rate(sample_rate: f32) -> f32 {
    if sample_rate.is_finite() && sample_rate > 0.0 {
        sample_rate
    } else {
        FALLBACK_SAMPLE_RATE
    }
}

pub fn frame_rms(x: &[f32]) -> f32 {
    let mut s = 0.0f32;
    for &v in x {
        s += v * v;
    }
    (s / (x.len().max(1) as f32)).sqrt()
}
