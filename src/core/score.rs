//! Translation of raw checker scores (0..=100) into the points of a case.

pub const MAX_RAW_SCORE: f64 = 100.0;

pub fn clamp_raw(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, MAX_RAW_SCORE)
    }
}

pub fn real_score(raw: f64, max_score: f64) -> f64 {
    clamp_raw(raw) * max_score / MAX_RAW_SCORE
}
