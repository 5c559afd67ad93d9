pub const DEFAULT_DECAY_DAYS: u32 = 30;

// An observation's weight halves every `decay_days` runs.
pub fn alpha_for_decay(decay_days: u32) -> f64 {
    let days = decay_days.max(1) as f64;
    1.0 - 2f64.powf(-1.0 / days)
}

pub fn blend(previous: f64, observation: f64, alpha: f64) -> f64 {
    alpha * observation + (1.0 - alpha) * previous
}
