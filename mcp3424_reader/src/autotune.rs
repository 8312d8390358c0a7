use mcp342x::{Gain, Resolution};

/// Codes reserved at each end of the range before the signal counts as saturated.
const MARGIN_FRACTION: f64 = 0.01;

/// Saturation limits `(lower, upper)` for a resolution.
pub fn limits(resolution: Resolution) -> (f64, f64) {
    let span = resolution.span() as f64;
    let upper = span / 2.0 - span * MARGIN_FRACTION;
    (-upper, upper)
}

/// Pick the gain for the next conversion from the last raw code.
///
/// Moves at most one step per call: down when the code is close to either end of the
/// range, up when the code would still fit after doubling.
pub fn next_gain(raw_code: i32, resolution: Resolution, gain: Gain) -> Gain {
    let (lower, upper) = limits(resolution);
    let code = raw_code as f64;

    if code > upper || code < lower {
        if let Some(lower_gain) = gain.step_down() {
            return lower_gain;
        }
    } else if code < upper / 2.0 && code > lower / 2.0 {
        if let Some(higher_gain) = gain.step_up() {
            return higher_gain;
        }
    }
    gain
}
