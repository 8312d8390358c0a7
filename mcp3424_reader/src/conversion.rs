//! Raw code to voltage conversion through the input divider.
//!
//! Each port measures across R2 of an R1/R2 divider. The ideal divider equation gives
//! `volt`; `true_v` additionally accounts for the ADC's own input impedance `Rl`, which
//! sits in parallel with R2.

use mcp342x::{Gain, Resolution};

use crate::calibration::CalibrationTable;
use crate::Error;

/// Input divider of one port. `r1 == 0` means no divider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Divider {
    /// Upper resistor in ohms.
    pub r1: f64,
    /// Lower resistor in ohms, across the ADC input.
    pub r2: f64,
}

impl Divider {
    pub fn is_active(&self) -> bool {
        self.r1 > 0.0
    }
}

/// Voltages and currents derived from one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading {
    pub raw_code: i32,
    /// Voltage at the ADC pins.
    pub adc_v: f64,
    /// Ideal divider estimate of the external voltage.
    pub volt: f64,
    /// Load-compensated estimate of the external voltage.
    pub true_v: f64,
    /// Modeled (or back-calculated) ADC load resistance.
    pub rl: f64,
    pub i: f64,
    pub true_i: f64,
    /// Current through R1 implied by the calibration voltage, 0 when not calibrating.
    pub cal_i: f64,
}

/// Voltage at the ADC input for a raw code.
pub fn adc_voltage(raw_code: i32, resolution: Resolution, gain: Gain) -> f64 {
    raw_code as f64 * resolution.lsb() / gain.factor() as f64
}

/// Convert a raw code taken at `gain` into a [`Reading`].
///
/// `calibrate_v` is a known external voltage; when given, `rl` is back-calculated from
/// it instead of taken from the load model. Without a divider there is nothing to
/// back-calculate from and `calibrate_v` is ignored.
pub fn convert(
    raw_code: i32,
    resolution: Resolution,
    gain: Gain,
    divider: Divider,
    table: &CalibrationTable,
    calibrate_v: Option<f64>,
) -> Result<Reading, Error> {
    let adc_v = adc_voltage(raw_code, resolution, gain);
    let mut rl = table.lookup(resolution, gain)?.load_resistance(adc_v);

    let (i, volt, true_i, true_v);
    if divider.is_active() {
        i = adc_v / divider.r2;
        volt = i * (divider.r1 + divider.r2);
        let true_r2 = 1.0 / (1.0 / divider.r2 + 1.0 / rl);
        true_i = adc_v / true_r2;
        true_v = true_i * (divider.r1 + true_r2);
    } else {
        i = adc_v / rl;
        true_i = i;
        volt = adc_v;
        true_v = adc_v;
    }

    // the back-calculation needs the current through R1
    let mut cal_i = 0.0;
    if let Some(known) = calibrate_v.filter(|_| divider.is_active()) {
        let drop = known - adc_v;
        if drop != 0.0 {
            let r_tot = adc_v / (drop / divider.r1);
            cal_i = drop / divider.r1;
            rl = (r_tot * divider.r2) / (divider.r2 - r_tot);
        } else {
            rl = 0.0;
        }
    }

    Ok(Reading { raw_code, adc_v, volt, true_v, rl, i, true_i, cal_i })
}
