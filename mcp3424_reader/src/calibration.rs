//! Empirical ADC load model.
//!
//! The input impedance of the MCP3424 varies with the measured voltage, resolution and
//! gain. It was characterised by sampling known voltages through the divider and fitting
//! `Rl = c1 * |adcV|^2 + c2 * |adcV| + c3` for each (resolution, gain) pair.

use std::collections::HashMap;

use mcp342x::{Gain, Resolution};

use crate::Error;

/// Fitted coefficients for one (resolution, gain) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimConstants {
    pub c1: f64,
    pub c2: f64,
    pub c3: f64,
}

impl TrimConstants {
    /// Modeled load resistance in ohms at the given ADC input voltage.
    pub fn load_resistance(&self, adc_v: f64) -> f64 {
        let v = adc_v.abs();
        self.c1 * v * v + self.c2 * v + self.c3
    }
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    entries: HashMap<(Resolution, Gain), TrimConstants>,
}

impl CalibrationTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Coefficients measured on the reference expansion board.
    pub fn measured() -> Self {
        use Gain::*;
        use Resolution::*;
        const MEASURED: [(Resolution, Gain, f64, f64, f64); 16] = [
            (Bits12, G1, -7.29644998741772e+18, 1.8252066801568475e+19, -9.561470143248126e+18),
            (Bits12, G2, -1.4898381548524163e+19, 1.8452580931431174e+19, -4.805276209813626e+18),
            (Bits12, G4, -10118072.271809563, 6797352.007977883, -263832.86114829977),
            (Bits12, G8, -22986374.244420122, 7536052.779157299, -258788.32091889498),
            (Bits14, G1, -547128.0816393106, 1959171.5248400136, 413393.9108785477),
            (Bits14, G2, -1303354.7551292207, 2216492.26594754, 252631.72247966885),
            (Bits14, G4, -603659.535929856, 1058285.263214671, 238635.61023626427),
            (Bits14, G8, -321542.9453517512, 506255.5322955709, 174575.86010087654),
            (Bits16, G1, -538886.6327368342, 1929058.1036710313, 418277.36598391004),
            (Bits16, G2, -1093021.2089518933, 2078583.7929054706, 252687.99370679908),
            (Bits16, G4, -1025665.3681316198, 1238120.803775412, 229019.1443321319),
            (Bits16, G8, -354280.916034503, 517745.8280310895, 175604.3187191613),
            (Bits18, G1, -549702.5567547062, 1957717.4623683672, 387836.79665354657),
            (Bits18, G2, -1361374.6457417163, 2135565.100213241, 255336.17805034263),
            (Bits18, G4, -1245462.6278009678, 1159128.6214418625, 241634.35669704582),
            (Bits18, G8, 231079.04899498075, 389831.38249999925, 182839.62771505647),
        ];
        MEASURED
            .iter()
            .fold(Self::empty(), |table, &(res, gain, c1, c2, c3)| {
                table.with_entry(res, gain, TrimConstants { c1, c2, c3 })
            })
    }

    pub fn with_entry(mut self, resolution: Resolution, gain: Gain, constants: TrimConstants) -> Self {
        self.entries.insert((resolution, gain), constants);
        self
    }

    /// A missing pair is a configuration error for the whole run.
    pub fn lookup(&self, resolution: Resolution, gain: Gain) -> Result<TrimConstants, Error> {
        self.entries
            .get(&(resolution, gain))
            .copied()
            .ok_or(Error::MissingCalibration { bits: resolution.bits(), gain: gain.factor() })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
