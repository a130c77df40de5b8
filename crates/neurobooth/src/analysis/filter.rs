//! Zero-phase Butterworth band filtering
//!
//! A band is a fourth-order high-pass cascade at the lower edge followed by a
//! fourth-order low-pass cascade at the upper edge, each built from two
//! biquads with the Butterworth pole Q values. The cascade runs forward and
//! then backward over an odd-reflected padding of the signal, which cancels
//! the phase shift.

use std::f64::consts::PI;

/// Q of the two biquad sections of a fourth-order Butterworth filter
const BUTTERWORTH_Q: [f64; 2] = [0.541_196_100_146_197, 1.306_562_964_876_376_8];

/// Samples of odd reflection added at each end before filtering
const PAD_LEN: usize = 27;

/// Upper edges are kept below this fraction of the Nyquist frequency
const MAX_NYQUIST_FRACTION: f64 = 0.99;

/// A frequency band in Hz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub name: &'static str,
    pub low_hz: f64,
    pub high_hz: f64,
}

/// Delta, theta, alpha, beta and gamma, in that order
pub const BANDS: [Band; 5] = [
    Band { name: "delta", low_hz: 0.5, high_hz: 4.0 },
    Band { name: "theta", low_hz: 4.0, high_hz: 8.0 },
    Band { name: "alpha", low_hz: 8.0, high_hz: 13.0 },
    Band { name: "beta", low_hz: 13.0, high_hz: 30.0 },
    Band { name: "gamma", low_hz: 30.0, high_hz: 45.0 },
];

/// Look up a band by name
#[cfg(test)]
pub fn band(name: &str) -> Option<Band> {
    BANDS.iter().copied().find(|b| b.name == name)
}

/// Normalized second-order section (a0 = 1), transposed direct form II
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn low_pass(cutoff_hz: f64, sample_rate: f64, q: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff_hz, sample_rate, q);
        let a0 = 1.0 + alpha;
        let b = (1.0 - cos) / 2.0;
        Self {
            b0: b / a0,
            b1: 2.0 * b / a0,
            b2: b / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn high_pass(cutoff_hz: f64, sample_rate: f64, q: f64) -> Self {
        let (cos, alpha) = Self::prewarp(cutoff_hz, sample_rate, q);
        let a0 = 1.0 + alpha;
        let b = (1.0 + cos) / 2.0;
        Self {
            b0: b / a0,
            b1: -2.0 * b / a0,
            b2: b / a0,
            a1: -2.0 * cos / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn prewarp(cutoff_hz: f64, sample_rate: f64, q: f64) -> (f64, f64) {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        (w0.cos(), w0.sin() / (2.0 * q))
    }

    /// Filter `data` in place, starting from the steady state for a constant
    /// input equal to `data[0]`.
    fn run(&self, data: &mut [f64]) {
        let Some(&x0) = data.first() else {
            return;
        };
        let dc_gain = (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2);
        let y0 = x0 * dc_gain;
        let mut s2 = self.b2 * x0 - self.a2 * y0;
        let mut s1 = self.b1 * x0 - self.a1 * y0 + s2;

        for x in data.iter_mut() {
            let input = *x;
            let y = self.b0 * input + s1;
            s1 = self.b1 * input - self.a1 * y + s2;
            s2 = self.b2 * input - self.a2 * y;
            *x = y;
        }
    }
}

/// A band-pass cascade for one band at one sample rate
#[derive(Debug, Clone)]
pub struct BandPass {
    sections: Vec<Biquad>,
}

impl BandPass {
    /// Build the cascade, or `None` when the band lies above Nyquist.
    pub fn new(band: Band, sample_rate: f64) -> Option<Self> {
        let high = band.high_hz.min(sample_rate / 2.0 * MAX_NYQUIST_FRACTION);
        if !(band.low_hz > 0.0 && band.low_hz < high) {
            return None;
        }

        let mut sections = Vec::with_capacity(4);
        for q in BUTTERWORTH_Q {
            sections.push(Biquad::high_pass(band.low_hz, sample_rate, q));
        }
        for q in BUTTERWORTH_Q {
            sections.push(Biquad::low_pass(high, sample_rate, q));
        }
        Some(Self { sections })
    }

    fn run(&self, data: &mut [f64]) {
        for section in &self.sections {
            section.run(data);
        }
    }

    /// Forward-backward filter with odd-reflection padding.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        if n == 0 {
            return Vec::new();
        }
        let pad = PAD_LEN.min(n - 1);

        let mut ext = Vec::with_capacity(n + 2 * pad);
        let first = signal[0];
        let last = signal[n - 1];
        ext.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
        ext.extend_from_slice(signal);
        ext.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));

        self.run(&mut ext);
        ext.reverse();
        self.run(&mut ext);
        ext.reverse();

        ext[pad..pad + n].to_vec()
    }
}

/// Mean squared amplitude of `signal` after band filtering.
///
/// Bands that do not fit below Nyquist have zero power.
pub fn band_power(signal: &[f64], band: Band, sample_rate: f64) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let Some(filter) = BandPass::new(band, sample_rate) else {
        return 0.0;
    };
    let filtered = filter.filtfilt(signal);
    filtered.iter().map(|v| v * v).sum::<f64>() / filtered.len() as f64
}
