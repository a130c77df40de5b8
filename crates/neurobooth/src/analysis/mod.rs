//! Biometric analysis engine
//!
//! Turns a batch of 8-channel EEG samples into a bounded composite score from
//! three markers:
//! - frontal alpha asymmetry between channel 1 (left) and channel 2 (right)
//! - arousal from beta and gamma power averaged over all channels
//! - attention from the dominant smoothed peak on channels 1-4
//!
//! The engine is pure and holds no state between requests. CPU-heavy, so
//! async callers should run it under `spawn_blocking`.

pub mod filter;
pub mod peaks;

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::frame::{channel_series, SubmittedFrame, CHANNEL_COUNT};
use filter::{band_power, BANDS};
use peaks::{dominant_peak_amplitude, SMOOTHING_WINDOW};

/// Default sampling rate of the board in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 250;

/// Added to band powers before taking logarithms
const EPSILON: f64 = 1e-10;

/// Mean beta+gamma power at or below this counts as no activity.
///
/// One step of the decoder's 0.01 µV resolution, squared, so channels that
/// only carry rounding noise score like flat ones.
const AROUSAL_POWER_FLOOR: f64 = 1e-4;

/// Channels contributing to the attention marker
const ATTENTION_CHANNELS: usize = 4;

const ASYMMETRY_WEIGHT: f64 = 0.4;
const AROUSAL_WEIGHT: f64 = 0.3;
const ATTENTION_WEIGHT: f64 = 0.3;

/// Reported in every analysis reply
pub const ANALYSIS_METHOD: &str = "scientific_eeg_analysis";

/// Why a batch could not be analyzed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("Need {} channels of EEG data, got {found}", CHANNEL_COUNT)]
    InsufficientChannels { found: usize },
    #[error("EEG channels have unequal lengths")]
    UnequalChannelLengths,
    #[error("Need at least {needed} samples per channel, got {got}")]
    TooFewSamples { needed: usize, got: usize },
    #[error("EEG analysis is not available")]
    AnalysisUnavailable,
}

/// Marker scores scaled to [-100, 100]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Components {
    pub frontal_alpha_asymmetry: f64,
    pub arousal_level: f64,
    pub attention_p300: f64,
}

/// Marker values before normalization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawValues {
    pub faa: f64,
    pub avg_arousal: f64,
    pub p300_amplitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoveAnalysis {
    /// Composite score in [0, 100]
    pub love_score: f64,
    /// In [0, 100]
    pub confidence: f64,
    pub components: Components,
    pub raw_values: RawValues,
}

/// Band powers of one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandPowers {
    pub delta: f64,
    pub theta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub love_analysis: LoveAnalysis,
    /// Keyed `channel_1` .. `channel_8`
    pub frequency_summary: BTreeMap<String, BandPowers>,
    pub method: &'static str,
}

/// Stateless analysis engine.
///
/// Availability is decided once at startup; an unavailable engine fails
/// every request with [`AnalysisError::AnalysisUnavailable`].
#[derive(Debug, Clone)]
pub struct AnalysisEngine {
    sample_rate: f64,
    available: bool,
}

impl Default for AnalysisEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl AnalysisEngine {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1) as f64,
            available: true,
        }
    }

    pub fn with_availability(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Analyze frames submitted by an observer
    pub fn analyze_frames(
        &self,
        frames: &[SubmittedFrame],
    ) -> Result<AnalysisReport, AnalysisError> {
        self.analyze(&channel_series(frames))
    }

    /// Analyze per-channel sample series.
    ///
    /// Channels beyond the eighth are ignored.
    pub fn analyze(&self, channels: &[Vec<f64>]) -> Result<AnalysisReport, AnalysisError> {
        if !self.available {
            return Err(AnalysisError::AnalysisUnavailable);
        }
        if channels.len() < CHANNEL_COUNT {
            return Err(AnalysisError::InsufficientChannels {
                found: channels.len(),
            });
        }
        let channels = &channels[..CHANNEL_COUNT];
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(AnalysisError::UnequalChannelLengths);
        }
        if len < SMOOTHING_WINDOW {
            return Err(AnalysisError::TooFewSamples {
                needed: SMOOTHING_WINDOW,
                got: len,
            });
        }

        let powers: Vec<BandPowers> = channels.iter().map(|c| self.band_powers(c)).collect();

        let faa = (powers[1].alpha + EPSILON).ln() - (powers[0].alpha + EPSILON).ln();
        let asymmetry = squash(faa.tanh());

        let mean_fast_power = powers.iter().map(|p| p.beta + p.gamma).sum::<f64>() / powers.len() as f64;
        let (avg_arousal, arousal) = if mean_fast_power > AROUSAL_POWER_FLOOR {
            let raw = (mean_fast_power + EPSILON).ln();
            (raw, squash((raw / 5.0).tanh()))
        } else {
            (0.0, 0.0)
        };

        let p300_amplitude = channels[..ATTENTION_CHANNELS]
            .iter()
            .map(|c| dominant_peak_amplitude(c))
            .sum::<f64>()
            / ATTENTION_CHANNELS as f64;
        let attention = squash((p300_amplitude / 10.0).tanh());

        let combined =
            ASYMMETRY_WEIGHT * asymmetry + AROUSAL_WEIGHT * arousal + ATTENTION_WEIGHT * attention;
        let love_score = round_to(((combined + 1.0) / 2.0 * 100.0).clamp(0.0, 100.0), 1);
        let confidence = round_to(
            (70.0 + 10.0 * (asymmetry.abs() + arousal.abs() + attention.abs())).clamp(0.0, 100.0),
            1,
        );

        let frequency_summary = powers
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("channel_{}", i + 1), p.rounded(4)))
            .collect();

        Ok(AnalysisReport {
            love_analysis: LoveAnalysis {
                love_score,
                confidence,
                components: Components {
                    frontal_alpha_asymmetry: round_to(asymmetry * 100.0, 1),
                    arousal_level: round_to(arousal * 100.0, 1),
                    attention_p300: round_to(attention * 100.0, 1),
                },
                raw_values: RawValues {
                    faa,
                    avg_arousal,
                    p300_amplitude,
                },
            },
            frequency_summary,
            method: ANALYSIS_METHOD,
        })
    }

    fn band_powers(&self, signal: &[f64]) -> BandPowers {
        let [delta, theta, alpha, beta, gamma] =
            BANDS.map(|b| band_power(signal, b, self.sample_rate));
        BandPowers {
            delta,
            theta,
            alpha,
            beta,
            gamma,
        }
    }
}

impl BandPowers {
    fn rounded(&self, decimals: i32) -> Self {
        Self {
            delta: round_to(self.delta, decimals),
            theta: round_to(self.theta, decimals),
            alpha: round_to(self.alpha, decimals),
            beta: round_to(self.beta, decimals),
            gamma: round_to(self.gamma, decimals),
        }
    }
}

/// Non-finite marker values count as neutral
fn squash(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (v * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::TAU;

    const FS: f64 = 250.0;

    fn sine(freq: f64, amplitude: f64, samples: usize) -> Vec<f64> {
        (0..samples)
            .map(|i| amplitude * (TAU * freq * i as f64 / FS).sin())
            .collect()
    }

    fn noise(rng: &mut StdRng, amplitude: f64, samples: usize) -> Vec<f64> {
        (0..samples).map(|_| rng.gen_range(-amplitude..amplitude)).collect()
    }

    #[test]
    fn rejects_missing_channels() {
        let engine = AnalysisEngine::default();
        let err = engine.analyze(&vec![vec![0.0; 100]; 4]).unwrap_err();
        assert_eq!(err, AnalysisError::InsufficientChannels { found: 4 });
        assert_eq!(
            engine.analyze_frames(&[]).unwrap_err(),
            AnalysisError::InsufficientChannels { found: 0 }
        );
    }

    #[test]
    fn rejects_unequal_and_short_channels() {
        let engine = AnalysisEngine::default();
        let mut channels = vec![vec![0.0; 100]; CHANNEL_COUNT];
        channels[3].pop();
        assert_eq!(
            engine.analyze(&channels).unwrap_err(),
            AnalysisError::UnequalChannelLengths
        );

        let short = vec![vec![0.0; 5]; CHANNEL_COUNT];
        assert_eq!(
            engine.analyze(&short).unwrap_err(),
            AnalysisError::TooFewSamples { needed: 11, got: 5 }
        );
    }

    #[test]
    fn unavailable_engine_refuses() {
        let engine = AnalysisEngine::default().with_availability(false);
        assert!(!engine.is_available());
        assert_eq!(
            engine.analyze(&vec![vec![0.0; 100]; CHANNEL_COUNT]).unwrap_err(),
            AnalysisError::AnalysisUnavailable
        );
    }

    #[test]
    fn flat_lines_score_neutral() {
        let engine = AnalysisEngine::default();
        for level in [0.0, 12.5, -40.0] {
            let report = engine.analyze(&vec![vec![level; 250]; CHANNEL_COUNT]).unwrap();
            let love = &report.love_analysis;
            assert!((love.love_score - 50.0).abs() < 0.5, "score {}", love.love_score);
            assert!((love.confidence - 70.0).abs() < 0.5);
            assert_eq!(report.method, ANALYSIS_METHOD);
        }
    }

    #[test]
    fn rounding_noise_scores_like_flat() {
        let engine = AnalysisEngine::default();
        // A 20 Hz ripple quantised to the decoder's 0.01 µV step
        let ripple: Vec<f64> = sine(20.0, 0.01, 250)
            .into_iter()
            .map(|v| (v * 100.0).round() / 100.0)
            .collect();
        assert!(ripple.iter().any(|&v| v != 0.0));

        let report = engine.analyze(&vec![ripple; CHANNEL_COUNT]).unwrap();
        let love = &report.love_analysis;
        assert_eq!(love.components.arousal_level, 0.0);
        assert!((love.love_score - 50.0).abs() < 0.5, "score {}", love.love_score);
    }

    #[test]
    fn asymmetry_flips_under_frontal_swap() {
        let engine = AnalysisEngine::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut channels: Vec<Vec<f64>> =
            (0..CHANNEL_COUNT).map(|_| noise(&mut rng, 10.0, 500)).collect();
        channels[1] = sine(10.0, 30.0, 500);

        let a = engine.analyze(&channels).unwrap().love_analysis;
        channels.swap(0, 1);
        let b = engine.analyze(&channels).unwrap().love_analysis;

        assert!(a.components.frontal_alpha_asymmetry > 0.0);
        assert!((a.raw_values.faa + b.raw_values.faa).abs() < 1e-9);
        assert_eq!(
            a.components.frontal_alpha_asymmetry,
            -b.components.frontal_alpha_asymmetry
        );
        assert_eq!(a.components.arousal_level, b.components.arousal_level);
    }

    #[test]
    fn identical_channels_are_swap_symmetric() {
        let engine = AnalysisEngine::default();
        let wave = sine(6.0, 15.0, 400);
        let mut channels = vec![wave; CHANNEL_COUNT];
        let a = engine.analyze(&channels).unwrap();
        channels.swap(0, 1);
        let b = engine.analyze(&channels).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.love_analysis.components.frontal_alpha_asymmetry, 0.0);
    }

    #[test]
    fn scores_stay_bounded() {
        let engine = AnalysisEngine::default();
        let mut rng = StdRng::seed_from_u64(42);
        for amplitude in [1e-6, 1.0, 100.0, 1e6] {
            let channels: Vec<Vec<f64>> = (0..CHANNEL_COUNT)
                .map(|_| noise(&mut rng, amplitude, 300))
                .collect();
            let love = engine.analyze(&channels).unwrap().love_analysis;
            assert!((0.0..=100.0).contains(&love.love_score));
            assert!((0.0..=100.0).contains(&love.confidence));
        }
    }

    #[test]
    fn frequency_summary_covers_every_channel() {
        let engine = AnalysisEngine::default();
        let channels: Vec<Vec<f64>> = (0..CHANNEL_COUNT).map(|_| sine(20.0, 5.0, 500)).collect();
        let report = engine.analyze(&channels).unwrap();

        assert_eq!(report.frequency_summary.len(), CHANNEL_COUNT);
        let ch1 = &report.frequency_summary["channel_1"];
        assert!(ch1.beta > ch1.alpha && ch1.beta > ch1.gamma);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["frequency_summary"]["channel_8"]["delta"].is_number());
        assert!(json["love_analysis"]["components"]["attention_p300"].is_number());
    }

    #[test]
    fn extra_channels_are_ignored() {
        let engine = AnalysisEngine::default();
        let mut channels = vec![sine(10.0, 5.0, 300); CHANNEL_COUNT];
        let base = engine.analyze(&channels).unwrap();
        channels.push(vec![1e9; 3]);
        assert_eq!(engine.analyze(&channels).unwrap(), base);
    }
}
