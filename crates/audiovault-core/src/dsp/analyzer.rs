//! Per-buffer audio feature extraction
//!
//! Computes time-domain statistics, spectral features over a single FFT,
//! a percentile-based SNR estimate, a simple two-feature voice activity
//! score, and the first cepstral coefficients.

use chrono::{DateTime, Utc};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

/// Feature vector extracted from one audio buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMetrics {
    pub timestamp: DateTime<Utc>,
    pub rms: f64,
    pub peak: f64,
    pub zero_crossing_rate: f64,
    pub spectral_centroid: f64,
    pub spectral_rolloff: f64,
    pub snr_db: f64,
    /// Voice activity likelihood in [0, 1]
    pub vad_score: f64,
    /// First cepstral coefficients (up to 13)
    pub cepstral: Vec<f64>,
}

/// Stateless feature extractor; owns a reusable FFT planner
pub struct AudioAnalyzer {
    sample_rate: u32,
    planner: FftPlanner<f64>,
}

impl AudioAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            planner: FftPlanner::new(),
        }
    }

    /// Extract the full feature vector from one buffer.
    ///
    /// An empty buffer yields all-zero features with `snr_db` at its
    /// quiet-floor default.
    pub fn analyze(&mut self, samples: &[f32]) -> AudioMetrics {
        if samples.is_empty() {
            return AudioMetrics {
                timestamp: Utc::now(),
                rms: 0.0,
                peak: 0.0,
                zero_crossing_rate: 0.0,
                spectral_centroid: 0.0,
                spectral_rolloff: 0.0,
                snr_db: 60.0,
                vad_score: 0.0,
                cepstral: Vec::new(),
            };
        }

        let rms = rms(samples);
        let peak = samples.iter().map(|&x| (x as f64).abs()).fold(0.0, f64::max);
        let zcr = zero_crossing_rate(samples);

        let spectrum = self.magnitude_spectrum(samples);
        let (centroid, rolloff) = spectral_features(&spectrum, samples.len(), self.sample_rate);
        let snr_db = estimate_snr(samples);
        let vad_score = vad_score(rms, zcr);
        let cepstral = self.cepstral_coefficients(&spectrum);

        AudioMetrics {
            timestamp: Utc::now(),
            rms,
            peak,
            zero_crossing_rate: zcr,
            spectral_centroid: centroid,
            spectral_rolloff: rolloff,
            snr_db,
            vad_score,
            cepstral,
        }
    }

    /// One-sided magnitude spectrum
    fn magnitude_spectrum(&mut self, samples: &[f32]) -> Vec<f64> {
        let fft = self.planner.plan_fft_forward(samples.len());
        let mut buffer: Vec<Complex<f64>> = samples
            .iter()
            .map(|&x| Complex::new(x as f64, 0.0))
            .collect();
        fft.process(&mut buffer);

        buffer[..samples.len() / 2 + 1]
            .iter()
            .map(|c| c.norm())
            .collect()
    }

    /// First 13 real cepstral coefficients from the log magnitude spectrum
    fn cepstral_coefficients(&mut self, spectrum: &[f64]) -> Vec<f64> {
        if spectrum.len() < 2 {
            return Vec::new();
        }

        let log_spectrum: Vec<Complex<f64>> = spectrum
            .iter()
            .map(|&m| Complex::new((m + 1e-10).ln(), 0.0))
            .collect();

        let mut buffer = log_spectrum;
        let ifft = self.planner.plan_fft_inverse(buffer.len());
        ifft.process(&mut buffer);

        let scale = buffer.len() as f64;
        buffer
            .iter()
            .take(13)
            .map(|c| c.re / scale)
            .collect()
    }
}

fn rms(samples: &[f32]) -> f64 {
    let sum_sq: f64 = samples.iter().map(|&x| (x as f64).powi(2)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Fraction of adjacent sample pairs whose signs differ
fn zero_crossing_rate(samples: &[f32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f64 / samples.len() as f64
}

/// Spectral centroid and 85% rolloff frequency in Hz
fn spectral_features(spectrum: &[f64], fft_len: usize, sample_rate: u32) -> (f64, f64) {
    let total: f64 = spectrum.iter().sum();
    let nyquist = sample_rate as f64 / 2.0;
    if total <= 0.0 {
        return (0.0, nyquist);
    }

    let bin_hz = sample_rate as f64 / fft_len as f64;
    let centroid = spectrum
        .iter()
        .enumerate()
        .map(|(i, &m)| i as f64 * bin_hz * m)
        .sum::<f64>()
        / total;

    let target = 0.85 * total;
    let mut cumulative = 0.0;
    let mut rolloff = nyquist;
    for (i, &m) in spectrum.iter().enumerate() {
        cumulative += m;
        if cumulative >= target {
            rolloff = i as f64 * bin_hz;
            break;
        }
    }

    (centroid, rolloff)
}

/// Percentile-ratio SNR estimate: signal at p90 amplitude, noise at p10.
///
/// A zero noise floor reports the 60dB quiet-floor default.
fn estimate_snr(samples: &[f32]) -> f64 {
    let mut magnitudes: Vec<f64> = samples.iter().map(|&x| (x as f64).abs()).collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let p90 = percentile_sorted(&magnitudes, 90.0);
    let p10 = percentile_sorted(&magnitudes, 10.0);

    if p10 <= 0.0 {
        return 60.0;
    }
    20.0 * (p90 / p10).log10()
}

fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Voice activity score: mean of an energy vote and a ZCR-band vote.
///
/// Speech typically lands in a ZCR band of roughly 0.1 to 0.5; energy
/// above a small floor votes for activity.
fn vad_score(rms: f64, zcr: f64) -> f64 {
    let energy_vote = if rms > 0.001 { 1.0 } else { 0.0 };
    let zcr_vote = if (0.1..=0.5).contains(&zcr) { 1.0 } else { 0.0 };
    (energy_vote + zcr_vote) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sine(freq: f64, rate: f64, n: usize, amplitude: f32) -> Vec<f32> {
        (0..n)
            .map(|i| {
                amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() as f32
            })
            .collect()
    }

    #[test]
    fn test_rms_and_peak_of_sine() {
        let mut analyzer = AudioAnalyzer::new(16000);
        let metrics = analyzer.analyze(&sine(440.0, 16000.0, 4096, 0.5));

        // RMS of a sine is amplitude / sqrt(2)
        assert_relative_eq!(metrics.rms, 0.5 / 2.0_f64.sqrt(), epsilon = 0.01);
        assert_relative_eq!(metrics.peak, 0.5, epsilon = 0.01);
    }

    #[test]
    fn test_zcr_tracks_frequency() {
        let mut analyzer = AudioAnalyzer::new(16000);
        // A sine at f crosses zero 2f times per second: ZCR ~= 2f / rate
        let low = analyzer.analyze(&sine(200.0, 16000.0, 8000, 0.5));
        let high = analyzer.analyze(&sine(2000.0, 16000.0, 8000, 0.5));

        assert_relative_eq!(low.zero_crossing_rate, 2.0 * 200.0 / 16000.0, epsilon = 0.005);
        assert_relative_eq!(high.zero_crossing_rate, 2.0 * 2000.0 / 16000.0, epsilon = 0.02);
    }

    #[test]
    fn test_centroid_near_tone_frequency() {
        let mut analyzer = AudioAnalyzer::new(16000);
        let metrics = analyzer.analyze(&sine(1000.0, 16000.0, 4096, 0.5));
        assert!(
            (metrics.spectral_centroid - 1000.0).abs() < 100.0,
            "centroid {} far from 1kHz",
            metrics.spectral_centroid
        );
    }

    #[test]
    fn test_rolloff_of_pure_tone() {
        let mut analyzer = AudioAnalyzer::new(16000);
        let metrics = analyzer.analyze(&sine(1000.0, 16000.0, 4096, 0.5));
        // Energy concentrated at 1kHz keeps the 85% rolloff near the tone
        assert!(metrics.spectral_rolloff < 2000.0);
    }

    #[test]
    fn test_silence_snr_default() {
        let mut analyzer = AudioAnalyzer::new(16000);
        let metrics = analyzer.analyze(&vec![0.0f32; 1024]);
        assert_relative_eq!(metrics.snr_db, 60.0);
        assert_eq!(metrics.vad_score, 0.0);
    }

    #[test]
    fn test_empty_buffer() {
        let mut analyzer = AudioAnalyzer::new(16000);
        let metrics = analyzer.analyze(&[]);
        assert_eq!(metrics.rms, 0.0);
        assert_eq!(metrics.peak, 0.0);
        assert!(metrics.cepstral.is_empty());
    }

    #[test]
    fn test_vad_high_for_speechlike_signal() {
        let mut analyzer = AudioAnalyzer::new(16000);
        // 1.6kHz at 16kHz gives ZCR 0.2, inside the speech band
        let metrics = analyzer.analyze(&sine(1600.0, 16000.0, 4096, 0.3));
        assert_eq!(metrics.vad_score, 1.0);
    }

    #[test]
    fn test_vad_low_for_subsonic_rumble() {
        let mut analyzer = AudioAnalyzer::new(16000);
        // Loud but nearly no zero crossings: only the energy vote fires
        let metrics = analyzer.analyze(&sine(5.0, 16000.0, 4096, 0.3));
        assert_eq!(metrics.vad_score, 0.5);
    }

    #[test]
    fn test_cepstral_length() {
        let mut analyzer = AudioAnalyzer::new(16000);
        let metrics = analyzer.analyze(&sine(440.0, 16000.0, 2048, 0.5));
        assert_eq!(metrics.cepstral.len(), 13);
    }
}
