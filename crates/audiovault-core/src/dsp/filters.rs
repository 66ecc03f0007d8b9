//! Ordered chain of enable/disable-able DSP filters
//!
//! Default chain: high-pass Butterworth at 80Hz (DC offset and rumble),
//! low-pass Butterworth at 8kHz (high-frequency noise), and an
//! envelope-follower noise gate. Filters never fail a chunk; degenerate
//! parameters (cutoff at or above Nyquist) skip the filter with a warning.

use rustfft::num_complex::Complex;
use std::f64::consts::PI;

/// Butterworth filter response type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    LowPass,
    HighPass,
}

/// IIR Butterworth filter applied forward-backward (zero phase)
#[derive(Debug, Clone)]
pub struct Butterworth {
    name: &'static str,
    mode: FilterMode,
    cutoff_hz: f64,
    order: usize,
    /// Cached (b, a, sample_rate); recomputed when the rate changes
    coefficients: Option<(Vec<f64>, Vec<f64>, u32)>,
}

impl Butterworth {
    pub fn high_pass(cutoff_hz: f64, order: usize) -> Self {
        Self {
            name: "high_pass",
            mode: FilterMode::HighPass,
            cutoff_hz,
            order,
            coefficients: None,
        }
    }

    pub fn low_pass(cutoff_hz: f64, order: usize) -> Self {
        Self {
            name: "low_pass",
            mode: FilterMode::LowPass,
            cutoff_hz,
            order,
            coefficients: None,
        }
    }

    fn process(&mut self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        match &self.coefficients {
            Some((_, _, rate)) if *rate == sample_rate => {}
            _ => match design_butterworth(self.order, self.cutoff_hz, sample_rate, self.mode) {
                Some((b, a)) => self.coefficients = Some((b, a, sample_rate)),
                None => {
                    tracing::warn!(
                        filter = self.name,
                        cutoff_hz = self.cutoff_hz,
                        sample_rate,
                        "Degenerate cutoff, filter skipped"
                    );
                    return samples.to_vec();
                }
            },
        }

        match &self.coefficients {
            Some((b, a, _)) => filtfilt(b, a, samples),
            None => samples.to_vec(),
        }
    }
}

/// Noise gate with separate attack/release envelope time constants.
///
/// Below threshold, gain follows `1/(1 + ratio*(threshold-env)/max(env, ε))`;
/// above threshold, gain is 1. The envelope persists across chunks.
#[derive(Debug, Clone)]
pub struct NoiseGate {
    threshold: f64,
    ratio: f64,
    attack_time: f64,
    release_time: f64,
    envelope: f64,
}

impl NoiseGate {
    pub fn new(threshold: f64, ratio: f64, attack_time: f64, release_time: f64) -> Self {
        Self {
            threshold,
            ratio,
            attack_time,
            release_time,
            envelope: 0.0,
        }
    }

    fn process(&mut self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        let attack_coeff = (-1.0 / (self.attack_time * sample_rate as f64)).exp();
        let release_coeff = (-1.0 / (self.release_time * sample_rate as f64)).exp();

        samples
            .iter()
            .map(|&sample| {
                let level = (sample as f64).abs();
                if level > self.envelope {
                    self.envelope = attack_coeff * self.envelope + (1.0 - attack_coeff) * level;
                } else {
                    self.envelope = release_coeff * self.envelope;
                }

                let gain = if self.envelope < self.threshold {
                    let denom = self.envelope.max(1e-8);
                    1.0 / (1.0 + self.ratio * (self.threshold - self.envelope) / denom)
                } else {
                    1.0
                };

                (sample as f64 * gain) as f32
            })
            .collect()
    }
}

/// Closed set of filters with a fixed `(buffer, sample_rate) -> buffer` shape
#[derive(Debug, Clone)]
pub enum FilterKind {
    HighPass(Butterworth),
    LowPass(Butterworth),
    NoiseGate(NoiseGate),
}

impl FilterKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::HighPass(f) | FilterKind::LowPass(f) => f.name,
            FilterKind::NoiseGate(_) => "noise_gate",
        }
    }

    fn process(&mut self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        match self {
            FilterKind::HighPass(f) | FilterKind::LowPass(f) => f.process(samples, sample_rate),
            FilterKind::NoiseGate(g) => g.process(samples, sample_rate),
        }
    }
}

struct ChainEntry {
    enabled: bool,
    filter: FilterKind,
}

/// Ordered list of named filters applied in sequence
pub struct FilterChain {
    filters: Vec<ChainEntry>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self { filters: Vec::new() }
    }

    /// Default chain: 80Hz high-pass, 8kHz low-pass, noise gate
    pub fn with_defaults() -> Self {
        let mut chain = Self::new();
        chain.add(FilterKind::HighPass(Butterworth::high_pass(80.0, 5)));
        chain.add(FilterKind::LowPass(Butterworth::low_pass(8000.0, 5)));
        chain.add(FilterKind::NoiseGate(NoiseGate::new(0.01, 10.0, 0.01, 0.1)));
        chain
    }

    pub fn add(&mut self, filter: FilterKind) {
        tracing::info!(filter = filter.name(), "Audio filter added");
        self.filters.push(ChainEntry {
            enabled: true,
            filter,
        });
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.filters.len();
        self.filters.retain(|entry| entry.filter.name() != name);
        let removed = self.filters.len() < before;
        if removed {
            tracing::info!(filter = name, "Audio filter removed");
        }
        removed
    }

    /// Enable or disable a filter by name; returns false if unknown
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        for entry in self.filters.iter_mut() {
            if entry.filter.name() == name {
                entry.enabled = enabled;
                tracing::info!(filter = name, enabled, "Audio filter toggled");
                return true;
            }
        }
        false
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.filters
            .iter()
            .find(|entry| entry.filter.name() == name)
            .map(|entry| entry.enabled)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|e| e.filter.name()).collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.filters.iter().filter(|e| e.enabled).count()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Apply every enabled filter in order
    pub fn apply(&mut self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        let mut data = samples.to_vec();
        for entry in self.filters.iter_mut() {
            if entry.enabled {
                data = entry.filter.process(&data, sample_rate);
            }
        }
        data
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Digital Butterworth design via pole placement and bilinear transform.
///
/// Returns `(b, a)` transfer-function coefficients with `a[0] = 1`, or
/// `None` when the cutoff is out of the representable range.
fn design_butterworth(
    order: usize,
    cutoff_hz: f64,
    sample_rate: u32,
    mode: FilterMode,
) -> Option<(Vec<f64>, Vec<f64>)> {
    let nyquist = sample_rate as f64 / 2.0;
    if order == 0 || cutoff_hz <= 0.0 || cutoff_hz >= nyquist {
        return None;
    }

    // Pre-warped analog cutoff for the bilinear transform (T = 2)
    let warped = (PI * cutoff_hz / sample_rate as f64).tan();

    let mut z_poles = Vec::with_capacity(order);
    for k in 0..order {
        // Analog prototype pole on the left half of the unit circle
        let theta = PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
        let prototype = Complex::new(theta.cos(), theta.sin());

        let analog = match mode {
            FilterMode::LowPass => prototype * warped,
            FilterMode::HighPass => Complex::new(warped, 0.0) / prototype,
        };

        // Bilinear transform into the z-plane
        let one = Complex::new(1.0, 0.0);
        z_poles.push((one + analog) / (one - analog));
    }

    // Lowpass zeros sit at z = -1, highpass zeros at z = +1
    let zero = match mode {
        FilterMode::LowPass => Complex::new(-1.0, 0.0),
        FilterMode::HighPass => Complex::new(1.0, 0.0),
    };
    let z_zeros = vec![zero; order];

    let a: Vec<Complex<f64>> = poly(&z_poles);
    let b_unscaled: Vec<Complex<f64>> = poly(&z_zeros);

    // Unity gain at DC (lowpass) or Nyquist (highpass)
    let eval_at = match mode {
        FilterMode::LowPass => Complex::new(1.0, 0.0),
        FilterMode::HighPass => Complex::new(-1.0, 0.0),
    };
    let gain = polyval(&a, eval_at) / polyval(&b_unscaled, eval_at);

    let a_real: Vec<f64> = a.iter().map(|c| c.re).collect();
    let b_real: Vec<f64> = b_unscaled.iter().map(|c| (c * gain).re).collect();

    Some((b_real, a_real))
}

/// Expand a monic polynomial from its roots (descending powers)
fn poly(roots: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let mut coeffs = vec![Complex::new(1.0, 0.0)];
    for &root in roots {
        let mut next = vec![Complex::new(0.0, 0.0); coeffs.len() + 1];
        for (i, &c) in coeffs.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= root * c;
        }
        coeffs = next;
    }
    coeffs
}

fn polyval(coeffs: &[Complex<f64>], z: Complex<f64>) -> Complex<f64> {
    let mut acc = Complex::new(0.0, 0.0);
    for &c in coeffs {
        acc = acc * z + c;
    }
    acc
}

/// Direct-form II transposed IIR filter
fn iir_filter(b: &[f64], a: &[f64], input: &[f64]) -> Vec<f64> {
    let order = b.len().max(a.len()) - 1;
    let mut state = vec![0.0f64; order];
    let mut output = Vec::with_capacity(input.len());

    for &x in input {
        let y = b[0] * x + state.first().copied().unwrap_or(0.0);
        for i in 0..order {
            let next = state.get(i + 1).copied().unwrap_or(0.0);
            let b_i = b.get(i + 1).copied().unwrap_or(0.0);
            let a_i = a.get(i + 1).copied().unwrap_or(0.0);
            state[i] = b_i * x + next - a_i * y;
        }
        output.push(y);
    }

    output
}

/// Zero-phase filtering: forward pass, reverse, forward pass, reverse
fn filtfilt(b: &[f64], a: &[f64], samples: &[f32]) -> Vec<f32> {
    let input: Vec<f64> = samples.iter().map(|&x| x as f64).collect();

    let mut forward = iir_filter(b, a, &input);
    forward.reverse();
    let mut backward = iir_filter(b, a, &forward);
    backward.reverse();

    backward.into_iter().map(|x| x as f32).collect()
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

    fn rms(samples: &[f32]) -> f64 {
        (samples.iter().map(|&x| (x as f64).powi(2)).sum::<f64>() / samples.len() as f64).sqrt()
    }

    #[test]
    fn test_butterworth_design_lowpass_dc_gain() {
        let (b, a) = design_butterworth(5, 8000.0, 48000, FilterMode::LowPass).unwrap();
        assert_eq!(b.len(), 6);
        assert_eq!(a.len(), 6);
        assert_relative_eq!(a[0], 1.0, epsilon = 1e-9);
        // Unity DC gain: sum(b) == sum(a)
        let gain = b.iter().sum::<f64>() / a.iter().sum::<f64>();
        assert_relative_eq!(gain, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_design_rejects_cutoff_above_nyquist() {
        assert!(design_butterworth(5, 9000.0, 16000, FilterMode::LowPass).is_none());
        assert!(design_butterworth(5, 0.0, 16000, FilterMode::HighPass).is_none());
    }

    #[test]
    fn test_high_pass_removes_dc_offset() {
        let mut filter = Butterworth::high_pass(80.0, 5);
        let input: Vec<f32> = sine(1000.0, 16000.0, 4096, 0.3)
            .into_iter()
            .map(|x| x + 0.5)
            .collect();

        let output = filter.process(&input, 16000);
        let mean = output.iter().map(|&x| x as f64).sum::<f64>() / output.len() as f64;
        assert!(mean.abs() < 0.01, "DC offset not removed: mean {mean}");
    }

    #[test]
    fn test_low_pass_attenuates_high_frequency() {
        let mut filter = Butterworth::low_pass(1000.0, 5);
        let high = sine(6000.0, 16000.0, 4096, 0.5);

        let output = filter.process(&high, 16000);
        assert!(
            rms(&output) < rms(&high) * 0.05,
            "6kHz tone not attenuated by a 1kHz low-pass"
        );
    }

    #[test]
    fn test_low_pass_passes_low_frequency() {
        let mut filter = Butterworth::low_pass(4000.0, 5);
        let low = sine(200.0, 16000.0, 4096, 0.5);

        let output = filter.process(&low, 16000);
        assert!(rms(&output) > rms(&low) * 0.9);
    }

    #[test]
    fn test_noise_gate_suppresses_quiet_signal() {
        let mut gate = NoiseGate::new(0.01, 10.0, 0.01, 0.1);
        let quiet = sine(440.0, 16000.0, 4096, 0.001);

        let output = gate.process(&quiet, 16000);
        assert!(rms(&output) < rms(&quiet) * 0.5);
    }

    #[test]
    fn test_noise_gate_passes_loud_signal() {
        let mut gate = NoiseGate::new(0.01, 10.0, 0.01, 0.1);
        let loud = sine(440.0, 16000.0, 4096, 0.5);

        let output = gate.process(&loud, 16000);
        assert!(rms(&output) > rms(&loud) * 0.8);
    }

    #[test]
    fn test_chain_defaults_and_toggle() {
        let mut chain = FilterChain::with_defaults();
        assert_eq!(chain.names(), vec!["high_pass", "low_pass", "noise_gate"]);
        assert_eq!(chain.enabled_count(), 3);

        assert!(chain.set_enabled("low_pass", false));
        assert_eq!(chain.is_enabled("low_pass"), Some(false));
        assert_eq!(chain.enabled_count(), 2);

        assert!(!chain.set_enabled("echo_cancel", false));
        assert_eq!(chain.is_enabled("echo_cancel"), None);
    }

    #[test]
    fn test_chain_remove() {
        let mut chain = FilterChain::with_defaults();
        assert!(chain.remove("noise_gate"));
        assert!(!chain.remove("noise_gate"));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_disabled_filter_is_identity() {
        let mut chain = FilterChain::with_defaults();
        chain.set_enabled("high_pass", false);
        chain.set_enabled("low_pass", false);
        chain.set_enabled("noise_gate", false);

        let input = sine(440.0, 16000.0, 512, 0.3);
        let output = chain.apply(&input, 16000);
        assert_eq!(input, output);
    }
}
