//! Detrend, taper, and Butterworth filter design/application.
//!
//! Grounded on `data_ingestion.py::Buffer.filter` for the detrend/taper/
//! filter/pad sequence; the least-squares detrend follows the same
//! Vandermonde-via-`faer` approach as the teacher's `rfi_cleaning.rs`.

use faer::prelude::*;
use num_complex::Complex64;
use std::f64::consts::PI;

/// Remove the best-fit line from `samples` in place (`np.detrend('linear')`).
pub fn detrend_linear(samples: &mut [f64]) {
    let n = samples.len();
    if n < 2 {
        return;
    }
    let mut design = Mat::<f64>::zeros(n, 2);
    let mut rhs = Mat::<f64>::zeros(n, 1);
    for i in 0..n {
        design[(i, 0)] = 1.0;
        design[(i, 1)] = i as f64;
        rhs[(i, 0)] = samples[i];
    }
    let coeffs = design.qr().solve_lstsq(&rhs);
    let intercept = coeffs[(0, 0)];
    let slope = coeffs[(1, 0)];
    for (i, s) in samples.iter_mut().enumerate() {
        *s -= intercept + slope * i as f64;
    }
}

/// Subtract the mean from `samples` in place (`np.detrend('constant')`).
pub fn detrend_constant(samples: &mut [f64]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    for s in samples.iter_mut() {
        *s -= mean;
    }
}

/// Apply a Hann-shaped taper over the first/last `fraction` of the signal
/// on each end, mirroring obspy's default `Trace.taper(fraction)`.
pub fn taper_cosine(samples: &mut [f64], fraction: f64) {
    let n = samples.len();
    if n == 0 || fraction <= 0.0 {
        return;
    }
    let taper_len = ((n as f64) * fraction).floor() as usize;
    if taper_len == 0 {
        return;
    }
    for i in 0..taper_len {
        let w = 0.5 * (1.0 - (PI * i as f64 / taper_len as f64).cos());
        samples[i] *= w;
        samples[n - 1 - i] *= w;
    }
}

/// Mirror-pad `samples` by prepending/appending a reversed copy of the
/// full signal, matching `Buffer.filter`'s `np.flip` padding idiom.
pub fn mirror_pad(samples: &[f64]) -> Vec<f64> {
    let mut reversed: Vec<f64> = samples.iter().rev().copied().collect();
    reversed.extend_from_slice(samples);
    reversed
}

/// Undo [`mirror_pad`]: keep the second half of a padded buffer.
pub fn unpad(padded: &[f64]) -> Vec<f64> {
    let half = padded.len() / 2;
    padded[half..].to_vec()
}

/// First-order backward difference, `dx/dt`, used to turn a velocity
/// record into acceleration for full instrument-response removal. The
/// first sample reuses the second sample's derivative (no prior sample to
/// difference against).
pub fn differentiate(samples: &[f64], delta_secs: f64) -> Vec<f64> {
    let n = samples.len();
    if n < 2 || delta_secs <= 0.0 {
        return vec![0.0; n];
    }
    let mut out = vec![0.0; n];
    for i in 1..n {
        out[i] = (samples[i] - samples[i - 1]) / delta_secs;
    }
    out[0] = out[1];
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Lowpass,
    Highpass,
    Bandpass,
}

/// A Butterworth filter specification. `freqs[1]` is only read for
/// [`FilterKind::Bandpass`].
#[derive(Debug, Clone, Copy)]
pub struct FilterSpec {
    pub kind: FilterKind,
    pub order: usize,
    pub freqs: [f64; 2],
    pub sample_rate_hz: f64,
    pub zero_phase: bool,
}

impl FilterSpec {
    pub fn new(kind: FilterKind, order: usize, freqs: [f64; 2], sample_rate_hz: f64, zero_phase: bool) -> Self {
        if kind != FilterKind::Bandpass && freqs[1] != 0.0 {
            tracing::warn!(
                ?kind,
                corner_hz = freqs[0],
                ignored_hz = freqs[1],
                "non-bandpass filter only uses freqs[0]; second corner is ignored"
            );
        }
        Self {
            kind,
            order,
            freqs,
            sample_rate_hz,
            zero_phase,
        }
    }

    /// Build the cascaded second-order-section realization of this filter.
    pub fn design(&self) -> Sos {
        let nyquist = self.sample_rate_hz / 2.0;
        let prewarp = |f_hz: f64| -> f64 {
            let wd = PI * (f_hz / nyquist);
            (2.0 * self.sample_rate_hz) * (wd / 2.0).tan()
        };

        let proto = butterworth_lowpass_prototype(self.order);
        let (poles, zeros, gain) = match self.kind {
            FilterKind::Lowpass => lp2lp(&proto, prewarp(self.freqs[0])),
            FilterKind::Highpass => lp2hp(&proto, prewarp(self.freqs[0])),
            FilterKind::Bandpass => {
                let wa_low = prewarp(self.freqs[0]);
                let wa_high = prewarp(self.freqs[1]);
                lp2bp(&proto, wa_low, wa_high)
            }
        };

        let (z_poles, z_zeros, z_gain) = bilinear(&poles, &zeros, gain, self.sample_rate_hz);
        Sos::from_zpk(&z_poles, &z_zeros, z_gain)
    }
}

struct AnalogProto {
    poles: Vec<Complex64>,
}

/// Normalized (cutoff = 1 rad/s) all-pole Butterworth lowpass prototype.
fn butterworth_lowpass_prototype(order: usize) -> AnalogProto {
    let n = order.max(1);
    let poles = (0..n)
        .map(|k| {
            let theta = PI * (2 * k + n + 1) as f64 / (2 * n) as f64;
            Complex64::new(theta.cos(), theta.sin())
        })
        .collect();
    AnalogProto { poles }
}

type Zpk = (Vec<Complex64>, Vec<Complex64>, f64);

fn lp2lp(proto: &AnalogProto, wo: f64) -> Zpk {
    let poles: Vec<Complex64> = proto.poles.iter().map(|p| p * wo).collect();
    let degree = poles.len();
    let gain = wo.powi(degree as i32);
    (poles, Vec::new(), gain)
}

fn lp2hp(proto: &AnalogProto, wo: f64) -> Zpk {
    let poles: Vec<Complex64> = proto.poles.iter().map(|p| Complex64::new(wo, 0.0) / p).collect();
    let zeros = vec![Complex64::new(0.0, 0.0); proto.poles.len()];
    let prod_poles: Complex64 = proto.poles.iter().map(|p| -p).product();
    let gain = (1.0 / prod_poles).re;
    (poles, zeros, gain)
}

fn lp2bp(proto: &AnalogProto, wa_low: f64, wa_high: f64) -> Zpk {
    let bw = wa_high - wa_low;
    let w0 = (wa_low * wa_high).sqrt();
    let mut poles = Vec::with_capacity(proto.poles.len() * 2);
    for p in &proto.poles {
        let p_bw_half = p * (bw / 2.0);
        let discriminant = (p_bw_half * p_bw_half - Complex64::new(w0 * w0, 0.0)).sqrt();
        poles.push(p_bw_half + discriminant);
        poles.push(p_bw_half - discriminant);
    }
    let zeros = vec![Complex64::new(0.0, 0.0); proto.poles.len()];
    let gain = bw.powi(proto.poles.len() as i32);
    (poles, zeros, gain)
}

/// Bilinear-transform an analog zpk design into the digital domain.
fn bilinear(poles: &[Complex64], zeros: &[Complex64], gain: f64, fs: f64) -> Zpk {
    let fs2 = 2.0 * fs;
    let z_poles: Vec<Complex64> = poles
        .iter()
        .map(|p| (Complex64::new(fs2, 0.0) + p) / (Complex64::new(fs2, 0.0) - p))
        .collect();
    let mut z_zeros: Vec<Complex64> = zeros
        .iter()
        .map(|z| (Complex64::new(fs2, 0.0) + z) / (Complex64::new(fs2, 0.0) - z))
        .collect();
    let degree_diff = poles.len().saturating_sub(zeros.len());
    z_zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree_diff));

    let num: Complex64 = zeros.iter().map(|z| Complex64::new(fs2, 0.0) - z).product();
    let den: Complex64 = poles.iter().map(|p| Complex64::new(fs2, 0.0) - p).product();
    let z_gain = gain * (num / den).re;
    (z_poles, z_zeros, z_gain)
}

/// One cascaded biquad (or first-order, with `b2`/`a2` left at zero) section.
#[derive(Debug, Clone, Copy, Default)]
pub struct SosSection {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

/// A cascade of second-order sections realizing a digital filter.
#[derive(Debug, Clone, Default)]
pub struct Sos {
    pub sections: Vec<SosSection>,
}

impl Sos {
    fn from_zpk(poles: &[Complex64], zeros: &[Complex64], gain: f64) -> Self {
        let pole_groups = pair_conjugates(poles.to_vec());
        let zero_groups = pair_conjugates(zeros.to_vec());
        let mut sections = Vec::with_capacity(pole_groups.len());
        for (i, (p1, p2)) in pole_groups.into_iter().enumerate() {
            let (z1, z2) = zero_groups
                .get(i)
                .copied()
                .unwrap_or((Complex64::new(-1.0, 0.0), None));
            let a1 = -(p1 + p2.unwrap_or(Complex64::new(0.0, 0.0))).re;
            let a2 = p2.map(|p2| (p1 * p2).re).unwrap_or(0.0);
            let b1 = -(z1 + z2.unwrap_or(Complex64::new(0.0, 0.0))).re;
            let b2 = z2.map(|z2| (z1 * z2).re).unwrap_or(0.0);
            let scale = if i == 0 { gain } else { 1.0 };
            sections.push(SosSection {
                b0: scale,
                b1: scale * b1,
                b2: scale * b2,
                a1,
                a2,
            });
        }
        Self { sections }
    }

    /// Apply the cascade once, in the forward direction.
    pub fn filter(&self, input: &[f64]) -> Vec<f64> {
        let mut stage = input.to_vec();
        for section in &self.sections {
            let mut z1 = 0.0;
            let mut z2 = 0.0;
            for x in stage.iter_mut() {
                let xin = *x;
                let y = section.b0 * xin + z1;
                z1 = section.b1 * xin - section.a1 * y + z2;
                z2 = section.b2 * xin - section.a2 * y;
                *x = y;
            }
        }
        stage
    }

    /// Zero-phase forward-backward application (`scipy.signal.filtfilt`-style).
    pub fn filtfilt(&self, input: &[f64]) -> Vec<f64> {
        let forward = self.filter(input);
        let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
        reversed = self.filter(&reversed);
        reversed.reverse();
        reversed
    }

    pub fn apply(&self, input: &[f64], zero_phase: bool) -> Vec<f64> {
        if zero_phase {
            self.filtfilt(input)
        } else {
            self.filter(input)
        }
    }
}

/// Greedily pair each complex value with the remaining value closest to
/// its conjugate, leaving an unpaired real singleton (`None`) if the
/// count is odd.
fn pair_conjugates(mut items: Vec<Complex64>) -> Vec<(Complex64, Option<Complex64>)> {
    let mut pairs = Vec::new();
    while let Some(first) = items.pop() {
        if items.is_empty() {
            pairs.push((first, None));
            break;
        }
        let target = first.conj();
        let (best_idx, _) = items
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, (*c - target).norm()))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .expect("items non-empty");
        let partner = items.remove(best_idx);
        pairs.push((first, Some(partner)));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detrend_linear_removes_slope() {
        let mut samples: Vec<f64> = (0..10).map(|i| 2.0 * i as f64 + 5.0).collect();
        detrend_linear(&mut samples);
        for s in samples {
            assert!(s.abs() < 1e-6, "residual {s} too large");
        }
    }

    #[test]
    fn detrend_constant_removes_mean() {
        let mut samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        detrend_constant(&mut samples);
        let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn taper_zeroes_edges() {
        let mut samples = vec![1.0; 20];
        taper_cosine(&mut samples, 0.25);
        assert!(samples[0].abs() < 1e-9);
        assert!(samples[19].abs() < 1e-9);
        assert!((samples[10] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn differentiate_of_ramp_is_constant_slope() {
        let samples: Vec<f64> = (0..10).map(|i| 2.0 * i as f64).collect();
        let d = differentiate(&samples, 1.0);
        for v in &d {
            assert!((v - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn mirror_pad_roundtrips() {
        let samples = vec![1.0, 2.0, 3.0];
        let padded = mirror_pad(&samples);
        assert_eq!(padded.len(), 6);
        assert_eq!(unpad(&padded), samples);
    }

    #[test]
    fn lowpass_design_has_expected_section_count() {
        let spec = FilterSpec::new(FilterKind::Lowpass, 4, [5.0, 0.0], 100.0, false);
        let sos = spec.design();
        assert_eq!(sos.sections.len(), 2);
    }

    #[test]
    fn bandpass_attenuates_out_of_band_tone() {
        let fs = 100.0;
        let spec = FilterSpec::new(FilterKind::Bandpass, 2, [5.0, 10.0], fs, true);
        let sos = spec.design();
        let n = 512;
        let in_band: Vec<f64> = (0..n).map(|i| (2.0 * PI * 7.5 * i as f64 / fs).sin()).collect();
        let out_of_band: Vec<f64> = (0..n).map(|i| (2.0 * PI * 40.0 * i as f64 / fs).sin()).collect();
        let passed = sos.apply(&in_band, true);
        let blocked = sos.apply(&out_of_band, true);
        let rms = |v: &[f64]| (v.iter().map(|x| x * x).sum::<f64>() / v.len() as f64).sqrt();
        assert!(rms(&passed) > rms(&blocked));
    }
}
