//! Spectral analysis of sampled optical spectra.
//!
//! All functions here are pure: they take a [`SpectrumSample`] (or plain slices) and
//! return values, with no I/O and no cached state. Frequencies are in THz, powers in
//! dBm unless stated otherwise.
//!
//! - [`find_peak`] / [`find_center`]: locate the channel
//! - [`integrate`] / [`six_point_osnr`] / [`signal_power_dbm`]: window integration and OSNR
//! - [`multi_peak_smsr`]: side-mode suppression ratio from local maxima
//! - [`nm_to_thz`] / [`thz_to_nm`]: unit conversion

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SpectrumConfig;

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Floor added inside the OSNR logarithm so a spectrum without a peak yields a finite
/// (very negative) value instead of `-inf`.
pub const OSNR_EPSILON: f64 = 1e-7;

/// Maximum number of peaks reported by [`multi_peak_smsr`].
pub const MAX_REPORTED_PEAKS: usize = 5;

/// Errors raised by the spectral algorithms
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectralError {
    #[error("Empty input array")]
    EmptyInput,

    #[error("Frequency and power arrays differ in length ({frequency} vs {power})")]
    LengthMismatch { frequency: usize, power: usize },

    #[error("Invalid integration window: {0}")]
    InvalidWindow(String),

    #[error("Resolution bandwidth must be positive, got {0}")]
    InvalidBandwidth(f64),
}

/// Wavelength in nm to frequency in THz.
pub fn nm_to_thz(nm: f64) -> f64 {
    SPEED_OF_LIGHT / nm * 1e-3
}

/// Frequency in THz to wavelength in nm.
pub fn thz_to_nm(thz: f64) -> f64 {
    SPEED_OF_LIGHT / thz * 1e-3
}

/// dBm to mW.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// mW to dBm.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// One acquisition: frequency axis and power in dBm, equal length.
///
/// Linear power is derived on every call to [`linear_power_mw`](Self::linear_power_mw);
/// nothing is cached, so a new acquisition can never be paired with stale derived data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSample {
    frequency_thz: Vec<f64>,
    power_dbm: Vec<f64>,
}

impl SpectrumSample {
    /// Build a sample, checking that both arrays have the same length.
    pub fn new(frequency_thz: Vec<f64>, power_dbm: Vec<f64>) -> Result<Self, SpectralError> {
        if frequency_thz.len() != power_dbm.len() {
            return Err(SpectralError::LengthMismatch {
                frequency: frequency_thz.len(),
                power: power_dbm.len(),
            });
        }
        Ok(Self {
            frequency_thz,
            power_dbm,
        })
    }

    /// Build a sample from a wavelength axis in nm.
    pub fn from_wavelength(wavelength_nm: &[f64], power_dbm: Vec<f64>) -> Result<Self, SpectralError> {
        Self::new(wavelength_nm.iter().map(|&nm| nm_to_thz(nm)).collect(), power_dbm)
    }

    /// Frequency axis in THz.
    pub fn frequency(&self) -> &[f64] {
        &self.frequency_thz
    }

    /// Power in dBm.
    pub fn power(&self) -> &[f64] {
        &self.power_dbm
    }

    /// Power in mW, recomputed on each call.
    pub fn linear_power_mw(&self) -> Vec<f64> {
        self.power_dbm.iter().map(|&p| dbm_to_mw(p)).collect()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.power_dbm.len()
    }

    /// True when the acquisition has no points.
    pub fn is_empty(&self) -> bool {
        self.power_dbm.is_empty()
    }
}

/// Global maximum of a power array
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub index: usize,
    pub power: f64,
}

/// Channel centre reported by [`find_center`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Center {
    pub frequency_thz: f64,
    pub power_dbm: f64,
    pub index: usize,
}

/// Global maximum; the first index wins on ties.
pub fn find_peak(power: &[f64]) -> Result<Peak, SpectralError> {
    let first = *power.first().ok_or(SpectralError::EmptyInput)?;
    let mut peak = Peak {
        index: 0,
        power: first,
    };
    for (index, &value) in power.iter().enumerate().skip(1) {
        if value > peak.power || (peak.power.is_nan() && !value.is_nan()) {
            peak = Peak {
                index,
                power: value,
            };
        }
    }
    Ok(peak)
}

fn check_lengths(frequency: &[f64], power: &[f64]) -> Result<(), SpectralError> {
    if frequency.len() != power.len() {
        return Err(SpectralError::LengthMismatch {
            frequency: frequency.len(),
            power: power.len(),
        });
    }
    if power.is_empty() {
        return Err(SpectralError::EmptyInput);
    }
    Ok(())
}

/// Locate the channel centre.
///
/// From the peak, scan outwards until the power is at least `threshold_db` below the
/// peak on each side. When a side never drops that far the array bound is used. The
/// centre index is the midpoint of the two boundary indices (halves round to even) and
/// the centre frequency is the mean of the two boundary frequencies.
pub fn find_center(frequency: &[f64], power: &[f64], threshold_db: f64) -> Result<Center, SpectralError> {
    check_lengths(frequency, power)?;
    let peak = find_peak(power)?;
    let floor = peak.power - threshold_db;

    let left = (0..=peak.index)
        .rev()
        .find(|&i| power[i] <= floor)
        .unwrap_or(0);
    let right = (peak.index..power.len())
        .find(|&i| power[i] <= floor)
        .unwrap_or(power.len() - 1);

    let index = ((left + right) as f64 / 2.0).round_ties_even() as usize;
    Ok(Center {
        frequency_thz: (frequency[left] + frequency[right]) / 2.0,
        power_dbm: power[index],
        index,
    })
}

fn nearest_index(axis: &[f64], value: f64) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, &x) in axis.iter().enumerate() {
        let distance = (x - value).abs();
        if distance < best_distance {
            best = i;
            best_distance = distance;
        }
    }
    best
}

/// Integrated power in mW between two axis positions.
///
/// `Δ · Σ P_mW / rbw` where `Δ` is the axis span divided by the number of samples and
/// the sum runs over the half-open index range between the samples nearest to `start`
/// and `stop`.
pub fn integrate(sample: &SpectrumSample, start: f64, stop: f64, rbw: f64) -> Result<f64, SpectralError> {
    if sample.is_empty() {
        return Err(SpectralError::EmptyInput);
    }
    if rbw <= 0.0 || rbw.is_nan() {
        return Err(SpectralError::InvalidBandwidth(rbw));
    }
    let axis = sample.frequency();
    let n = axis.len();
    let step = (axis[n - 1] - axis[0]).abs() / n as f64;

    let a = nearest_index(axis, start);
    let b = nearest_index(axis, stop);
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

    let sum: f64 = sample.power()[lo..hi].iter().map(|&p| dbm_to_mw(p)).sum();
    Ok(step * sum / rbw)
}

/// The six window edges of an OSNR measurement, in axis units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OsnrWindows {
    pub sig1: f64,
    pub sig2: f64,
    pub nl1: f64,
    pub nl2: f64,
    pub nr1: f64,
    pub nr2: f64,
}

impl OsnrWindows {
    /// Three windows of width `signal_bw`: one on `center`, two offset by `noise_offset`.
    pub fn around(center: f64, signal_bw: f64, noise_offset: f64) -> Self {
        let half = signal_bw * 0.5;
        Self {
            sig1: center - half,
            sig2: center + half,
            nl1: center - noise_offset - half,
            nl2: center - noise_offset + half,
            nr1: center + noise_offset - half,
            nr2: center + noise_offset + half,
        }
    }

    fn validate(&self) -> Result<(), SpectralError> {
        for (name, a, b) in [
            ("signal", self.sig1, self.sig2),
            ("left noise", self.nl1, self.nl2),
            ("right noise", self.nr1, self.nr2),
        ] {
            if !(b - a).is_normal() {
                return Err(SpectralError::InvalidWindow(format!(
                    "{} window [{}, {}] has no width",
                    name, a, b
                )));
            }
        }
        Ok(())
    }
}

/// Signal power and noise density of a six-point evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SixPointResult {
    /// In-channel signal power with the noise floor removed, mW
    pub signal_mw: f64,
    /// Noise power per axis unit, mean of the two side windows
    pub noise_density: f64,
}

/// Integrate the three windows and separate signal from in-band noise.
pub fn evaluate_six_points(
    sample: &SpectrumSample,
    windows: &OsnrWindows,
    rbw: f64,
) -> Result<SixPointResult, SpectralError> {
    windows.validate()?;
    let signal_and_noise = integrate(sample, windows.sig1, windows.sig2, rbw)?;
    let noise_left = integrate(sample, windows.nl1, windows.nl2, rbw)?;
    let noise_right = integrate(sample, windows.nr1, windows.nr2, rbw)?;

    let noise_density = (noise_left / (windows.nl2 - windows.nl1).abs()
        + noise_right / (windows.nr2 - windows.nr1).abs())
        / 2.0;
    let noise_in_channel = noise_density * (windows.sig2 - windows.sig1).abs();

    Ok(SixPointResult {
        signal_mw: signal_and_noise - noise_in_channel,
        noise_density,
    })
}

/// Six-point OSNR in dB, noise referenced to `ref_bw`.
///
/// `10·log10(signal / (density · ref_bw) + 1e-7)`; see [`OSNR_EPSILON`].
pub fn six_point_osnr(
    sample: &SpectrumSample,
    windows: &OsnrWindows,
    rbw: f64,
    ref_bw: f64,
) -> Result<f64, SpectralError> {
    let result = evaluate_six_points(sample, windows, rbw)?;
    let noise_in_ref_bw = result.noise_density * ref_bw;
    Ok(10.0 * (result.signal_mw / noise_in_ref_bw + OSNR_EPSILON).log10())
}

/// In-channel signal power in dBm, noise floor removed.
pub fn signal_power_dbm(
    sample: &SpectrumSample,
    windows: &OsnrWindows,
    rbw: f64,
) -> Result<f64, SpectralError> {
    Ok(mw_to_dbm(evaluate_six_points(sample, windows, rbw)?.signal_mw))
}

/// Side-mode search settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmsrSettings {
    /// Side modes must be strictly above this power, dBm
    pub level_db: f64,
    /// Side modes must be further than this from the main peak, GHz
    pub min_distance_ghz: f64,
    /// Side modes must be closer than this to the main peak, GHz
    pub max_distance_ghz: f64,
    /// Resolution bandwidth, THz; sets the minimum peak spacing in samples
    pub rbw_thz: f64,
}

impl Default for SmsrSettings {
    fn default() -> Self {
        Self {
            level_db: -70.0,
            min_distance_ghz: 5.0,
            max_distance_ghz: 5000.0,
            rbw_thz: 180e-6,
        }
    }
}

/// Reported peaks (strongest first) and the SMSR between the first two.
///
/// With no peak at all every field is NaN; with a single reported peak `smsr_db` is NaN
/// unless the spectrum had exactly one local maximum, in which case it is that peak's
/// prominence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsrResult {
    pub frequencies_thz: Vec<f64>,
    pub powers_dbm: Vec<f64>,
    pub smsr_db: f64,
}

impl SmsrResult {
    fn undefined() -> Self {
        Self {
            frequencies_thz: vec![f64::NAN],
            powers_dbm: vec![f64::NAN],
            smsr_db: f64::NAN,
        }
    }
}

/// Strict local maxima; a flat top counts once, at its middle sample (rounded down).
/// The first and last samples are never peaks.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Drop peaks closer than `distance` samples to a taller peak.
fn select_by_distance(peaks: &[usize], x: &[f64], distance: usize) -> Vec<usize> {
    if distance <= 1 {
        return peaks.to_vec();
    }
    let mut keep = vec![true; peaks.len()];
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| x[peaks[b]].total_cmp(&x[peaks[a]]));
    for &j in &order {
        if !keep[j] {
            continue;
        }
        for k in (0..j).rev() {
            if peaks[j] - peaks[k] >= distance {
                break;
            }
            keep[k] = false;
        }
        for k in j + 1..peaks.len() {
            if peaks[k] - peaks[j] >= distance {
                break;
            }
            keep[k] = false;
        }
    }
    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

/// Height of a peak above the higher of the two minima reached before a taller sample
/// (or the array edge) on either side.
fn prominence(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];
    let mut left_min = height;
    for &v in x[..=peak].iter().rev() {
        if v > height {
            break;
        }
        left_min = left_min.min(v);
    }
    let mut right_min = height;
    for &v in &x[peak..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }
    height - left_min.max(right_min)
}

/// Side-mode suppression ratio from the local maxima of a spectrum.
///
/// Peaks closer than `ceil(rbw / mean Δf)` samples to a taller one are discarded. With
/// two or more peaks, candidates are sorted by power; side modes must lie strictly
/// between `min_distance_ghz` and `max_distance_ghz` from the strongest peak and
/// strictly above `level_db`. When the level filter leaves only the main peak, the
/// strongest distance-qualified side mode is reported anyway; when no side mode
/// qualifies by distance, only the main peak is reported and SMSR is NaN.
pub fn multi_peak_smsr(
    frequency: &[f64],
    power: &[f64],
    settings: &SmsrSettings,
) -> Result<SmsrResult, SpectralError> {
    check_lengths(frequency, power)?;

    let steps: Vec<f64> = frequency.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    let mean_step = if steps.is_empty() {
        0.0
    } else {
        steps.iter().sum::<f64>() / steps.len() as f64
    };
    let distance = if mean_step > 0.0 {
        ((settings.rbw_thz / mean_step).ceil() as usize).max(1)
    } else {
        1
    };

    let peaks = select_by_distance(&local_maxima(power), power, distance);
    match peaks.len() {
        0 => return Ok(SmsrResult::undefined()),
        1 => {
            let p = peaks[0];
            return Ok(SmsrResult {
                frequencies_thz: vec![frequency[p]],
                powers_dbm: vec![power[p]],
                smsr_db: prominence(power, p),
            });
        }
        _ => {}
    }

    let mut candidates = peaks;
    candidates.sort_by(|&a, &b| power[b].total_cmp(&power[a]));
    let top = candidates[0];

    let by_distance: Vec<usize> = candidates[1..]
        .iter()
        .copied()
        .filter(|&p| {
            let delta_ghz = (frequency[p] - frequency[top]).abs() * 1e3;
            settings.min_distance_ghz < delta_ghz && delta_ghz < settings.max_distance_ghz
        })
        .collect();

    let mut selected: Vec<usize> = std::iter::once(top)
        .chain(by_distance.iter().copied())
        .filter(|&p| power[p] > settings.level_db)
        .collect();
    if selected.is_empty() {
        selected.push(top);
    }
    if selected.len() == 1 {
        if let Some(&side) = by_distance.first() {
            if side != selected[0] {
                selected.push(side);
            }
        }
    }
    selected.truncate(MAX_REPORTED_PEAKS);

    let powers_dbm: Vec<f64> = selected.iter().map(|&p| power[p]).collect();
    let smsr_db = if powers_dbm.len() >= 2 {
        powers_dbm[0] - powers_dbm[1]
    } else {
        f64::NAN
    };
    Ok(SmsrResult {
        frequencies_thz: selected.iter().map(|&p| frequency[p]).collect(),
        powers_dbm,
        smsr_db,
    })
}

/// Centre, OSNR, signal power and SMSR of one acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSummary {
    pub center: Center,
    pub osnr_db: f64,
    pub signal_power_dbm: f64,
    pub smsr: SmsrResult,
}

impl SpectrumSummary {
    /// Run the full analysis chain with the configured parameters.
    pub fn analyze(sample: &SpectrumSample, config: &SpectrumConfig) -> Result<Self, SpectralError> {
        let center = find_center(sample.frequency(), sample.power(), config.center_threshold_db)?;
        let windows = OsnrWindows::around(
            center.frequency_thz,
            config.signal_bw_thz,
            config.noise_offset_thz,
        );
        let osnr_db = six_point_osnr(sample, &windows, config.rbw_thz, config.noise_bw_thz)?;
        let signal_power_dbm = signal_power_dbm(sample, &windows, config.rbw_thz)?;
        let smsr = multi_peak_smsr(
            sample.frequency(),
            sample.power(),
            &SmsrSettings {
                level_db: config.smsr_level_db,
                min_distance_ghz: config.smsr_min_distance_ghz,
                max_distance_ghz: config.smsr_max_distance_ghz,
                rbw_thz: config.rbw_thz,
            },
        )?;
        Ok(Self {
            center,
            osnr_db,
            signal_power_dbm,
            smsr,
        })
    }
}
