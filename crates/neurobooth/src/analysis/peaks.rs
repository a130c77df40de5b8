//! Smoothing and peak picking for the attention component

/// Savitzky-Golay window length (cubic fit)
pub const SMOOTHING_WINDOW: usize = 11;

/// Cubic Savitzky-Golay weights for an 11-sample window, before normalization
const SG_WEIGHTS: [f64; SMOOTHING_WINDOW] =
    [-36.0, 9.0, 44.0, 69.0, 84.0, 89.0, 84.0, 69.0, 44.0, 9.0, -36.0];
const SG_NORM: f64 = 429.0;

/// Savitzky-Golay smoothing with mirrored edges.
///
/// Signals shorter than the window are returned unchanged.
pub fn smooth(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n < SMOOTHING_WINDOW {
        return signal.to_vec();
    }
    let half = (SMOOTHING_WINDOW / 2) as isize;
    let last = n as isize - 1;

    // Reflect about the end samples without repeating them
    let at = |i: isize| -> f64 {
        let idx = if i < 0 {
            -i
        } else if i > last {
            2 * last - i
        } else {
            i
        };
        signal[idx as usize]
    };

    (0..n as isize)
        .map(|center| {
            SG_WEIGHTS
                .iter()
                .enumerate()
                .map(|(k, w)| w * at(center + k as isize - half))
                .sum::<f64>()
                / SG_NORM
        })
        .collect()
}

/// Indices of local maxima. A flat top counts once, at its middle sample.
pub fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    let n = x.len();
    let mut i = 1;
    while i + 1 < n {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead + 1 < n && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

/// Height of a peak above the higher of its two surrounding bases.
pub fn prominence(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];

    let mut left_min = height;
    for &v in x[..peak].iter().rev() {
        if v > height {
            break;
        }
        left_min = left_min.min(v);
    }

    let mut right_min = height;
    for &v in &x[peak + 1..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }

    height - left_min.max(right_min)
}

fn std_dev(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let mean = x.iter().sum::<f64>() / x.len() as f64;
    (x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
}

/// Amplitude of the most prominent smoothed peak reaching at least one
/// standard deviation, or 0 when there is none.
pub fn dominant_peak_amplitude(signal: &[f64]) -> f64 {
    let smoothed = smooth(signal);
    let threshold = std_dev(&smoothed);

    local_maxima(&smoothed)
        .into_iter()
        .filter(|&p| smoothed[p] >= threshold)
        .map(|p| (prominence(&smoothed, p), smoothed[p]))
        .fold(None, |best: Option<(f64, f64)>, cand| match best {
            Some(b) if b.0 >= cand.0 => Some(b),
            _ => Some(cand),
        })
        .map(|(_, height)| height)
        .unwrap_or(0.0)
}
