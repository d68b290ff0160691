//! Synthetic spectra shared across the test suite.

/// A noiseless Gaussian peak on a flat background over integer channels
/// `0..n`: `y = background + amplitude · exp(-((x - center)/width)²)`
pub fn synthetic_gaussian(
    n: usize,
    center: f64,
    amplitude: f64,
    width: f64,
    background: f64,
) -> (Vec<f64>, Vec<f64>) {
    let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let y = x
        .iter()
        .map(|&c| background + amplitude * (-((c - center) / width).powi(2)).exp())
        .collect();
    (x, y)
}

/// Several noiseless Gaussian peaks `(center, amplitude, width)` on a flat
/// background
pub fn synthetic_spectrum(
    n: usize,
    peaks: &[(f64, f64, f64)],
    background: f64,
) -> (Vec<f64>, Vec<f64>) {
    let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let y = x
        .iter()
        .map(|&c| {
            background
                + peaks
                    .iter()
                    .map(|(center, amplitude, width)| {
                        amplitude * (-((c - center) / width).powi(2)).exp()
                    })
                    .sum::<f64>()
        })
        .collect();
    (x, y)
}
