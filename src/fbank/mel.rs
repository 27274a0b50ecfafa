//! Triangular mel filterbank construction.

use ndarray::Array2;

pub fn mel_scale(freq: f64) -> f64 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

#[allow(dead_code)]
pub fn inverse_mel_scale(mel_freq: f64) -> f64 {
    700.0 * ((mel_freq / 1127.0).exp() - 1.0)
}

/// Builds the `[num_bins, num_fft_bins]` projection matrix. Filter edges are
/// equispaced on the mel scale between `mel_low` and `mel_high` (Nyquist when
/// `mel_high` is zero); weights rise linearly from the left edge to the
/// centre and fall to the right edge.
pub fn generate_banks(
    num_bins: usize,
    num_fft_bins: usize,
    padded_window_size: usize,
    sample_freq: u32,
    mel_low_freq: u32,
    mel_high_freq: u32,
) -> Array2<f32> {
    let mel_high_freq = if mel_high_freq == 0 {
        sample_freq / 2
    } else {
        mel_high_freq
    };

    let fft_bin_width = sample_freq as f32 / padded_window_size as f32;

    let mel_low = mel_scale(mel_low_freq as f64) as f32;
    let mel_high = mel_scale(mel_high_freq as f64) as f32;
    let mel_freq_delta = (mel_high - mel_low) / (num_bins as f32 + 1.0);

    let mut banks = Array2::<f32>::zeros((num_bins, num_fft_bins));
    for (bin, mut row) in banks.outer_iter_mut().enumerate() {
        let left_mel = mel_low + bin as f32 * mel_freq_delta;
        let center_mel = left_mel + mel_freq_delta;
        let right_mel = center_mel + mel_freq_delta;

        for (fft, weight) in row.iter_mut().enumerate() {
            let freq = fft_bin_width * fft as f32;
            let mel = mel_scale(freq as f64) as f32;

            if mel > left_mel && mel < right_mel {
                *weight = if mel <= center_mel {
                    (mel - left_mel) / (center_mel - left_mel)
                } else {
                    (right_mel - mel) / (right_mel - center_mel)
                };
            }
        }
    }

    banks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mel_scale_roundtrip() {
        for freq in [0.0, 100.0, 1000.0, 7999.0] {
            let back = inverse_mel_scale(mel_scale(freq));
            assert!((back - freq).abs() < 1e-6, "{freq} -> {back}");
        }
    }

    #[test]
    fn banks_are_triangular_and_bounded() {
        let banks = generate_banks(80, 256, 512, 16000, 20, 0);
        assert_eq!(banks.shape(), &[80, 256]);

        for row in banks.outer_iter() {
            let sum: f32 = row.sum();
            assert!(sum > 0.0, "every filter must cover at least one fft bin");
            for &w in row.iter() {
                assert!((0.0..=1.0).contains(&w));
            }
        }
    }

    #[test]
    fn zero_mel_high_means_nyquist() {
        let nyquist = generate_banks(40, 256, 512, 16000, 20, 0);
        let explicit = generate_banks(40, 256, 512, 16000, 20, 8000);
        assert_eq!(nyquist, explicit);
    }
}
