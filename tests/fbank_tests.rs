use april_asr::fbank::{FbankOptions, OnlineFbank};

fn sine(len: usize, step: f32) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * step).sin() * 0.4).collect()
}

#[test]
fn no_row_until_a_padded_window_fits() {
    // 16 kHz defaults: shift 160 samples, window 400 padded to 512.
    let mut fbank = OnlineFbank::new(FbankOptions::default()).unwrap();

    fbank.accept_waveform(&sine(159, 0.01));
    assert_eq!(fbank.available_rows(), 0);

    fbank.accept_waveform(&sine(1, 0.01));
    assert_eq!(fbank.available_rows(), 0, "160 samples < 512-sample window");

    fbank.accept_waveform(&sine(352, 0.01));
    assert_eq!(fbank.available_rows(), 1);
}

#[test]
fn rows_are_identical_for_any_feeding_pattern() {
    let wave = sine(6400, 0.0071);

    let run = |chunks: &[usize]| -> Vec<f32> {
        let mut fbank = OnlineFbank::new(FbankOptions::default()).unwrap();
        let mut fed = 0;
        let mut sizes = chunks.iter().cycle();
        while fed < wave.len() {
            let size = (*sizes.next().unwrap()).min(wave.len() - fed);
            fbank.accept_waveform(&wave[fed..fed + size]);
            fed += size;
        }
        let mut rows = Vec::new();
        let mut segment = vec![0.0; fbank.segment_len()];
        while fbank.pull_segments(&mut segment) {
            rows.extend_from_slice(&segment);
        }
        rows
    };

    let reference = run(&[6400]);
    assert!(!reference.is_empty());
    assert_eq!(reference, run(&[3200]));
    assert_eq!(reference, run(&[1, 159, 512, 33]));
    assert_eq!(reference, run(&[777]));
}

#[test]
fn rows_are_finite_log_energies() {
    let mut fbank = OnlineFbank::new(FbankOptions::default()).unwrap();
    fbank.accept_waveform(&sine(4000, 0.013));

    let mut segment = vec![0.0; fbank.segment_len()];
    assert!(fbank.pull_segments(&mut segment));
    for &v in &segment {
        assert!(v.is_finite());
        // ln(2^-23) is the energy floor.
        assert!(v >= (2.0f32).powi(-23).ln() - 1e-3);
    }
}

#[test]
fn flush_padding_stops_after_three_segments() {
    let mut fbank = OnlineFbank::new(FbankOptions::default()).unwrap();
    let mut segment = vec![0.0; fbank.segment_len()];

    let mut pulls = 0;
    while fbank.flush() {
        while fbank.pull_segments(&mut segment) {
            pulls += 1;
        }
        assert!(pulls < 64, "flush must stop supplying padded segments");
    }
    assert!(pulls >= 3);
}

#[test]
fn speed_factor_is_clamped() {
    let mut fbank = OnlineFbank::new(FbankOptions::default()).unwrap();
    fbank.set_speed(0.25);
    assert_eq!(fbank.speed(), 1.0);
    fbank.set_speed(1.5);
    assert_eq!(fbank.speed(), 1.5);
    fbank.set_speed(8.0);
    assert_eq!(fbank.speed(), 2.0);
}
