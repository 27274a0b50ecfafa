//! Online log-mel filterbank front-end.
//!
//! Converts a normalised float PCM stream into overlapping log-mel segment
//! rows. Rows accumulate in a circular buffer; [`OnlineFbank::pull_segments`]
//! hands out `pull_segment_count` consecutive rows while advancing only
//! `pull_segment_step`, so consecutive encoder inputs share their overlap.

mod mel;

use ndarray::{Array2, ArrayView1};
use rustfft::algorithm::{Dft, Radix4};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftDirection};

use crate::error::AprilError;

/// `2^-23`, the floor applied before taking log energies.
const ENERGY_EPS: f32 = 1.1920928955078125e-07;

/// Row-buffer capacity in pulled-segment multiples.
const ROW_CAPACITY_SEGMENTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FbankOptions {
    /// Sample frequency in Hz, e.g. 16000.
    pub sample_freq: u32,
    /// Frame stride in milliseconds, e.g. 10.
    pub frame_shift_ms: u32,
    /// Window length in milliseconds, e.g. 25.
    pub frame_length_ms: u32,
    /// Number of mel bins, e.g. 80.
    pub num_bins: usize,
    /// Round the window size up to the next power of two.
    pub round_pow2: bool,
    /// Mel low frequency in Hz, e.g. 20.
    pub mel_low: u32,
    /// Mel high frequency in Hz. 0 means Nyquist.
    pub mel_high: u32,
    /// Only full windows are emitted. The alternative is unsupported.
    pub snip_edges: bool,
    /// Rows per pulled segment, e.g. 9.
    pub pull_segment_count: usize,
    /// Rows advanced per pull, e.g. 4.
    pub pull_segment_step: usize,
    pub remove_dc_offset: bool,
    pub preemph_coeff: f32,
}

impl Default for FbankOptions {
    fn default() -> Self {
        Self {
            sample_freq: 16000,
            frame_shift_ms: 10,
            frame_length_ms: 25,
            num_bins: 80,
            round_pow2: true,
            mel_low: 20,
            mel_high: 0,
            snip_edges: true,
            pull_segment_count: 9,
            pull_segment_step: 4,
            remove_dc_offset: true,
            preemph_coeff: 0.97,
        }
    }
}

fn round_up_to_pow2(n: usize) -> usize {
    n.next_power_of_two()
}

/// Povey window: `(0.5 - 0.5 cos(2 pi n / N))^0.85`.
fn povey_window(len: usize) -> Vec<f32> {
    let n_f = len as f64;
    (0..len)
        .map(|i| {
            let n = i as f64;
            (0.5 - 0.5 * (n / n_f * std::f64::consts::TAU).cos()).powf(0.85) as f32
        })
        .collect()
}

enum FftPlan {
    Radix4(Radix4<f32>),
    Dft(Dft<f32>),
}

impl FftPlan {
    fn new(len: usize) -> Self {
        if len.is_power_of_two() {
            FftPlan::Radix4(Radix4::new(len, FftDirection::Forward))
        } else {
            FftPlan::Dft(Dft::new(len, FftDirection::Forward))
        }
    }

    fn process(&self, buffer: &mut [Complex<f32>], scratch: &mut [Complex<f32>]) {
        match self {
            FftPlan::Radix4(fft) => fft.process_with_scratch(buffer, scratch),
            FftPlan::Dft(fft) => fft.process_with_scratch(buffer, scratch),
        }
    }

    fn scratch_len(&self) -> usize {
        match self {
            FftPlan::Radix4(fft) => fft.get_inplace_scratch_len(),
            FftPlan::Dft(fft) => fft.get_inplace_scratch_len(),
        }
    }
}

pub struct OnlineFbank {
    opts: FbankOptions,

    window_shift: usize,
    padded_window_size: usize,
    num_fft_bins: usize,

    window: Vec<f32>,
    mel_banks: Array2<f32>,

    /// Circular row buffer, `capacity_rows * num_bins` floats.
    rows: Vec<f32>,
    capacity_rows: usize,
    head: usize,
    tail: usize,
    avail: usize,
    /// Tracks availability including flush-padding debt; goes negative while
    /// padded segments are being pulled, bounding the flush loop.
    avail_signed: isize,

    leftover: Vec<f32>,
    leftover_len: usize,

    fft: FftPlan,
    fft_buffer: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    frame: Vec<f32>,
    power: Vec<f32>,

    /// Advisory time-compression factor, 1.0 = realtime.
    speed: f64,
}

impl OnlineFbank {
    pub fn new(opts: FbankOptions) -> Result<OnlineFbank, AprilError> {
        if !opts.snip_edges {
            return Err(AprilError::Config("snip_edges = false is unsupported"));
        }
        if opts.num_bins == 0 || opts.pull_segment_count == 0 {
            return Err(AprilError::Config("filterbank dimensions must be non-zero"));
        }
        if opts.pull_segment_step == 0 || opts.pull_segment_step > opts.pull_segment_count {
            return Err(AprilError::Config(
                "pull_segment_step must be in 1..=pull_segment_count",
            ));
        }
        if opts.frame_shift_ms == 0 || opts.frame_shift_ms > opts.frame_length_ms {
            return Err(AprilError::Config(
                "frame_shift_ms must be in 1..=frame_length_ms",
            ));
        }

        let window_shift = (opts.frame_shift_ms * opts.sample_freq / 1000) as usize;
        let window_size = (opts.frame_length_ms * opts.sample_freq / 1000) as usize;
        if window_shift == 0 || window_size == 0 {
            return Err(AprilError::Config("window sizes round down to zero"));
        }

        let padded_window_size = if opts.round_pow2 {
            round_up_to_pow2(window_size)
        } else {
            window_size
        };
        let num_fft_bins = padded_window_size / 2;

        let mel_banks = mel::generate_banks(
            opts.num_bins,
            num_fft_bins,
            padded_window_size,
            opts.sample_freq,
            opts.mel_low,
            opts.mel_high,
        );

        let capacity_rows = ROW_CAPACITY_SEGMENTS * opts.pull_segment_count;
        let fft = FftPlan::new(padded_window_size);
        let scratch_len = fft.scratch_len();

        Ok(OnlineFbank {
            window_shift,
            padded_window_size,
            num_fft_bins,
            window: povey_window(padded_window_size),
            mel_banks,
            rows: vec![0.0; capacity_rows * opts.num_bins],
            capacity_rows,
            head: 0,
            tail: 0,
            avail: 0,
            avail_signed: 0,
            leftover: vec![0.0; padded_window_size * 2],
            leftover_len: 0,
            fft,
            fft_buffer: vec![Complex::default(); padded_window_size],
            fft_scratch: vec![Complex::default(); scratch_len],
            frame: vec![0.0; padded_window_size],
            power: vec![0.0; num_fft_bins],
            speed: 1.0,
            opts,
        })
    }

    /// Number of rows currently available to pull.
    pub fn available_rows(&self) -> usize {
        self.avail
    }

    /// Milliseconds of audio consumed per successful [`pull_segments`] call.
    pub fn segments_stride_ms(&self) -> u64 {
        self.opts.pull_segment_step as u64 * self.opts.frame_shift_ms as u64
    }

    /// Floats expected by the `out` buffer of [`pull_segments`].
    pub fn segment_len(&self) -> usize {
        self.opts.pull_segment_count * self.opts.num_bins
    }

    /// Sets the advisory time-compression factor, clamped to `[1.0, 2.0]`.
    /// Values above 1.0 stretch the analysis stride, trading accuracy for
    /// compute when a realtime session is falling behind.
    pub fn set_speed(&mut self, factor: f64) {
        self.speed = factor.clamp(1.0, 2.0);
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    fn effective_shift(&self) -> usize {
        ((self.window_shift as f64 * self.speed) as usize).max(1)
    }

    /// Consumes normalised `[-1, 1]` samples, producing one log-mel row per
    /// full analysis window. Partial windows are stashed and completed by the
    /// next call. If the row buffer is full the incoming audio is dropped
    /// with a warning.
    pub fn accept_waveform(&mut self, wave: &[f32]) {
        let shift = self.effective_shift();
        let padded = self.padded_window_size;

        for i in 0.. {
            if self.avail + 1 > self.capacity_rows {
                log::warn!("filterbank ran out of row space; call pull_segments more often");
                return;
            }

            let start_idx = (i * shift) as isize - self.leftover_len as isize;
            let end_idx = start_idx + padded as isize;

            if end_idx > wave.len() as isize {
                self.stash_leftover(wave, start_idx);
                return;
            }

            self.fill_frame(wave, start_idx);
            self.compute_row();
        }
    }

    fn stash_leftover(&mut self, wave: &[f32], start_idx: isize) {
        if start_idx >= 0 {
            let start = start_idx as usize;
            let keep = wave.len() - start;
            debug_assert!(keep < self.leftover.len());
            self.leftover[..keep].copy_from_slice(&wave[start..]);
        } else {
            // The next window still needs the tail of the previous leftover.
            let from_prev = (-start_idx) as usize;
            debug_assert!(wave.len() + from_prev <= self.leftover.len());
            self.leftover
                .copy_within(self.leftover_len - from_prev..self.leftover_len, 0);
            self.leftover[from_prev..from_prev + wave.len()].copy_from_slice(wave);
        }
        self.leftover_len = (wave.len() as isize - start_idx) as usize;
    }

    fn fill_frame(&mut self, wave: &[f32], start_idx: isize) {
        for (j, slot) in self.frame.iter_mut().enumerate() {
            let wave_idx = start_idx + j as isize;
            *slot = if wave_idx < 0 {
                self.leftover[(self.leftover_len as isize + wave_idx) as usize]
            } else {
                wave[wave_idx as usize]
            };
        }

        if self.opts.remove_dc_offset {
            let mean = self.frame.iter().sum::<f32>() / self.frame.len() as f32;
            for s in self.frame.iter_mut() {
                *s -= mean;
            }
        }

        if self.opts.preemph_coeff != 0.0 {
            let coeff = self.opts.preemph_coeff;
            for j in (1..self.frame.len()).rev() {
                self.frame[j] -= coeff * self.frame[j - 1];
            }
            self.frame[0] -= coeff * self.frame[0];
        }

        for (s, w) in self.frame.iter_mut().zip(&self.window) {
            *s *= w;
        }
    }

    fn compute_row(&mut self) {
        for (slot, &s) in self.fft_buffer.iter_mut().zip(&self.frame) {
            *slot = Complex::new(s, 0.0);
        }
        self.fft.process(&mut self.fft_buffer, &mut self.fft_scratch);

        for (p, c) in self.power.iter_mut().zip(&self.fft_buffer[..self.num_fft_bins]) {
            *p = c.norm_sqr();
        }

        let power = ArrayView1::from(&self.power[..]);
        let energies = self.mel_banks.dot(&power);

        let row = &mut self.rows[self.head * self.opts.num_bins..][..self.opts.num_bins];
        for (out, &e) in row.iter_mut().zip(energies.iter()) {
            *out = e.max(ENERGY_EPS).ln();
        }

        self.head = (self.head + 1) % self.capacity_rows;
        self.avail += 1;
        self.avail_signed = self.avail as isize;
    }

    /// Copies `pull_segment_count` consecutive rows into `out` and advances
    /// the read position by `pull_segment_step` rows. Returns false without
    /// mutating anything when not enough rows have accumulated. `out` must be
    /// exactly [`segment_len`](Self::segment_len) floats.
    pub fn pull_segments(&mut self, out: &mut [f32]) -> bool {
        assert_eq!(out.len(), self.segment_len(), "segment buffer size mismatch");

        if self.avail < self.opts.pull_segment_count {
            return false;
        }

        let bins = self.opts.num_bins;
        for i in 0..self.opts.pull_segment_count {
            let row = (self.tail + i) % self.capacity_rows;
            out[i * bins..][..bins].copy_from_slice(&self.rows[row * bins..][..bins]);
        }

        self.tail = (self.tail + self.opts.pull_segment_step) % self.capacity_rows;
        self.avail -= self.opts.pull_segment_step;
        self.avail_signed -= self.opts.pull_segment_step as isize;

        true
    }

    /// Pads the row buffer with `ln(eps)` rows until a full segment can be
    /// pulled. Returns false once the padding debt exceeds three segments,
    /// bounding flush loops.
    pub fn flush(&mut self) -> bool {
        let min = -((self.opts.pull_segment_count * 3) as isize);
        if self.avail_signed < min {
            return false;
        }

        while self.avail < self.opts.pull_segment_count {
            let row = &mut self.rows[self.head * self.opts.num_bins..][..self.opts.num_bins];
            row.fill(ENERGY_EPS.ln());

            self.head = (self.head + 1) % self.capacity_rows;
            self.avail += 1;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_opts() -> FbankOptions {
        FbankOptions {
            sample_freq: 1000,
            frame_shift_ms: 100,
            frame_length_ms: 100,
            num_bins: 4,
            mel_low: 10,
            pull_segment_count: 3,
            pull_segment_step: 2,
            ..FbankOptions::default()
        }
    }

    #[test]
    fn rejects_non_snip_edges() {
        let opts = FbankOptions {
            snip_edges: false,
            ..FbankOptions::default()
        };
        assert!(OnlineFbank::new(opts).is_err());
    }

    #[test]
    fn one_extra_sample_completes_a_window() {
        // window 100 samples, padded to 128; shift 100.
        let mut fbank = OnlineFbank::new(tiny_opts()).unwrap();

        fbank.accept_waveform(&vec![0.25; 99]);
        assert_eq!(fbank.available_rows(), 0);

        // 100 combined samples still fall short of the 128-sample padded
        // window, so no row yet.
        fbank.accept_waveform(&[0.25]);
        assert_eq!(fbank.available_rows(), 0);

        // Crossing the padded window size produces the first row.
        fbank.accept_waveform(&vec![0.25; 28]);
        assert_eq!(fbank.available_rows(), 1);
    }

    #[test]
    fn flush_pads_and_is_bounded() {
        let mut fbank = OnlineFbank::new(tiny_opts()).unwrap();
        let mut out = vec![0.0; fbank.segment_len()];

        // Empty fbank: flush pads to a full segment.
        assert!(fbank.flush());
        assert_eq!(fbank.available_rows(), 3);
        assert!(fbank.pull_segments(&mut out));
        assert!(out.iter().all(|&v| (v - ENERGY_EPS.ln()).abs() < 1e-6));

        // Repeated flush+pull accrues padding debt until three segments'
        // worth has been handed out.
        let mut flushes = 0;
        while fbank.flush() {
            flushes += 1;
            assert!(fbank.pull_segments(&mut out));
            assert!(flushes < 32, "flush loop must terminate");
        }
        assert!(flushes >= 1);
    }

    #[test]
    fn pull_requires_full_segment() {
        let mut fbank = OnlineFbank::new(tiny_opts()).unwrap();
        // Two rows available, three needed.
        fbank.accept_waveform(&vec![0.5; 228]);
        assert_eq!(fbank.available_rows(), 2);

        let mut out = vec![0.0; fbank.segment_len()];
        assert!(!fbank.pull_segments(&mut out));
        assert_eq!(fbank.available_rows(), 2);
    }

    #[test]
    fn pulls_share_overlap_rows() {
        let mut fbank = OnlineFbank::new(tiny_opts()).unwrap();
        let wave: Vec<f32> = (0..1000).map(|i| ((i as f32) * 0.013).sin() * 0.5).collect();
        fbank.accept_waveform(&wave);
        assert!(fbank.available_rows() >= 5);

        let bins = 4;
        let mut first = vec![0.0; fbank.segment_len()];
        let mut second = vec![0.0; fbank.segment_len()];
        assert!(fbank.pull_segments(&mut first));
        assert!(fbank.pull_segments(&mut second));

        // Step 2, count 3: the second pull starts at the first pull's row 2.
        assert_eq!(&first[2 * bins..3 * bins], &second[..bins]);
    }

    #[test]
    fn chunking_does_not_change_rows() {
        let wave: Vec<f32> = (0..4000)
            .map(|i| ((i as f32) * 0.00737).sin() * 0.3 + ((i as f32) * 0.0031).cos() * 0.1)
            .collect();

        let rows_for = |chunk: usize| -> Vec<f32> {
            let mut fbank = OnlineFbank::new(FbankOptions::default()).unwrap();
            for part in wave.chunks(chunk) {
                fbank.accept_waveform(part);
            }
            let mut all = Vec::new();
            let mut out = vec![0.0; fbank.segment_len()];
            while fbank.pull_segments(&mut out) {
                all.extend_from_slice(&out);
            }
            all
        };

        let whole = rows_for(4000);
        assert!(!whole.is_empty());
        assert_eq!(whole, rows_for(160));
        assert_eq!(whole, rows_for(7));
        assert_eq!(whole, rows_for(513));
    }
}
