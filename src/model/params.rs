use crate::error::AprilError;
use crate::fbank::FbankOptions;

/// Immutable parameter record read from the model container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelParameters {
    /// Declared batch size hint; the runtime batches up to its session
    /// registry capacity regardless.
    pub batch_size: u32,
    /// Mel rows per encoder input, e.g. 9.
    pub segment_size: u32,
    /// Rows advanced per pull, e.g. 4.
    pub segment_step: u32,
    pub mel_features: u32,
    pub sample_rate: u32,
    pub frame_shift_ms: u32,
    pub frame_length_ms: u32,
    pub round_pow2: bool,
    pub mel_low: u32,
    pub mel_high: u32,
    pub snip_edges: bool,
    pub token_count: u32,
    pub blank_id: u32,
}

impl ModelParameters {
    /// Range checks ported from the original parameter reader. Returns a
    /// `ModelLoad` error naming the first violated constraint.
    pub fn validate(&self) -> Result<(), AprilError> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(AprilError::ModelLoad(format!("bad parameters: {what}")))
            }
        };

        check(
            self.segment_size > 0 && self.segment_size < 128,
            "segment_size out of range",
        )?;
        check(
            self.segment_step > 0 && self.segment_step <= self.segment_size,
            "segment_step out of range",
        )?;
        check(
            self.mel_features > 0 && self.mel_features <= 512,
            "mel_features out of range",
        )?;
        check(
            self.sample_rate > 0 && self.sample_rate < 144_000,
            "sample_rate out of range",
        )?;
        check(
            self.token_count > 2 && self.token_count < 131_072,
            "token_count out of range",
        )?;
        check(self.blank_id < self.token_count, "blank_id out of range")?;
        check(
            self.frame_shift_ms > 0 && self.frame_shift_ms <= self.frame_length_ms,
            "frame_shift_ms out of range",
        )?;
        check(
            self.frame_length_ms > 0 && self.frame_length_ms <= 5000,
            "frame_length_ms out of range",
        )?;
        check(
            self.mel_low > 0 && self.mel_low < self.sample_rate,
            "mel_low out of range",
        )?;
        check(
            self.mel_high == 0 || self.mel_high > self.mel_low,
            "mel_high out of range",
        )?;
        check(self.snip_edges, "snip_edges = false is unsupported")?;

        Ok(())
    }

    /// Derives the filterbank configuration for sessions of this model.
    pub fn fbank_options(&self) -> FbankOptions {
        FbankOptions {
            sample_freq: self.sample_rate,
            frame_shift_ms: self.frame_shift_ms,
            frame_length_ms: self.frame_length_ms,
            num_bins: self.mel_features as usize,
            round_pow2: self.round_pow2,
            mel_low: self.mel_low,
            mel_high: self.mel_high,
            snip_edges: true,
            pull_segment_count: self.segment_size as usize,
            pull_segment_step: self.segment_step as usize,
            remove_dc_offset: true,
            preemph_coeff: 0.97,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid() -> ModelParameters {
        ModelParameters {
            batch_size: 1,
            segment_size: 9,
            segment_step: 4,
            mel_features: 80,
            sample_rate: 16000,
            frame_shift_ms: 10,
            frame_length_ms: 25,
            round_pow2: true,
            mel_low: 20,
            mel_high: 0,
            snip_edges: true,
            token_count: 500,
            blank_id: 0,
        }
    }

    #[test]
    fn accepts_typical_parameters() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_step_above_size() {
        let params = ModelParameters {
            segment_step: 10,
            ..valid()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_blank_outside_vocabulary() {
        let params = ModelParameters {
            blank_id: 500,
            ..valid()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn fbank_options_mirror_parameters() {
        let opts = valid().fbank_options();
        assert_eq!(opts.sample_freq, 16000);
        assert_eq!(opts.pull_segment_count, 9);
        assert_eq!(opts.pull_segment_step, 4);
        assert!(opts.snip_edges);
    }
}
