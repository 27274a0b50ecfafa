use crate::backend::StateDims;
use crate::model::ModelParameters;

/// Per-session scratch buffers shared with the batched backend calls.
pub(crate) struct TensorSlots {
    /// One mel segment, `segment_size * mel_features` floats.
    pub enc_inp: Vec<f32>,
    /// Recurrent hidden states, `num_layers * h_dim` floats.
    pub h_state: Vec<f32>,
    /// Recurrent cell states, `num_layers * c_dim` floats.
    pub c_state: Vec<f32>,
    pub enc_out: Vec<f32>,
    pub dec_out: Vec<f32>,
    pub logits: Vec<f32>,
    /// The last two non-blank token ids, oldest first.
    pub token_ctx: [i32; 2],

    /// Encoder output not yet consumed by a join.
    pub enc_out_refreshed: bool,
    /// Decoder output not yet consumed by a join.
    pub dec_out_refreshed: bool,
    /// Context changed since the last decode.
    pub requires_decoding: bool,
    /// At least one segment has been encoded. Until then the warm-up decode
    /// must not trigger a join against the zeroed encoder output.
    pub encoded_once: bool,
}

impl TensorSlots {
    pub fn new(dims: StateDims, params: &ModelParameters) -> TensorSlots {
        let blank = params.blank_id as i32;
        TensorSlots {
            enc_inp: vec![0.0; (params.segment_size * params.mel_features) as usize],
            h_state: vec![0.0; dims.num_layers * dims.h_dim],
            c_state: vec![0.0; dims.num_layers * dims.c_dim],
            enc_out: vec![0.0; dims.joiner_dim],
            dec_out: vec![0.0; dims.joiner_dim],
            logits: vec![0.0; params.token_count as usize],
            token_ctx: [blank, blank],
            enc_out_refreshed: false,
            dec_out_refreshed: false,
            // The fresh blank context still needs a first decode pass.
            requires_decoding: true,
            encoded_once: false,
        }
    }

    /// Shifts `id` into the context tail and schedules a decode.
    pub fn push_context(&mut self, id: i32) {
        self.token_ctx[0] = self.token_ctx[1];
        self.token_ctx[1] = id;
        self.requires_decoding = true;
    }

    /// Resets the context to blanks and schedules a decode.
    pub fn clear_context(&mut self, blank: i32) {
        self.token_ctx = [blank, blank];
        self.requires_decoding = true;
    }
}
