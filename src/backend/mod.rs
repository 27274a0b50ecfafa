//! The three-operation tensor capability the runtime depends on.
//!
//! Each call is batched: parallel slices index the participating sessions,
//! and every per-session buffer is exactly the size announced by
//! [`StateDims`]. Implementations must be deterministic per call.

mod candle;

pub use candle::CandleBackend;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("tensor compute error")]
    Candle(#[from] candle_core::Error),

    #[error("missing tensor: {0}")]
    MissingTensor(String),

    #[error("shape mismatch: {0}")]
    Shape(String),
}

/// Per-session buffer sizes, fixed for a model's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDims {
    pub num_layers: usize,
    /// Recurrent hidden state floats per layer.
    pub h_dim: usize,
    /// Recurrent cell state floats per layer.
    pub c_dim: usize,
    /// Width of `enc_out` / `dec_out`.
    pub joiner_dim: usize,
}

pub trait Backend: Send + Sync {
    fn state_dims(&self) -> StateDims;

    /// Runs the acoustic encoder over one segment per session. `inputs` holds
    /// `segment_size * mel_features` floats each; `h_states` / `c_states`
    /// hold `num_layers * {h,c}_dim` floats and are updated in place;
    /// `enc_outs` receive `joiner_dim` floats.
    fn encode(
        &self,
        inputs: &[&[f32]],
        h_states: &mut [&mut [f32]],
        c_states: &mut [&mut [f32]],
        enc_outs: &mut [&mut [f32]],
    ) -> Result<(), BackendError>;

    /// Runs the stateless prediction network over each session's two-token
    /// context, writing `joiner_dim` floats per session.
    fn decode(&self, token_ctx: &[[i32; 2]], dec_outs: &mut [&mut [f32]])
        -> Result<(), BackendError>;

    /// Joins encoder and decoder outputs into `token_count` logits per
    /// session.
    fn join(
        &self,
        enc_outs: &[&[f32]],
        dec_outs: &[&[f32]],
        logits: &mut [&mut [f32]],
    ) -> Result<(), BackendError>;
}
