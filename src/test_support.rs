//! Deterministic backend and fixtures shared by in-crate tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, BackendError, StateDims};
use crate::model::{Model, ModelMetadata, ModelParameters, Vocabulary};
use crate::session::{RecognitionResult, ResultHandler};

pub const BLANK: usize = 0;

pub fn test_vocab() -> Vocabulary {
    Vocabulary::from_tokens(TEST_TOKENS)
}

/// Id map: 0 blank, 1 " hi", 2 " there", 3 ".", 4 " 3", 5 "!", 6 "um",
/// 7 "5" (digit continuation), 8 " yes".
pub const TEST_TOKENS: [&str; 9] = [
    "<blk>", " hi", " there", ".", " 3", "!", "um", "5", " yes",
];

pub fn test_params() -> ModelParameters {
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
        token_count: TEST_TOKENS.len() as u32,
        blank_id: BLANK as u32,
    }
}

/// Owned mirror of a callback for later inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Partial(Vec<String>),
    Final(Vec<String>),
    Silence,
    CantKeepUp,
}

pub fn recording_handler(events: Arc<Mutex<Vec<Event>>>) -> ResultHandler {
    Box::new(move |result| {
        let texts = |tokens: &[crate::session::Token<'_>]| {
            tokens.iter().map(|t| t.text.to_string()).collect()
        };
        let event = match result {
            RecognitionResult::Partial(tokens) => Event::Partial(texts(tokens)),
            RecognitionResult::Final(tokens) => Event::Final(texts(tokens)),
            RecognitionResult::Silence => Event::Silence,
            RecognitionResult::CantKeepUp => Event::CantKeepUp,
        };
        events.lock().unwrap().push(event);
    })
}

#[derive(Default)]
pub struct Recorder {
    pub encode_batches: Mutex<Vec<usize>>,
    pub decode_batches: Mutex<Vec<usize>>,
    pub join_batches: Mutex<Vec<usize>>,
}

/// A backend that replays scripted logits, one entry per joined session, and
/// records every batch size. An exhausted script yields blank-dominated
/// logits.
pub struct ScriptedBackend {
    pub recorder: Arc<Recorder>,
    pub script: Mutex<VecDeque<Vec<f32>>>,
    token_count: usize,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Vec<f32>>) -> (ScriptedBackend, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (
            ScriptedBackend {
                recorder: Arc::clone(&recorder),
                script: Mutex::new(script.into()),
                token_count: TEST_TOKENS.len(),
            },
            recorder,
        )
    }

    fn blank_logits(&self) -> Vec<f32> {
        let mut logits = vec![0.0; self.token_count];
        logits[BLANK] = 10.0;
        logits
    }
}

/// Builds a logits vector with `id` on top at `top` and blank at `blank`.
pub fn logits_for(id: usize, top: f32, blank: f32) -> Vec<f32> {
    let mut logits = vec![-20.0; TEST_TOKENS.len()];
    logits[BLANK] = blank;
    logits[id] = top;
    logits
}

impl Backend for ScriptedBackend {
    fn state_dims(&self) -> StateDims {
        StateDims {
            num_layers: 1,
            h_dim: 2,
            c_dim: 2,
            joiner_dim: 2,
        }
    }

    fn encode(
        &self,
        inputs: &[&[f32]],
        h_states: &mut [&mut [f32]],
        _c_states: &mut [&mut [f32]],
        enc_outs: &mut [&mut [f32]],
    ) -> Result<(), BackendError> {
        self.recorder
            .encode_batches
            .lock()
            .unwrap()
            .push(inputs.len());
        for (h, out) in h_states.iter_mut().zip(enc_outs.iter_mut()) {
            h[0] += 1.0;
            out[0] = h[0];
        }
        Ok(())
    }

    fn decode(
        &self,
        token_ctx: &[[i32; 2]],
        dec_outs: &mut [&mut [f32]],
    ) -> Result<(), BackendError> {
        self.recorder
            .decode_batches
            .lock()
            .unwrap()
            .push(token_ctx.len());
        for (ctx, out) in token_ctx.iter().zip(dec_outs.iter_mut()) {
            out[0] = ctx[1] as f32;
        }
        Ok(())
    }

    fn join(
        &self,
        enc_outs: &[&[f32]],
        _dec_outs: &[&[f32]],
        logits: &mut [&mut [f32]],
    ) -> Result<(), BackendError> {
        self.recorder
            .join_batches
            .lock()
            .unwrap()
            .push(enc_outs.len());
        let mut script = self.script.lock().unwrap();
        for out in logits.iter_mut() {
            let next = script.pop_front().unwrap_or_else(|| self.blank_logits());
            out.copy_from_slice(&next);
        }
        Ok(())
    }
}

/// A fresh session state wired to a recording handler, bypassing `Session`.
pub fn test_state(model: &Model, events: &Arc<Mutex<Vec<Event>>>) -> crate::session::SessionState {
    use crate::session::emission::ActiveToken;
    use crate::session::{SessionState, MAX_ACTIVE_TOKENS};

    let inner = model.inner();
    SessionState {
        fbank: crate::fbank::OnlineFbank::new(inner.fbank_opts).expect("test fbank"),
        slots: crate::session::tensors::TensorSlots::new(
            inner.backend.state_dims(),
            &inner.params,
        ),
        active: vec![ActiveToken::default(); MAX_ACTIVE_TOKENS],
        active_head: 0,
        last_handler_call_head: 0,
        current_time_ms: 0,
        last_emission_time_ms: 0,
        emitted_silence: true,
        was_flushed: false,
        handler: recording_handler(Arc::clone(events)),
    }
}

pub fn scripted_model(script: Vec<Vec<f32>>) -> (Model, Arc<Recorder>) {
    let (backend, recorder) = ScriptedBackend::new(script);
    let model = Model::with_backend(
        Box::new(backend),
        test_params(),
        test_vocab(),
        ModelMetadata {
            name: "test".into(),
            description: "scripted test model".into(),
            language: "en".into(),
        },
    )
    .expect("test model must build");
    (model, recorder)
}
