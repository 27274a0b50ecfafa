//! Cross-session batching scheduler.
//!
//! Every participating session with a ready segment is encoded in one
//! backend call; sessions whose context changed are decoded together, and
//! sessions holding a fresh encoder or decoder output are joined together.
//! Within a session the order is always encode, then decode/join rounds,
//! then the next encode, so token emissions for a segment complete before
//! the following segment is touched.

use std::sync::Arc;

use crate::error::AprilError;
use crate::model::ModelInner;
use crate::session::emission::process_logits;
use crate::session::{lock, SessionHandle, SessionState};
use crate::session::tensors::TensorSlots;

/// Decode/join rounds allowed per encoded segment; bounds per-segment work
/// when a session keeps emitting.
const MAX_JOINS_PER_ENCODE: usize = 4;

/// Early-emission bias fed to successive join rounds of one segment.
const EARLY_EMIT_SCHEDULE: [f32; MAX_JOINS_PER_ENCODE] = [2.0, 1.0, 0.0, 0.0];

fn participants(
    model: &ModelInner,
    force_session: Option<&Arc<SessionHandle>>,
) -> Vec<Arc<SessionHandle>> {
    let registry = lock(&model.sessions);
    registry
        .slots
        .iter()
        .flatten()
        .filter(|handle| match force_session {
            Some(forced) => Arc::ptr_eq(handle, forced),
            None => !handle.sync,
        })
        .cloned()
        .collect()
}

/// Runs batched rounds until no session has work left. Returns the number of
/// encode batches issued.
pub(crate) fn collect_loop(
    model: &ModelInner,
    force_session: Option<&Arc<SessionHandle>>,
) -> Result<usize, AprilError> {
    let mut encode_batches = 0;

    loop {
        let mut progressed = false;
        if collect_and_encode(model, force_session)? > 0 {
            encode_batches += 1;
            progressed = true;
        }

        for early_emit in EARLY_EMIT_SCHEDULE {
            collect_and_decode(model, force_session)?;
            if collect_and_join(model, force_session, early_emit)? == 0 {
                break;
            }
        }

        if !progressed {
            break;
        }
    }

    Ok(encode_batches)
}

fn collect_and_encode(
    model: &ModelInner,
    force_session: Option<&Arc<SessionHandle>>,
) -> Result<usize, AprilError> {
    let candidates = participants(model, force_session);

    let mut guards = Vec::new();
    for handle in &candidates {
        let mut state = lock(&handle.state);
        let SessionState {
            fbank,
            slots,
            current_time_ms,
            ..
        } = &mut *state;
        if fbank.pull_segments(&mut slots.enc_inp) {
            *current_time_ms += fbank.segments_stride_ms();
            guards.push(state);
        }
    }

    let batch = guards.len();
    if batch == 0 {
        return Ok(0);
    }

    let mut inputs = Vec::with_capacity(batch);
    let mut h_states = Vec::with_capacity(batch);
    let mut c_states = Vec::with_capacity(batch);
    let mut enc_outs = Vec::with_capacity(batch);
    for state in guards.iter_mut() {
        let TensorSlots {
            enc_inp,
            h_state,
            c_state,
            enc_out,
            ..
        } = &mut state.slots;
        inputs.push(enc_inp.as_slice());
        h_states.push(h_state.as_mut_slice());
        c_states.push(c_state.as_mut_slice());
        enc_outs.push(enc_out.as_mut_slice());
    }

    model
        .backend
        .encode(&inputs, &mut h_states, &mut c_states, &mut enc_outs)?;

    for state in guards.iter_mut() {
        state.slots.enc_out_refreshed = true;
        state.slots.encoded_once = true;
    }

    Ok(batch)
}

fn collect_and_decode(
    model: &ModelInner,
    force_session: Option<&Arc<SessionHandle>>,
) -> Result<usize, AprilError> {
    let candidates = participants(model, force_session);

    let mut guards = Vec::new();
    for handle in &candidates {
        let mut state = lock(&handle.state);
        if state.slots.requires_decoding {
            state.slots.requires_decoding = false;
            guards.push(state);
        }
    }

    let batch = guards.len();
    if batch == 0 {
        return Ok(0);
    }

    let token_ctx: Vec<[i32; 2]> = guards.iter().map(|state| state.slots.token_ctx).collect();
    let mut dec_outs: Vec<&mut [f32]> = guards
        .iter_mut()
        .map(|state| state.slots.dec_out.as_mut_slice())
        .collect();

    model.backend.decode(&token_ctx, &mut dec_outs)?;

    for state in guards.iter_mut() {
        state.slots.dec_out_refreshed = true;
    }

    Ok(batch)
}

fn collect_and_join(
    model: &ModelInner,
    force_session: Option<&Arc<SessionHandle>>,
    early_emit: f32,
) -> Result<usize, AprilError> {
    let candidates = participants(model, force_session);

    let mut guards = Vec::new();
    for handle in &candidates {
        let state = lock(&handle.state);
        if state.slots.encoded_once
            && (state.slots.enc_out_refreshed || state.slots.dec_out_refreshed)
        {
            guards.push(state);
        }
    }

    let batch = guards.len();
    if batch == 0 {
        return Ok(0);
    }

    let mut enc_outs = Vec::with_capacity(batch);
    let mut dec_outs = Vec::with_capacity(batch);
    let mut logits = Vec::with_capacity(batch);
    for state in guards.iter_mut() {
        let TensorSlots {
            enc_out,
            dec_out,
            logits: logit_buf,
            ..
        } = &mut state.slots;
        enc_outs.push(enc_out.as_slice());
        dec_outs.push(dec_out.as_slice());
        logits.push(logit_buf.as_mut_slice());
    }

    model.backend.join(&enc_outs, &dec_outs, &mut logits)?;

    for state in guards.iter_mut() {
        state.slots.enc_out_refreshed = false;
        state.slots.dec_out_refreshed = false;
        process_logits(state, model, early_emit);
    }

    Ok(batch)
}
