//! Greedy emission policy: turns one logits vector into zero or one token
//! plus the partial/final/silence callbacks that go with it.

use crate::model::{ModelInner, Vocabulary};
use crate::session::{RecognitionResult, SessionState, Token, TokenFlags, MAX_ACTIVE_TOKENS};

/// Silence is reported once this much time passes without an emission.
const SILENCE_AFTER_MS: u64 = 2200;

/// Candidate confidence decays by 1 per this many silent milliseconds.
const CONFIDENCE_DECAY_MS: f32 = 3000.0;

/// Margin under blank within which a non-repeated candidate is still shown
/// tentatively.
const TENTATIVE_MARGIN: f32 = 4.0;

/// Margin under blank within which punctuation is emitted anyway.
const PUNCTUATION_MARGIN: f32 = 3.5;

/// Logprob penalty applied to tentative candidates.
const TENTATIVE_PENALTY: f32 = 8.0;

/// A buffered emission; text is resolved against the vocabulary when the
/// token is handed to the callback.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ActiveToken {
    pub id: u32,
    pub logprob: f32,
    pub flags: TokenFlags,
    pub time_ms: u64,
}

fn resolve<'a>(active: &[ActiveToken], count: usize, vocab: &'a Vocabulary) -> Vec<Token<'a>> {
    active[..count]
        .iter()
        .map(|t| Token {
            text: vocab.token(t.id as usize),
            logprob: t.logprob,
            flags: t.flags,
            time_ms: t.time_ms,
        })
        .collect()
}

/// Delivers the whole active prefix as a `FinalRecognition` and clears it.
pub(crate) fn finalize_tokens(state: &mut SessionState, model: &ModelInner) {
    if state.active_head == 0 {
        return;
    }

    let tokens = resolve(&state.active, state.active_head, &model.vocab);
    (state.handler)(RecognitionResult::Final(&tokens));

    state.last_handler_call_head = state.active_head;
    state.active_head = 0;
}

/// Finalizes everything before the current word. When the incoming token is a
/// word boundary the current word is complete and the whole buffer goes out;
/// otherwise the word in progress rolls over to the start of the buffer.
fn finalize_previous_words(state: &mut SessionState, model: &ModelInner, incoming_is_boundary: bool) {
    if incoming_is_boundary || state.active_head == 0 {
        finalize_tokens(state, model);
        return;
    }

    let mut word_start = None;
    let mut i = state.active_head;
    while i > 2 {
        i -= 1;
        if state.active[i].flags.contains(TokenFlags::WORD_BOUNDARY) {
            word_start = Some(i);
            break;
        }
    }

    match word_start {
        Some(start) => {
            let tokens = resolve(&state.active, start, &model.vocab);
            (state.handler)(RecognitionResult::Final(&tokens));

            state.active.copy_within(start..state.active_head, 0);
            state.active_head -= start;
            state.last_handler_call_head = 0;
        }
        None => finalize_tokens(state, model),
    }
}

/// Appends `token` (if any) and delivers the active prefix as a
/// `PartialRecognition`. Without `force`, the call is suppressed when the
/// prefix is identical to the one passed to the previous callback.
fn emit_partial(
    state: &mut SessionState,
    model: &ModelInner,
    token: Option<ActiveToken>,
    force: bool,
) -> bool {
    match token {
        Some(token) => {
            // The slot just past the head still holds the previous tentative
            // candidate, which is exactly what a repeat would re-append.
            if !force
                && state.last_handler_call_head == state.active_head + 1
                && state.active[state.active_head].id == token.id
            {
                return false;
            }
            state.active[state.active_head] = token;
            state.active_head += 1;
        }
        None => {
            if !force && state.last_handler_call_head == state.active_head {
                return false;
            }
        }
    }

    let tokens = resolve(&state.active, state.active_head, &model.vocab);
    (state.handler)(RecognitionResult::Partial(&tokens));

    state.last_handler_call_head = state.active_head;
    true
}

fn previous_token_is_number(state: &SessionState, model: &ModelInner) -> bool {
    let text = if state.active_head > 0 {
        model
            .vocab
            .token(state.active[state.active_head - 1].id as usize)
    } else {
        let prev = state.slots.token_ctx[1];
        if prev < 0 || prev as u32 == model.params.blank_id {
            return false;
        }
        model.vocab.token(prev as usize)
    };

    // A word-boundary digit token like " 3" still reads as a number.
    text.chars()
        .find(|c| *c != ' ')
        .is_some_and(|c| c.is_ascii_digit())
}

/// Processes the session's current logits. Returns whether the frame was
/// blank (ending the join iteration for this segment).
pub(crate) fn process_logits(state: &mut SessionState, model: &ModelInner, early_emit: f32) -> bool {
    let blank = model.params.blank_id as usize;

    let mut max_idx = usize::MAX;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in state.slots.logits.iter().enumerate() {
        if i == blank {
            continue;
        }
        if v > max_val {
            max_idx = i;
            max_val = v;
        }
    }
    debug_assert!(max_idx != usize::MAX, "logits must cover more than blank");

    // Repeats get no early-emission bias; this breaks stutter loops where the
    // same token would keep winning against blank.
    let prev_id = state.slots.token_ctx[1];
    let is_equal_to_previous = prev_id == max_idx as i32;
    let early_emit = if is_equal_to_previous { 0.0 } else { early_emit };

    let blank_val = state.slots.logits[blank];
    let mut is_blank = (blank_val - early_emit) > max_val;

    let text = model.vocab.token(max_idx);
    let mut flags = TokenFlags::empty();
    if text.starts_with(' ') {
        flags |= TokenFlags::WORD_BOUNDARY;
    }

    let is_punctuation = matches!(text, "." | "!" | "?");
    if is_punctuation && !previous_token_is_number(state, model) {
        flags |= TokenFlags::SENTENCE_END;
    }

    // Punctuation tends to lose narrowly against blank; loosen the decision
    // when it is close and there is something to punctuate.
    if is_punctuation
        && !is_equal_to_previous
        && max_val > blank_val - PUNCTUATION_MARGIN
        && prev_id != blank as i32
    {
        is_blank = false;
    }

    let token = ActiveToken {
        id: max_idx as u32,
        logprob: max_val,
        flags,
        time_ms: state.current_time_ms,
    };

    if !is_blank {
        state.last_emission_time_ms = state.current_time_ms;
        state.slots.push_context(max_idx as i32);

        if state.active_head >= MAX_ACTIVE_TOKENS - 1 {
            finalize_previous_words(state, model, flags.contains(TokenFlags::WORD_BOUNDARY));
            if state.active_head >= MAX_ACTIVE_TOKENS - 1 {
                state.active_head = 0;
            }
        }

        let prev_ended_sentence = state.active_head > 0
            && state.active[state.active_head - 1]
                .flags
                .contains(TokenFlags::SENTENCE_END);
        if prev_ended_sentence && flags.contains(TokenFlags::WORD_BOUNDARY) {
            finalize_previous_words(state, model, true);
        }

        emit_partial(state, model, Some(token), true);
        state.emitted_silence = false;
    } else {
        let time_since = state
            .current_time_ms
            .saturating_sub(state.last_emission_time_ms);

        // Stale hypotheses decay so old near-misses stop resurfacing.
        let max_val = max_val - time_since as f32 / CONFIDENCE_DECAY_MS;

        if time_since >= SILENCE_AFTER_MS {
            finalize_tokens(state, model);
            state.slots.clear_context(blank as i32);
            if !state.emitted_silence {
                (state.handler)(RecognitionResult::Silence);
                state.emitted_silence = true;
            }
        } else if !is_equal_to_previous && max_val > blank_val - TENTATIVE_MARGIN {
            // Reasonably confident: show the candidate, but restore the head
            // so it does not persist.
            let mut tentative = token;
            tentative.logprob -= TENTATIVE_PENALTY;
            if emit_partial(state, model, Some(tentative), false) {
                state.active_head -= 1;
            }
        } else {
            emit_partial(state, model, None, false);
        }
    }

    is_blank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::test_support::{logits_for, scripted_model, test_state, Event, BLANK};
    use std::sync::{Arc, Mutex};

    fn setup() -> (Model, SessionState, Arc<Mutex<Vec<Event>>>) {
        let (model, _) = scripted_model(Vec::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let state = test_state(&model, &events);
        (model, state, events)
    }

    #[test]
    fn non_blank_emits_partial_and_updates_context() {
        let (model, mut state, events) = setup();

        state.slots.logits = logits_for(1, 5.0, 0.0);
        let is_blank = process_logits(&mut state, model.inner(), 0.0);

        assert!(!is_blank);
        assert_eq!(state.slots.token_ctx, [BLANK as i32, 1]);
        assert!(state.slots.requires_decoding);
        assert!(!state.emitted_silence);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&Event::Partial(vec![" hi".into()]))
        );
    }

    #[test]
    fn early_emit_is_ignored_for_repeats() {
        let (model, mut state, events) = setup();
        state.slots.token_ctx = [BLANK as i32, 1];

        // With a 2.0 bias a fresh candidate 1.5 under blank would emit; the
        // repeated one must not.
        state.slots.logits = logits_for(1, -1.5, 0.0);
        let is_blank = process_logits(&mut state, model.inner(), 2.0);

        assert!(is_blank);
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(state.slots.token_ctx, [BLANK as i32, 1]);
    }

    #[test]
    fn long_silence_finalizes_and_reports_once() {
        let (model, mut state, events) = setup();

        state.slots.logits = logits_for(1, 5.0, 0.0);
        process_logits(&mut state, model.inner(), 0.0);

        state.current_time_ms = 2400;
        state.slots.logits = logits_for(2, -15.0, 10.0);
        assert!(process_logits(&mut state, model.inner(), 0.0));
        assert!(process_logits(&mut state, model.inner(), 0.0));

        let events = events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[
                Event::Partial(vec![" hi".into()]),
                Event::Final(vec![" hi".into()]),
                Event::Silence,
            ]
        );
        assert_eq!(state.slots.token_ctx, [BLANK as i32, BLANK as i32]);
    }

    #[test]
    fn decimal_point_is_not_a_sentence_end() {
        let (model, mut state, events) = setup();

        for id in [4, 3, 1] {
            state.slots.logits = logits_for(id, 5.0, 0.0);
            process_logits(&mut state, model.inner(), 0.0);
        }

        // The "." followed " 3" and must not carry the sentence-end flag,
        // and " hi" must not have finalized anything.
        assert!(!state.active[1].flags.contains(TokenFlags::SENTENCE_END));
        assert_eq!(state.active_head, 3);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|e| !matches!(e, Event::Final(_))));
    }

    #[test]
    fn sentence_end_finalizes_before_the_next_word() {
        let (model, mut state, events) = setup();

        for id in [1, 3, 2] {
            state.slots.logits = logits_for(id, 5.0, 0.0);
            process_logits(&mut state, model.inner(), 0.0);
        }

        let events = events.lock().unwrap();
        assert!(events.contains(&Event::Final(vec![" hi".into(), ".".into()])));
        assert_eq!(
            events.last(),
            Some(&Event::Partial(vec![" there".into()]))
        );
        assert_eq!(state.active_head, 1);
    }

    #[test]
    fn near_miss_punctuation_is_loosened_to_non_blank() {
        let (model, mut state, _events) = setup();

        state.slots.logits = logits_for(1, 5.0, 0.0);
        process_logits(&mut state, model.inner(), 0.0);

        // 2.0 under blank: inside the punctuation margin of 3.5.
        state.slots.logits = logits_for(3, 8.0, 10.0);
        let is_blank = process_logits(&mut state, model.inner(), 0.0);

        assert!(!is_blank);
        assert_eq!(state.slots.token_ctx[1], 3);
    }

    #[test]
    fn punctuation_is_not_loosened_against_a_blank_context() {
        let (model, mut state, _events) = setup();

        state.slots.logits = logits_for(3, 8.0, 10.0);
        let is_blank = process_logits(&mut state, model.inner(), 0.0);

        assert!(is_blank);
        assert_eq!(state.slots.token_ctx[1], BLANK as i32);
    }

    #[test]
    fn tentative_candidates_do_not_persist() {
        let (model, mut state, events) = setup();

        state.slots.logits = logits_for(1, 5.0, 0.0);
        process_logits(&mut state, model.inner(), 0.0);
        assert_eq!(state.active_head, 1);

        // 2.0 under blank: too weak to emit, confident enough to show.
        state.slots.logits = logits_for(2, -2.0, 0.0);
        assert!(process_logits(&mut state, model.inner(), 0.0));

        assert_eq!(state.active_head, 1);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&Event::Partial(vec![" hi".into(), " there".into()]))
        );

        // The identical tentative candidate is suppressed next time.
        let count = events.lock().unwrap().len();
        assert!(process_logits(&mut state, model.inner(), 0.0));
        assert_eq!(events.lock().unwrap().len(), count);
    }

    #[test]
    fn full_buffer_finalizes_previous_words() {
        let (model, mut state, events) = setup();

        for i in 0..MAX_ACTIVE_TOKENS - 1 {
            state.active[i] = ActiveToken {
                id: 6,
                logprob: 0.0,
                flags: TokenFlags::empty(),
                time_ms: 0,
            };
        }
        state.active[40] = ActiveToken {
            id: 1,
            logprob: 0.0,
            flags: TokenFlags::WORD_BOUNDARY,
            time_ms: 0,
        };
        state.active_head = MAX_ACTIVE_TOKENS - 1;
        state.slots.token_ctx = [BLANK as i32, 6];

        state.slots.logits = logits_for(6, 5.0, 0.0);
        process_logits(&mut state, model.inner(), 0.0);

        // Everything before the word at index 40 went out as a final; the
        // current word rolled over and the new token was appended.
        assert_eq!(state.active_head, MAX_ACTIVE_TOKENS - 1 - 40 + 1);
        let events = events.lock().unwrap();
        match &events[0] {
            Event::Final(tokens) => assert_eq!(tokens.len(), 40),
            other => panic!("expected a final first, got {other:?}"),
        }
    }
}
