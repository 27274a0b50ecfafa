//! Recognition sessions: one per audio stream.
//!
//! A synchronous session runs the filterbank and the collect loop inline in
//! `feed_pcm16`. An asynchronous session pushes samples into its audio ring
//! and wakes the model's processing thread, which drains the ring and batches
//! the compute with every other async session on the model.

pub(crate) mod emission;
pub(crate) mod tensors;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audio_ring::{audio_ring, AudioRingReader, AudioRingWriter};
use crate::error::AprilError;
use crate::fbank::OnlineFbank;
use crate::model::{Model, ModelInner};
use crate::runtime;
use crate::session::emission::ActiveToken;
use crate::session::tensors::TensorSlots;

/// Upper bound on buffered partial tokens per session.
pub const MAX_ACTIVE_TOKENS: usize = 72;

/// Shorts converted and fed to the filterbank per processing chunk.
pub(crate) const FEED_CHUNK: usize = 3200;

bitflags::bitflags! {
    /// Per-token classification bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TokenFlags: u32 {
        /// The token starts a new word (its text begins with a space).
        const WORD_BOUNDARY = 0x01;
        /// The token ends a sentence (`.`, `!` or `?`, except decimals).
        const SENTENCE_END = 0x02;
    }
}

bitflags::bitflags! {
    /// Session mode bits. Empty means synchronous; the two async bits are
    /// mutually exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u32 {
        /// Asynchronous with realtime enforcement (time compression when the
        /// processing thread falls behind).
        const ASYNC_RT = 0x01;
        /// Asynchronous best-effort; overload surfaces as `CantKeepUp`.
        const ASYNC_NO_RT = 0x02;
    }
}

/// A recognized token. The text is borrowed from the model's vocabulary and
/// stays valid for the model's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'a> {
    pub text: &'a str,
    pub logprob: f32,
    pub flags: TokenFlags,
    /// Stream time at which the token was emitted.
    pub time_ms: u64,
}

/// One recognition callback. Token slices are borrowed for the duration of
/// the call.
#[derive(Debug)]
pub enum RecognitionResult<'a> {
    /// Tentative tokens; a future call supersedes them.
    Partial(&'a [Token<'a>]),
    /// Committed tokens, excluded from subsequent partials.
    Final(&'a [Token<'a>]),
    /// The stream has been silent for a while. Not repeated until after the
    /// next emission.
    Silence,
    /// An async session's audio ring overflowed; the offending chunk was
    /// dropped.
    CantKeepUp,
}

pub type ResultHandler = Box<dyn FnMut(RecognitionResult<'_>) + Send>;

pub struct SessionConfig {
    /// Reserved for saving and restoring speaker state; currently unused.
    pub speaker_id: [u8; 16],
    pub flags: SessionFlags,
    pub handler: ResultHandler,
}

impl SessionConfig {
    /// A synchronous session with the given handler.
    pub fn new(handler: ResultHandler) -> SessionConfig {
        SessionConfig {
            speaker_id: [0; 16],
            flags: SessionFlags::empty(),
            handler,
        }
    }

    pub fn with_flags(mut self, flags: SessionFlags) -> SessionConfig {
        self.flags = flags;
        self
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State owned by whichever thread is currently processing the session.
pub(crate) struct SessionState {
    pub fbank: OnlineFbank,
    pub slots: TensorSlots,

    pub active: Vec<ActiveToken>,
    pub active_head: usize,
    pub last_handler_call_head: usize,

    /// Advances with fed audio only: `segment_step * frame_shift_ms` per
    /// pulled segment.
    pub current_time_ms: u64,
    pub last_emission_time_ms: u64,

    pub emitted_silence: bool,
    pub was_flushed: bool,

    pub handler: ResultHandler,
}

/// The registry-visible face of a session, shared with the processing thread.
pub(crate) struct SessionHandle {
    pub slot: usize,
    pub sync: bool,
    pub force_realtime: bool,
    pub flush_requested: AtomicBool,
    /// Measured speed factor (audio seconds per wall-clock second) as f32
    /// bits.
    speedup_bits: AtomicU32,
    pub state: Mutex<SessionState>,
    pub ring: Option<Mutex<AudioRingReader>>,
}

impl SessionHandle {
    pub(crate) fn new(
        slot: usize,
        sync: bool,
        force_realtime: bool,
        state: SessionState,
        ring: Option<AudioRingReader>,
    ) -> SessionHandle {
        SessionHandle {
            slot,
            sync,
            force_realtime,
            flush_requested: AtomicBool::new(false),
            speedup_bits: AtomicU32::new(1.0f32.to_bits()),
            state: Mutex::new(state),
            ring: ring.map(Mutex::new),
        }
    }

    pub fn speedup(&self) -> f32 {
        f32::from_bits(self.speedup_bits.load(Ordering::Relaxed))
    }

    /// Folds a fresh measurement into the EMA; for realtime sessions that
    /// have fallen behind, engages the filterbank's time compression.
    pub fn update_speedup(&self, factor: f32) {
        let ema = self.speedup() * 0.9 + factor * 0.1;
        self.speedup_bits.store(ema.to_bits(), Ordering::Relaxed);

        if self.force_realtime {
            let mut state = lock(&self.state);
            if ema < 0.95 {
                state.fbank.set_speed(1.0 / ema as f64);
            } else {
                state.fbank.set_speed(1.0);
            }
        }
    }
}

pub struct Session {
    model: Model,
    handle: Arc<SessionHandle>,
    writer: Option<AudioRingWriter>,
}

impl Session {
    pub fn new(model: &Model, config: SessionConfig) -> Result<Session, AprilError> {
        let flags = config.flags;
        if flags.contains(SessionFlags::ASYNC_RT) && flags.contains(SessionFlags::ASYNC_NO_RT) {
            return Err(AprilError::Config(
                "ASYNC_RT and ASYNC_NO_RT are mutually exclusive",
            ));
        }
        let sync = flags.is_empty();

        if config.speaker_id != [0; 16] {
            log::debug!("speaker_id is reserved and currently ignored");
        }

        let inner = model.inner();
        let fbank = OnlineFbank::new(inner.fbank_opts)?;
        let slots = TensorSlots::new(inner.backend.state_dims(), &inner.params);

        let state = SessionState {
            fbank,
            slots,
            active: vec![ActiveToken::default(); MAX_ACTIVE_TOKENS],
            active_head: 0,
            last_handler_call_head: 0,
            current_time_ms: 0,
            last_emission_time_ms: 0,
            // No silence event before the first emission.
            emitted_silence: true,
            was_flushed: false,
            handler: config.handler,
        };

        let (writer, reader) = if sync {
            (None, None)
        } else {
            let (writer, reader) = audio_ring();
            (Some(writer), Some(reader))
        };

        let handle = inner.register_session(|slot| {
            SessionHandle::new(
                slot,
                sync,
                flags.contains(SessionFlags::ASYNC_RT),
                state,
                reader,
            )
        })?;

        Ok(Session {
            model: model.clone(),
            handle,
            writer,
        })
    }

    /// Feeds mono signed 16-bit samples at the model's sample rate. An empty
    /// slice is a no-op.
    pub fn feed_pcm16(&mut self, pcm16: &[i16]) -> Result<(), AprilError> {
        if pcm16.is_empty() {
            return Ok(());
        }
        if self.handle.sync {
            self.feed_sync(pcm16)
        } else {
            self.feed_async(pcm16)
        }
    }

    fn feed_sync(&mut self, pcm16: &[i16]) -> Result<(), AprilError> {
        let inner = self.model.inner();
        let mut wave = vec![0.0f32; pcm16.len().min(FEED_CHUNK)];

        for chunk in pcm16.chunks(FEED_CHUNK) {
            {
                let mut state = lock(&self.handle.state);
                state.was_flushed = false;
                for (dst, &s) in wave.iter_mut().zip(chunk) {
                    *dst = s as f32 / 32768.0;
                }
                state.fbank.accept_waveform(&wave[..chunk.len()]);
            }
            runtime::collect_loop(inner, Some(&self.handle))?;
        }

        Ok(())
    }

    fn feed_async(&mut self, pcm16: &[i16]) -> Result<(), AprilError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        let accepted = writer.push(pcm16);
        self.model.inner_arc().raise_audio()?;

        if !accepted {
            let mut state = lock(&self.handle.state);
            (state.handler)(RecognitionResult::CantKeepUp);
        }

        Ok(())
    }

    /// Processes any unprocessed samples and produces final results.
    /// Idempotent until more audio is fed.
    pub fn flush(&mut self) -> Result<(), AprilError> {
        if self.handle.sync {
            flush_session(self.model.inner(), &self.handle)
        } else {
            self.handle.flush_requested.store(true, Ordering::SeqCst);
            self.model.inner_arc().raise_flush()
        }
    }

    /// Measured speed factor of the processing thread for this session:
    /// above 1.0 means faster than realtime.
    pub fn realtime_speedup(&self) -> f32 {
        self.handle.speedup()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.model.inner().unregister_session(self.handle.slot);
    }
}

/// The flush routine shared by the sync path and the processing thread: pad
/// the filterbank out, append two chunks of silence, pad again, then commit
/// whatever is buffered.
pub(crate) fn flush_session(
    inner: &ModelInner,
    handle: &Arc<SessionHandle>,
) -> Result<(), AprilError> {
    {
        let mut state = lock(&handle.state);
        if state.was_flushed {
            return Ok(());
        }
        state.was_flushed = true;
    }

    while lock(&handle.state).fbank.flush() {
        runtime::collect_loop(inner, Some(handle))?;
    }

    let silence = vec![0.0f32; FEED_CHUNK];
    for _ in 0..2 {
        lock(&handle.state).fbank.accept_waveform(&silence);
    }

    while lock(&handle.state).fbank.flush() {
        runtime::collect_loop(inner, Some(handle))?;
    }

    let mut state = lock(&handle.state);
    emission::finalize_tokens(&mut state, inner);
    state.slots.clear_context(inner.params.blank_id as i32);
    if !state.emitted_silence {
        (state.handler)(RecognitionResult::Silence);
        state.emitted_silence = true;
    }

    Ok(())
}
