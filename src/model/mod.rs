//! Model handles: weights, parameters, vocabulary, and the shared state that
//! ties sessions together (registry plus processing thread).

mod gguf;
mod params;
mod vocab;

pub use params::ModelParameters;
pub use vocab::Vocabulary;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::backend::Backend;
use crate::error::AprilError;
use crate::fbank::FbankOptions;
use crate::proc_thread::{ProcThread, WakeFlags};
use crate::runtime;
use crate::session::{flush_session, lock, SessionHandle, FEED_CHUNK};

/// Capacity of the per-model session registry.
pub const MAX_SESSIONS: usize = 64;

/// Display metadata carried alongside the weights.
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub name: String,
    pub description: String,
    pub language: String,
}

pub(crate) struct SessionRegistry {
    pub slots: Vec<Option<Arc<SessionHandle>>>,
}

pub(crate) struct ModelInner {
    pub backend: Box<dyn Backend>,
    pub params: ModelParameters,
    pub vocab: Vocabulary,
    pub fbank_opts: FbankOptions,
    metadata: ModelMetadata,

    pub sessions: Mutex<SessionRegistry>,
    proc_thread: Mutex<Option<ProcThread>>,
}

/// Shared handle to a loaded model. Cloning is cheap; the underlying weights
/// are freed once the last handle and the last session are gone.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Model {
    /// Loads a GGUF model file with architecture `"april"`. Failures are
    /// logged at warning level and returned.
    pub fn load(path: impl AsRef<Path>) -> Result<Model, AprilError> {
        let path = path.as_ref();
        gguf::load_model(path)
            .map_err(|e| {
                log::warn!("failed to load {}: {e}", path.display());
                e
            })
            .and_then(|loaded| {
                Model::with_backend(
                    Box::new(loaded.backend),
                    loaded.params,
                    loaded.vocab,
                    ModelMetadata {
                        name: loaded.name,
                        description: loaded.description,
                        language: loaded.language,
                    },
                )
            })
    }

    /// Builds a model around any [`Backend`] implementation. This is the
    /// seam for alternative tensor runtimes.
    pub fn with_backend(
        backend: Box<dyn Backend>,
        params: ModelParameters,
        vocab: Vocabulary,
        metadata: ModelMetadata,
    ) -> Result<Model, AprilError> {
        params.validate()?;
        if vocab.len() != params.token_count as usize {
            return Err(AprilError::ModelLoad(format!(
                "vocabulary holds {} tokens, parameters declare {}",
                vocab.len(),
                params.token_count
            )));
        }

        let fbank_opts = params.fbank_options();

        Ok(Model {
            inner: Arc::new(ModelInner {
                backend,
                params,
                vocab,
                fbank_opts,
                metadata,
                sessions: Mutex::new(SessionRegistry {
                    slots: (0..MAX_SESSIONS).map(|_| None).collect(),
                }),
                proc_thread: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.metadata.name
    }

    pub fn description(&self) -> &str {
        &self.inner.metadata.description
    }

    pub fn language(&self) -> &str {
        &self.inner.metadata.language
    }

    /// Sample rate the model expects, in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.inner.params.sample_rate
    }

    pub(crate) fn inner(&self) -> &ModelInner {
        &self.inner
    }

    pub(crate) fn inner_arc(&self) -> &Arc<ModelInner> {
        &self.inner
    }
}

impl ModelInner {
    /// Inserts a new session into the first free registry slot.
    pub(crate) fn register_session(
        &self,
        build: impl FnOnce(usize) -> SessionHandle,
    ) -> Result<Arc<SessionHandle>, AprilError> {
        let mut registry = lock(&self.sessions);
        let slot = registry
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(AprilError::SessionLimit(MAX_SESSIONS))?;

        let handle = Arc::new(build(slot));
        registry.slots[slot] = Some(Arc::clone(&handle));
        Ok(handle)
    }

    pub(crate) fn unregister_session(&self, slot: usize) {
        let mut registry = lock(&self.sessions);
        if let Some(entry) = registry.slots.get_mut(slot) {
            *entry = None;
        }
    }

    /// Registry snapshot of the asynchronous sessions.
    fn async_sessions(&self) -> Vec<Arc<SessionHandle>> {
        lock(&self.sessions)
            .slots
            .iter()
            .flatten()
            .filter(|handle| !handle.sync)
            .cloned()
            .collect()
    }

    fn ensure_proc_thread(self: &Arc<Self>) -> Result<(), AprilError> {
        let mut thread = lock(&self.proc_thread);
        if thread.is_none() {
            let weak = Arc::downgrade(self);
            *thread = Some(ProcThread::spawn(move |flags| {
                if let Some(inner) = weak.upgrade() {
                    inner.proc_callback(flags);
                }
            })?);
        }
        Ok(())
    }

    pub(crate) fn raise_audio(self: &Arc<Self>) -> Result<(), AprilError> {
        self.raise(WakeFlags::AUDIO)
    }

    pub(crate) fn raise_flush(self: &Arc<Self>) -> Result<(), AprilError> {
        self.raise(WakeFlags::FLUSH)
    }

    fn raise(self: &Arc<Self>, flag: WakeFlags) -> Result<(), AprilError> {
        self.ensure_proc_thread()?;
        if let Some(thread) = lock(&self.proc_thread).as_ref() {
            thread.raise(flag);
        }
        Ok(())
    }

    /// Body of the processing thread: drain every async ring, serve flush
    /// requests, then run the batched collect loop.
    fn proc_callback(&self, flags: WakeFlags) {
        let start = Instant::now();
        let handles = self.async_sessions();

        let mut audio_ms = 0u64;
        for handle in &handles {
            audio_ms += self.drain_ring(handle);
        }

        if flags.contains(WakeFlags::FLUSH) {
            for handle in &handles {
                if handle
                    .flush_requested
                    .swap(false, std::sync::atomic::Ordering::SeqCst)
                {
                    if let Err(e) = flush_session(self, handle) {
                        log::error!("flush failed: {e}");
                    }
                }
            }
        }

        if let Err(e) = runtime::collect_loop(self, None) {
            log::error!("batched processing failed: {e}");
            return;
        }

        if audio_ms > 0 {
            let elapsed_ms = (start.elapsed().as_secs_f32() * 1000.0).max(0.01);
            let factor = audio_ms as f32 / elapsed_ms;
            for handle in &handles {
                handle.update_speedup(factor);
            }
        }
    }

    /// Moves everything pending in one session's ring into its filterbank.
    /// Returns the milliseconds of audio consumed.
    fn drain_ring(&self, handle: &Arc<SessionHandle>) -> u64 {
        let Some(ring) = &handle.ring else {
            return 0;
        };

        let mut reader = lock(ring);
        let mut wave = vec![0.0f32; FEED_CHUNK];
        let mut samples = 0u64;

        loop {
            let chunk = reader.pull(FEED_CHUNK);
            let pcm = chunk.samples();
            let count = pcm.len();
            if count == 0 {
                break;
            }

            {
                let mut state = lock(&handle.state);
                state.was_flushed = false;
                for (dst, &s) in wave.iter_mut().zip(pcm) {
                    *dst = s as f32 / 32768.0;
                }
                state.fbank.accept_waveform(&wave[..count]);
            }

            chunk.finish(count);
            samples += count as u64;
        }

        samples * 1000 / self.params.sample_rate as u64
    }
}
