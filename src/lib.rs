//! Streaming speech recognition runtime.
//!
//! Feed mono 16-bit PCM into a [`Session`] and receive tokenized partial and
//! final hypotheses through a callback, with sub-second latency. Sessions
//! sharing a [`Model`] are fused into batched encoder/decoder/joiner calls by
//! a single processing thread.
//!
//! ```no_run
//! use april_asr::{Model, RecognitionResult, Session, SessionConfig};
//!
//! april_asr::init(april_asr::API_VERSION);
//! let model = Model::load("model.gguf")?;
//! let mut session = Session::new(
//!     &model,
//!     SessionConfig::new(Box::new(|result| {
//!         if let RecognitionResult::Final(tokens) = result {
//!             for token in tokens {
//!                 print!("{}", token.text);
//!             }
//!             println!();
//!         }
//!     })),
//! )?;
//!
//! session.feed_pcm16(&[0i16; 3200])?;
//! session.flush()?;
//! # Ok::<(), april_asr::AprilError>(())
//! ```

pub mod audio_ring;
pub mod backend;
pub mod error;
pub mod fbank;
pub mod model;
pub mod proc_thread;
mod runtime;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::AprilError;
pub use model::{Model, ModelMetadata, ModelParameters, Vocabulary, MAX_SESSIONS};
pub use session::{
    RecognitionResult, ResultHandler, Session, SessionConfig, SessionFlags, Token, TokenFlags,
    MAX_ACTIVE_TOKENS,
};

/// The API generation this build implements.
pub const API_VERSION: u32 = 1;

/// Process-wide one-time initialisation. Must be called with
/// [`API_VERSION`]; a mismatch means the caller was built against an
/// incompatible header and is a programmer error.
pub fn init(version: u32) {
    assert_eq!(
        version, API_VERSION,
        "april API version mismatch (runtime {API_VERSION}, caller {version})"
    );

    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        log::debug!("april runtime initialised (api v{API_VERSION})");
    });
}
