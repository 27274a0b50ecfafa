//! Example client: transcribes a PCM/WAV file, stdin, or synthetic input.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use april_asr::{AprilError, Model, RecognitionResult, Session, SessionConfig};

const FEED_CHUNK_SHORTS: usize = 3200;

const EXIT_USAGE: u8 = 1;
const EXIT_IO: u8 = 2;
const EXIT_MALFORMED: u8 = 4;

#[derive(Parser)]
#[command(
    name = "april-cli",
    about = "Streaming speech recognition over a PCM16 stream"
)]
struct Args {
    /// Input: a raw PCM16 file, a .wav file, `-` for stdin, or `?` for
    /// synthetic zero input.
    input: String,

    /// Path to a GGUF model file.
    model: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn print_result(result: RecognitionResult<'_>) {
    match result {
        RecognitionResult::Partial(tokens) => {
            print!("- ");
            for token in tokens {
                print!("{}", token.text);
            }
            println!();
        }
        RecognitionResult::Final(tokens) => {
            print!("@ ");
            for token in tokens {
                print!("{}", token.text);
            }
            println!();
        }
        RecognitionResult::Silence => println!("* silence"),
        RecognitionResult::CantKeepUp => println!("* can't keep up"),
    }
}

fn run(args: Args) -> Result<(), u8> {
    april_asr::init(april_asr::API_VERSION);

    let model = Model::load(&args.model).map_err(|err| {
        eprintln!("failed to load model: {err}");
        EXIT_USAGE
    })?;

    println!("Model name: {}", model.name());
    println!("Model desc: {}", model.description());
    println!("Model lang: {}", model.language());
    println!("Model samplerate: {}", model.sample_rate());

    let mut session = Session::new(&model, SessionConfig::new(Box::new(print_result)))
        .map_err(|err| {
            eprintln!("failed to create session: {err}");
            EXIT_USAGE
        })?;

    match args.input.as_str() {
        "-" => feed_stdin(&mut session)?,
        "?" => feed(&mut session, &vec![0i16; FEED_CHUNK_SHORTS])?,
        path if path.ends_with(".wav") => {
            let pcm16 = decode_wav(Path::new(path), model.sample_rate())?;
            feed(&mut session, &pcm16)?;
        }
        path => {
            let pcm16 = read_raw_pcm16(Path::new(path))?;
            feed(&mut session, &pcm16)?;
        }
    }

    session.flush().map_err(session_error)?;
    Ok(())
}

fn session_error(err: AprilError) -> u8 {
    eprintln!("session error: {err}");
    match err {
        AprilError::Io(_) => EXIT_IO,
        _ => EXIT_USAGE,
    }
}

fn feed(session: &mut Session, pcm16: &[i16]) -> Result<(), u8> {
    for chunk in pcm16.chunks(FEED_CHUNK_SHORTS) {
        session.feed_pcm16(chunk).map_err(session_error)?;
    }
    Ok(())
}

fn feed_stdin(session: &mut Session) -> Result<(), u8> {
    let mut stdin = std::io::stdin().lock();
    let mut bytes = vec![0u8; FEED_CHUNK_SHORTS * 2];
    let mut pcm16 = vec![0i16; FEED_CHUNK_SHORTS];

    loop {
        let count = stdin.read(&mut bytes).map_err(|err| {
            eprintln!("stdin: {err}");
            EXIT_IO
        })?;
        if count == 0 {
            return Ok(());
        }

        let shorts = count / 2;
        for (sample, pair) in pcm16.iter_mut().zip(bytes[..shorts * 2].chunks_exact(2)) {
            *sample = i16::from_le_bytes([pair[0], pair[1]]);
        }
        session.feed_pcm16(&pcm16[..shorts]).map_err(session_error)?;
    }
}

fn read_raw_pcm16(path: &Path) -> Result<Vec<i16>, u8> {
    let bytes = std::fs::read(path).map_err(|err| {
        eprintln!("{}: {err}", path.display());
        EXIT_IO
    })?;

    if bytes.len() % 2 != 0 {
        eprintln!(
            "{}: size not divisible by two, is the file raw pcm16?",
            path.display()
        );
        return Err(EXIT_MALFORMED);
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn append_converted<T>(samples: &mut Vec<i16>, buffer: &symphonia::core::audio::AudioBuffer<T>)
where
    T: symphonia::core::sample::Sample,
    f32: FromSample<T>,
{
    samples.extend(
        buffer
            .chan(0)
            .iter()
            .map(|&v| (f32::from_sample(v).clamp(-1.0, 1.0) * 32767.0) as i16),
    );
}

/// Decodes the first audio track of a WAV file to mono PCM16, rejecting
/// files whose sample rate disagrees with the model (no resampling is done).
fn decode_wav(path: &Path, expected_rate: u32) -> Result<Vec<i16>, u8> {
    let file = std::fs::File::open(path).map_err(|err| {
        eprintln!("{}: {err}", path.display());
        EXIT_IO
    })?;

    let malformed = |what: &str| {
        eprintln!("{}: {what}", path.display());
        EXIT_MALFORMED
    };

    let source = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|_| malformed("unrecognized wav container"))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| malformed("no decodable audio track"))?;
    let track_id = track.id;

    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    if sample_rate != expected_rate {
        return Err(malformed(&format!(
            "sample rate {sample_rate} Hz, model expects {expected_rate} Hz"
        )));
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|_| malformed("unsupported codec"))?;

    let mut samples = Vec::new();
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(AudioBufferRef::F32(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::F64(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::S16(buf)) => samples.extend(buf.chan(0).iter().copied()),
            Ok(AudioBufferRef::S32(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::S24(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::U8(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::U16(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::U24(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::U32(buf)) => append_converted(&mut samples, &buf),
            Ok(AudioBufferRef::S8(buf)) => append_converted(&mut samples, &buf),
            Err(_) => return Err(malformed("failed to decode audio packet")),
        }
    }

    Ok(samples)
}
