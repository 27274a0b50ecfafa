//! GGUF container reader for the `"april"` architecture.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use candle_core::quantized::gguf_file::{Content, Value};
use candle_core::{Device, Tensor};

use crate::backend::CandleBackend;
use crate::error::AprilError;
use crate::model::params::ModelParameters;
use crate::model::vocab::Vocabulary;

pub(crate) struct LoadedModel {
    pub backend: CandleBackend,
    pub params: ModelParameters,
    pub vocab: Vocabulary,
    pub name: String,
    pub description: String,
    pub language: String,
}

fn bad(key: &str, what: &str) -> AprilError {
    AprilError::ModelLoad(format!("metadata key {key}: {what}"))
}

fn meta<'a>(content: &'a Content, key: &str) -> Result<&'a Value, AprilError> {
    content.metadata.get(key).ok_or_else(|| bad(key, "missing"))
}

fn meta_u32(content: &Content, key: &str) -> Result<u32, AprilError> {
    let value = meta(content, key)?;
    let out = match value {
        Value::U8(v) => Some(*v as u32),
        Value::U16(v) => Some(*v as u32),
        Value::U32(v) => Some(*v),
        Value::U64(v) => u32::try_from(*v).ok(),
        Value::I8(v) => u32::try_from(*v).ok(),
        Value::I16(v) => u32::try_from(*v).ok(),
        Value::I32(v) => u32::try_from(*v).ok(),
        Value::I64(v) => u32::try_from(*v).ok(),
        Value::Bool(v) => Some(*v as u32),
        _ => None,
    };
    out.ok_or_else(|| bad(key, "not an unsigned integer"))
}

fn meta_f32(content: &Content, key: &str) -> Result<f32, AprilError> {
    match meta(content, key)? {
        Value::F32(v) => Ok(*v),
        Value::F64(v) => Ok(*v as f32),
        _ => Err(bad(key, "not a float")),
    }
}

fn meta_str<'a>(content: &'a Content, key: &str) -> Result<&'a str, AprilError> {
    match meta(content, key)? {
        Value::String(v) => Ok(v.as_str()),
        _ => Err(bad(key, "not a string")),
    }
}

fn meta_str_or<'a>(content: &'a Content, key: &str, default: &'a str) -> &'a str {
    match content.metadata.get(key) {
        Some(Value::String(v)) => v.as_str(),
        _ => default,
    }
}

pub(crate) fn load_model(path: &Path) -> Result<LoadedModel, AprilError> {
    let mut file = File::open(path)?;
    let content = Content::read(&mut file)
        .map_err(|e| AprilError::ModelLoad(format!("not a readable gguf container: {e}")))?;

    let arch = meta_str(&content, "general.architecture")?;
    if arch != "april" {
        return Err(AprilError::ModelLoad(format!(
            "unsupported architecture {arch:?}, expected \"april\""
        )));
    }

    let name = meta_str(&content, "general.name")?.to_string();
    let description = meta_str(&content, "general.description")?.to_string();
    let language = meta_str_or(&content, "general.language", "").to_string();

    let params = ModelParameters {
        batch_size: meta_u32(&content, "batch_size")?,
        segment_size: meta_u32(&content, "segment_size")?,
        segment_step: meta_u32(&content, "segment_step")?,
        mel_features: meta_u32(&content, "mel_features")?,
        sample_rate: meta_u32(&content, "sample_rate")?,
        frame_shift_ms: meta_u32(&content, "frame_shift_ms")?,
        frame_length_ms: meta_u32(&content, "frame_length_ms")?,
        round_pow2: meta_u32(&content, "round_pow2")? != 0,
        mel_low: meta_u32(&content, "mel_low")?,
        mel_high: meta_u32(&content, "mel_high")?,
        snip_edges: meta_u32(&content, "snip_edges")? != 0,
        token_count: meta_u32(&content, "token_count")?,
        blank_id: meta_u32(&content, "blank_id")?,
    };
    params.validate()?;

    let layer_count = meta_u32(&content, "layer_count")? as usize;
    if layer_count == 0 || layer_count > 32 {
        return Err(AprilError::ModelLoad(format!(
            "layer_count {layer_count} out of range"
        )));
    }

    // The container stores log-epsilons.
    let embed_out_norm_eps = meta_f32(&content, "encoder_embed_out_norm_eps")?.exp();
    let mut layer_norm_eps = Vec::with_capacity(layer_count);
    for i in 0..layer_count {
        layer_norm_eps.push(meta_f32(&content, &format!("encoder.{i}.norm_final.eps"))?.exp());
    }

    let vocab = read_vocabulary(&content, params.token_count)?;

    let device = Device::Cpu;
    let names: Vec<String> = content.tensor_infos.keys().cloned().collect();
    let mut tensors: HashMap<String, Tensor> = HashMap::with_capacity(names.len());
    for tensor_name in names {
        let quantized = content
            .tensor(&mut file, &tensor_name, &device)
            .map_err(|e| AprilError::ModelLoad(format!("tensor {tensor_name}: {e}")))?;
        let tensor = quantized
            .dequantize(&device)
            .map_err(|e| AprilError::ModelLoad(format!("tensor {tensor_name}: {e}")))?;
        tensors.insert(tensor_name, tensor);
    }

    let backend = CandleBackend::new(tensors, embed_out_norm_eps, layer_norm_eps, &params)
        .map_err(|e| AprilError::ModelLoad(format!("weights: {e}")))?;

    log::info!(
        "loaded model {name:?} ({} tokens, {layer_count} layers, {} Hz)",
        params.token_count,
        params.sample_rate
    );

    Ok(LoadedModel {
        backend,
        params,
        vocab,
        name,
        description,
        language,
    })
}

fn read_vocabulary(content: &Content, token_count: u32) -> Result<Vocabulary, AprilError> {
    let key = "tokenizer.ggml.tokens";
    let entries = match meta(content, key)? {
        Value::Array(entries) => entries,
        _ => return Err(bad(key, "not an array")),
    };

    if entries.len() != token_count as usize {
        return Err(AprilError::ModelLoad(format!(
            "token table holds {} entries, token_count says {token_count}",
            entries.len()
        )));
    }

    let mut tokens = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::String(text) => tokens.push(text.as_str()),
            _ => return Err(bad(key, "non-string entry")),
        }
    }

    Ok(Vocabulary::from_tokens(tokens))
}
