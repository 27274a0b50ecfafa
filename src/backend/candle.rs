//! Production [`Backend`] evaluating the April RNN-T graphs with candle.
//!
//! The encoder is a conv2d subsampling front-end followed by a stack of
//! LSTM-with-projection layers, each with a feed-forward block and an RMS
//! norm. The prediction network is an embedding plus a depthwise 2-tap
//! convolution; the joiner adds the two projections through a tanh.

use std::collections::HashMap;

use candle_core::{Device, Tensor, D};
use candle_nn::ops::sigmoid;
use candle_nn::{Linear, Module};

use super::{Backend, BackendError, StateDims};
use crate::model::ModelParameters;

struct EmbedWeights {
    conv0_w: Tensor,
    conv0_b: Tensor,
    conv3_w: Tensor,
    conv3_b: Tensor,
    conv6_w: Tensor,
    conv6_b: Tensor,
    out: Linear,
    out_norm_eps: f32,
}

struct LayerWeights {
    gates_ih: Linear,
    gates_hh: Linear,
    proj_hr: Linear,
    feed_forward_0: Linear,
    feed_forward_4: Linear,
    norm_eps: f32,
}

pub struct CandleBackend {
    device: Device,

    embed: EmbedWeights,
    layers: Vec<LayerWeights>,

    decoder_embd: Tensor,
    /// Depthwise kernel taps, `[decoder_dim]` each; tap 0 weighs the older
    /// context token.
    decoder_conv_k0: Tensor,
    decoder_conv_k1: Tensor,
    joiner_decoder_proj: Linear,
    joiner_encoder_proj: Linear,
    joiner_output: Linear,

    dims: StateDims,
    segment_size: usize,
    mel_features: usize,
    token_count: usize,
    decoder_dim: usize,
}

fn take(tensors: &mut HashMap<String, Tensor>, name: &str) -> Result<Tensor, BackendError> {
    tensors
        .remove(name)
        .ok_or_else(|| BackendError::MissingTensor(name.to_string()))
}

fn linear(
    tensors: &mut HashMap<String, Tensor>,
    weight: &str,
    bias: &str,
) -> Result<Linear, BackendError> {
    Ok(Linear::new(take(tensors, weight)?, Some(take(tensors, bias)?)))
}

fn double_swish(x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let sig = sigmoid(&(x - 1.0)?)?;
    x * sig
}

fn rms_norm(x: &Tensor, eps: f32) -> Result<Tensor, candle_core::Error> {
    let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
    let denom = (mean_sq + eps as f64)?.sqrt()?;
    x.broadcast_div(&denom)
}

impl CandleBackend {
    /// Assembles the backend from dequantized container tensors. The eps
    /// values are the already-exponentiated per-norm epsilons.
    pub(crate) fn new(
        mut tensors: HashMap<String, Tensor>,
        embed_out_norm_eps: f32,
        layer_norm_eps: Vec<f32>,
        params: &ModelParameters,
    ) -> Result<CandleBackend, BackendError> {
        let device = Device::Cpu;

        let conv_bias = |t: Tensor| -> Result<Tensor, BackendError> {
            let channels = t.elem_count();
            Ok(t.reshape((channels, 1, 1))?)
        };

        let embed = EmbedWeights {
            conv0_w: take(&mut tensors, "encoder_embed_0_w")?,
            conv0_b: conv_bias(take(&mut tensors, "encoder_embed_0_b")?)?,
            conv3_w: take(&mut tensors, "encoder_embed_3_w")?,
            conv3_b: conv_bias(take(&mut tensors, "encoder_embed_3_b")?)?,
            conv6_w: take(&mut tensors, "encoder_embed_6_w")?,
            conv6_b: conv_bias(take(&mut tensors, "encoder_embed_6_b")?)?,
            out: linear(&mut tensors, "encoder_embed_out_w", "encoder_embed_out_b")?,
            out_norm_eps: embed_out_norm_eps,
        };

        let mut layers = Vec::with_capacity(layer_norm_eps.len());
        let mut state_dims = None;
        for (i, norm_eps) in layer_norm_eps.iter().copied().enumerate() {
            let hr = take(&mut tensors, &format!("encoder.{i}.lstm.weight_hr_l0"))?;
            let (h_dim, c_dim) = hr.dims2()?;
            let dims = state_dims.get_or_insert((h_dim, c_dim));
            if *dims != (h_dim, c_dim) {
                return Err(BackendError::Shape(format!(
                    "layer {i} recurrent dims {h_dim}x{c_dim} disagree with layer 0"
                )));
            }

            layers.push(LayerWeights {
                gates_ih: Linear::new(
                    take(&mut tensors, &format!("encoder.{i}.lstm.weight_ih_l0"))?,
                    Some(take(&mut tensors, &format!("encoder.{i}.lstm.bias_ih_l0"))?),
                ),
                gates_hh: Linear::new(
                    take(&mut tensors, &format!("encoder.{i}.lstm.weight_hh_l0"))?,
                    Some(take(&mut tensors, &format!("encoder.{i}.lstm.bias_hh_l0"))?),
                ),
                proj_hr: Linear::new(hr, None),
                feed_forward_0: linear(
                    &mut tensors,
                    &format!("encoder.{i}.feed_forward.0.weight"),
                    &format!("encoder.{i}.feed_forward.0.bias"),
                )?,
                feed_forward_4: linear(
                    &mut tensors,
                    &format!("encoder.{i}.feed_forward.4.weight"),
                    &format!("encoder.{i}.feed_forward.4.bias"),
                )?,
                norm_eps,
            });
        }

        let (h_dim, c_dim) = state_dims
            .ok_or_else(|| BackendError::Shape("model declares zero encoder layers".into()))?;

        let decoder_embd = take(&mut tensors, "decoder_embd_weight")?;
        let (embd_rows, decoder_dim) = decoder_embd.dims2()?;
        if embd_rows != params.token_count as usize {
            return Err(BackendError::Shape(format!(
                "decoder embedding has {embd_rows} rows for {} tokens",
                params.token_count
            )));
        }

        let decoder_conv = take(&mut tensors, "decoder_conv_weight")?;
        if decoder_conv.elem_count() != decoder_dim * 2 {
            return Err(BackendError::Shape(format!(
                "decoder conv kernel has {} weights, expected {}",
                decoder_conv.elem_count(),
                decoder_dim * 2
            )));
        }
        let decoder_conv = decoder_conv.reshape((decoder_dim, 2))?;
        let decoder_conv_k0 = decoder_conv.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let decoder_conv_k1 = decoder_conv.narrow(1, 1, 1)?.squeeze(1)?.contiguous()?;

        let joiner_encoder_proj = linear(
            &mut tensors,
            "joiner_encoder_proj_weight",
            "joiner_encoder_proj_bias",
        )?;
        let joiner_decoder_proj = linear(
            &mut tensors,
            "joiner_decoder_proj_weight",
            "joiner_decoder_proj_bias",
        )?;
        let joiner_output = linear(&mut tensors, "joiner_output_weight", "joiner_output_bias")?;

        let (out_rows, joiner_dim) = joiner_output.weight().dims2()?;
        if out_rows != params.token_count as usize {
            return Err(BackendError::Shape(format!(
                "joiner output has {out_rows} rows for {} tokens",
                params.token_count
            )));
        }

        Ok(CandleBackend {
            device,
            embed,
            layers,
            decoder_embd,
            decoder_conv_k0,
            decoder_conv_k1,
            joiner_decoder_proj,
            joiner_encoder_proj,
            joiner_output,
            dims: StateDims {
                num_layers: layer_norm_eps.len(),
                h_dim,
                c_dim,
                joiner_dim,
            },
            segment_size: params.segment_size as usize,
            mel_features: params.mel_features as usize,
            token_count: params.token_count as usize,
            decoder_dim,
        })
    }

    /// Gathers one `[batch, width]` tensor for layer `layer` out of the
    /// per-session `num_layers * width` state buffers.
    fn layer_state(
        &self,
        states: &[&mut [f32]],
        layer: usize,
        width: usize,
    ) -> Result<Tensor, BackendError> {
        let mut flat = Vec::with_capacity(states.len() * width);
        for state in states {
            flat.extend_from_slice(&state[layer * width..(layer + 1) * width]);
        }
        Ok(Tensor::from_vec(flat, (states.len(), width), &self.device)?)
    }

    fn scatter_rows(tensor: &Tensor, outs: &mut [&mut [f32]]) -> Result<(), BackendError> {
        let rows = tensor.to_vec2::<f32>()?;
        for (out, row) in outs.iter_mut().zip(rows) {
            if out.len() != row.len() {
                return Err(BackendError::Shape(format!(
                    "output buffer holds {} floats, graph produced {}",
                    out.len(),
                    row.len()
                )));
            }
            out.copy_from_slice(&row);
        }
        Ok(())
    }
}

impl Backend for CandleBackend {
    fn state_dims(&self) -> StateDims {
        self.dims
    }

    fn encode(
        &self,
        inputs: &[&[f32]],
        h_states: &mut [&mut [f32]],
        c_states: &mut [&mut [f32]],
        enc_outs: &mut [&mut [f32]],
    ) -> Result<(), BackendError> {
        let batch = inputs.len();
        if batch == 0 {
            return Ok(());
        }

        let frame_len = self.segment_size * self.mel_features;
        let mut flat = Vec::with_capacity(batch * frame_len);
        for input in inputs {
            if input.len() != frame_len {
                return Err(BackendError::Shape(format!(
                    "encoder input holds {} floats, expected {frame_len}",
                    input.len()
                )));
            }
            flat.extend_from_slice(input);
        }

        let x = Tensor::from_vec(
            flat,
            (batch, 1, self.segment_size, self.mel_features),
            &self.device,
        )?;

        let x = x
            .conv2d(&self.embed.conv0_w, 0, 1, 1, 1)?
            .broadcast_add(&self.embed.conv0_b)?;
        let x = double_swish(&x)?;
        let x = x
            .conv2d(&self.embed.conv3_w, 0, 2, 1, 1)?
            .broadcast_add(&self.embed.conv3_b)?;
        let x = double_swish(&x)?;
        let x = x
            .conv2d(&self.embed.conv6_w, 0, 2, 1, 1)?
            .broadcast_add(&self.embed.conv6_b)?;
        let x = double_swish(&x)?;

        let (_, channels, time, freq) = x.dims4()?;
        if time != 1 {
            return Err(BackendError::Shape(format!(
                "subsampling produced {time} frames from one segment"
            )));
        }
        let x = x
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, channels * freq))?;

        let x = self.embed.out.forward(&x)?;
        let mut x = rms_norm(&x, self.embed.out_norm_eps)?;

        let mut next_h = Vec::with_capacity(self.layers.len());
        let mut next_c = Vec::with_capacity(self.layers.len());

        for (l, layer) in self.layers.iter().enumerate() {
            let h = self.layer_state(h_states, l, self.dims.h_dim)?;
            let c = self.layer_state(c_states, l, self.dims.c_dim)?;

            let gates = (layer.gates_ih.forward(&x)? + layer.gates_hh.forward(&h)?)?;
            let hidden = self.dims.c_dim;
            let i_t = sigmoid(&gates.narrow(1, 0, hidden)?)?;
            let f_t = sigmoid(&gates.narrow(1, hidden, hidden)?)?;
            let g_t = gates.narrow(1, 2 * hidden, hidden)?.tanh()?;
            let o_t = sigmoid(&gates.narrow(1, 3 * hidden, hidden)?)?;

            let cell = ((f_t * c)? + (i_t * g_t)?)?;
            let h_tilde = (o_t * cell.tanh()?)?;
            let hidden_out = layer.proj_hr.forward(&h_tilde)?;

            let x_res = (&x + &hidden_out)?;
            let ff = layer.feed_forward_0.forward(&x_res)?;
            let ff = double_swish(&ff)?;
            let ff = layer.feed_forward_4.forward(&ff)?;
            x = rms_norm(&(x_res + ff)?, layer.norm_eps)?;

            next_h.push(hidden_out);
            next_c.push(cell);
        }

        let enc = self.joiner_encoder_proj.forward(&x)?;
        Self::scatter_rows(&enc, enc_outs)?;

        for (l, (h, c)) in next_h.iter().zip(&next_c).enumerate() {
            let h_rows = h.to_vec2::<f32>()?;
            let c_rows = c.to_vec2::<f32>()?;
            for j in 0..batch {
                let width = self.dims.h_dim;
                h_states[j][l * width..(l + 1) * width].copy_from_slice(&h_rows[j]);
                let width = self.dims.c_dim;
                c_states[j][l * width..(l + 1) * width].copy_from_slice(&c_rows[j]);
            }
        }

        Ok(())
    }

    fn decode(
        &self,
        token_ctx: &[[i32; 2]],
        dec_outs: &mut [&mut [f32]],
    ) -> Result<(), BackendError> {
        let batch = token_ctx.len();
        if batch == 0 {
            return Ok(());
        }

        let ids: Vec<u32> = token_ctx
            .iter()
            .flatten()
            .map(|&t| (t.max(0) as u32).min(self.token_count as u32 - 1))
            .collect();
        let ids = Tensor::from_vec(ids, batch * 2, &self.device)?;

        let emb = self
            .decoder_embd
            .index_select(&ids, 0)?
            .reshape((batch, 2, self.decoder_dim))?;
        let e0 = emb.narrow(1, 0, 1)?.squeeze(1)?;
        let e1 = emb.narrow(1, 1, 1)?.squeeze(1)?;

        let x = (e0.broadcast_mul(&self.decoder_conv_k0)?
            + e1.broadcast_mul(&self.decoder_conv_k1)?)?;
        let x = x.relu()?;
        let dec = self.joiner_decoder_proj.forward(&x)?;

        Self::scatter_rows(&dec, dec_outs)
    }

    fn join(
        &self,
        enc_outs: &[&[f32]],
        dec_outs: &[&[f32]],
        logits: &mut [&mut [f32]],
    ) -> Result<(), BackendError> {
        let batch = enc_outs.len();
        if batch == 0 {
            return Ok(());
        }

        let width = self.dims.joiner_dim;
        let mut enc = Vec::with_capacity(batch * width);
        let mut dec = Vec::with_capacity(batch * width);
        for (e, d) in enc_outs.iter().zip(dec_outs) {
            if e.len() != width || d.len() != width {
                return Err(BackendError::Shape(format!(
                    "joiner inputs hold {}/{} floats, expected {width}",
                    e.len(),
                    d.len()
                )));
            }
            enc.extend_from_slice(e);
            dec.extend_from_slice(d);
        }

        let enc = Tensor::from_vec(enc, (batch, width), &self.device)?;
        let dec = Tensor::from_vec(dec, (batch, width), &self.device)?;

        let x = (enc + dec)?.tanh()?;
        let out = self.joiner_output.forward(&x)?;

        Self::scatter_rows(&out, logits)
    }
}
