use anyhow::Result;
use candle_core::{D, Tensor};
use candle_nn::{Activation, LayerNorm, LayerNormConfig, Linear, Module, VarBuilder, layer_norm, linear_b};

use crate::utils::tensor_utils::repeat_kv;

#[derive(Debug, Clone)]
pub struct GateUpDownMLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act_fn: Activation,
}

impl GateUpDownMLP {
    pub fn new(
        vb: VarBuilder,
        hidden_size: usize,
        intermediate_size: usize,
        act_fn: Activation,
        bias: bool,
    ) -> Result<Self> {
        let gate_proj = linear_b(hidden_size, intermediate_size, bias, vb.pp("gate_proj"))?;
        let up_proj = linear_b(hidden_size, intermediate_size, bias, vb.pp("up_proj"))?;
        let down_proj = linear_b(intermediate_size, hidden_size, bias, vb.pp("down_proj"))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            act_fn,
        })
    }
}

impl Module for GateUpDownMLP {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let lhs = xs.apply(&self.gate_proj)?.apply(&self.act_fn)?;
        let rhs = xs.apply(&self.up_proj)?;
        (lhs * rhs)?.apply(&self.down_proj)
    }
}

/// Scaled dot-product attention.
///
/// q: (b, num_head, q_len, dim), k/v: (b, num_kv_head, kv_len, dim).
/// Returns (b, q_len, num_head, dim).
pub fn eager_attention_forward(
    query_states: &Tensor,
    key_states: &Tensor,
    value_states: &Tensor,
    num_key_value_groups: Option<usize>,
    attention_mask: Option<&Tensor>,
    scaling: f64,
) -> Result<Tensor> {
    let key_states = match num_key_value_groups {
        Some(g) => repeat_kv(key_states.clone(), g)?,
        None => key_states.clone(),
    };
    let value_states = match num_key_value_groups {
        Some(g) => repeat_kv(value_states.clone(), g)?,
        None => value_states.clone(),
    };
    let query_states = query_states.contiguous()?;
    let key_states = key_states.contiguous()?;
    let value_states = value_states.contiguous()?;
    let attn_output = {
        #[cfg(not(feature = "flash-attn"))]
        {
            let attn_weights = query_states.matmul(&key_states.transpose(D::Minus2, D::Minus1)?)?;
            let attn_weights = (attn_weights * scaling)?;
            let attn_weights = match attention_mask {
                None => attn_weights,
                Some(mask) => attn_weights.broadcast_add(&mask.to_dtype(attn_weights.dtype())?)?,
            };
            let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
            attn_weights.matmul(&value_states)?
        }
        #[cfg(feature = "flash-attn")]
        {
            // flash-attn layout: (bs, seq_len, num_head, head_dim)
            let query_states = query_states.transpose(1, 2)?;
            let key_states = key_states.transpose(1, 2)?;
            let value_states = value_states.transpose(1, 2)?;
            candle_flash_attn::flash_attn(
                &query_states,
                &key_states,
                &value_states,
                scaling as f32,
                attention_mask.is_some(),
            )?
            .transpose(1, 2)?
        }
    };
    let attn_output = attn_output.transpose(1, 2)?.contiguous()?;
    Ok(attn_output)
}

pub fn get_layer_norm(vb: VarBuilder, eps: f64, dim: usize) -> Result<LayerNorm> {
    let ln_config = LayerNormConfig {
        eps,
        remove_mean: true,
        affine: true,
    };
    Ok(layer_norm(dim, ln_config, vb)?)
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn uniform_attention_averages_values() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 1, 4), DType::F32, &device)?;
        let k = Tensor::zeros((1, 1, 3, 4), DType::F32, &device)?;
        let v = Tensor::arange(0f32, 12., &device)?.reshape((1, 1, 3, 4))?;
        let out = eager_attention_forward(&q, &k, &v, Some(2), None, 0.5)?;
        assert_eq!(out.dims(), &[1, 1, 2, 4]);
        let head0 = out.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        for (got, want) in head0[0].iter().zip([4f32, 5., 6., 7.]) {
            assert!((got - want).abs() < 1e-5);
        }
        Ok(())
    }
}
