use anyhow::{Result, anyhow};
use candle_core::{D, DType, Device, IndexOp, Tensor};

use crate::utils::tensor_utils::split_tensor;

pub fn compute_default_rope_parameters(dim: usize, base: f32) -> Vec<f32> {
    (0..dim)
        .step_by(2)
        .map(|i| 1.0_f32 / base.powf(i as f32 / dim as f32))
        .collect()
}

pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half_dim = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half_dim)?;
    let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;
    let x2 = x2.affine(-1.0, 0.0)?;
    let rotate_x = Tensor::cat(&[&x2, &x1], D::Minus1)?.contiguous()?;
    Ok(rotate_x)
}

pub fn apply_rotary_pos_emb_vision(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    // q, k: (seq_len, num_heads, head_dim)
    // cos, sin: (seq_len, head_dim) -> (seq_len, 1, head_dim)
    let orig_dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let cos = cos.unsqueeze(D::Minus2)?.to_dtype(DType::F32)?;
    let sin = sin.unsqueeze(D::Minus2)?.to_dtype(DType::F32)?;
    let q_embed = q
        .broadcast_mul(&cos)?
        .add(&rotate_half(&q)?.broadcast_mul(&sin)?)?
        .to_dtype(orig_dtype)?;
    let k_embed = k
        .broadcast_mul(&cos)?
        .add(&rotate_half(&k)?.broadcast_mul(&sin)?)?
        .to_dtype(orig_dtype)?;
    Ok((q_embed, k_embed))
}

pub fn apply_rotary_pos_emb(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    tof32: bool,
) -> Result<(Tensor, Tensor)> {
    // q/k: (bs, n_head, seq_len, head_dim)
    // cos/sin: broadcast to (bs, 1, seq_len, head_dim)
    let (cos, sin) = match cos.rank() {
        2 => (
            cos.unsqueeze(0)?.unsqueeze(0)?,
            sin.unsqueeze(0)?.unsqueeze(0)?,
        ),
        3 => (cos.unsqueeze(1)?, sin.unsqueeze(1)?),
        _ => (cos.clone(), sin.clone()),
    };
    let orig_dtype = q.dtype();
    let (q, k) = if tof32 {
        (q.to_dtype(DType::F32)?, k.to_dtype(DType::F32)?)
    } else {
        (q.clone(), k.clone())
    };
    let cos = cos.to_dtype(q.dtype())?;
    let sin = sin.to_dtype(q.dtype())?;

    let q_embed = q
        .broadcast_mul(&cos)?
        .add(&rotate_half(&q)?.broadcast_mul(&sin)?)?
        .to_dtype(orig_dtype)?;
    let k_embed = k
        .broadcast_mul(&cos)?
        .add(&rotate_half(&k)?.broadcast_mul(&sin)?)?
        .to_dtype(orig_dtype)?;
    Ok((q_embed, k_embed))
}

/// Multimodal rotary embedding of the Qwen2-VL text decoder.
///
/// The head dimension is cut into `mrope_section` chunks (repeated for both halves)
/// and chunk `i` takes its angle from the temporal, height or width position row `i % 3`.
#[derive(Debug, Clone)]
pub struct Qwen2VLTextRotaryEmbedding {
    inv_freq: Vec<f32>,
    mrope_section: Vec<usize>,
}

impl Qwen2VLTextRotaryEmbedding {
    pub fn new(dim: usize, theta_base: f32, mrope_section: Vec<usize>) -> Result<Self> {
        let inv_freq = compute_default_rope_parameters(dim, theta_base);
        let section_sum: usize = mrope_section.iter().sum();
        if section_sum != inv_freq.len() {
            return Err(anyhow!(
                "mrope_section {:?} sums to {}, expected head_dim / 2 = {}",
                mrope_section,
                section_sum,
                inv_freq.len()
            ));
        }
        Ok(Self {
            inv_freq,
            mrope_section,
        })
    }

    pub fn forward(&self, position_ids: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        // position_ids: (3, bs, seq_len) -> (3, bs, 1, seq_len)
        let bs = position_ids.dim(1)?;
        let position_ids_expanded = position_ids
            .unsqueeze(D::Minus2)?
            .to_dtype(DType::F32)?
            .contiguous()?;
        // (1, 1, head_dim / 2, 1) -> (3, bs, head_dim / 2, 1)
        let inv_freq_expanded = Tensor::from_vec(
            self.inv_freq.clone(),
            (1, 1, self.inv_freq.len(), 1),
            position_ids.device(),
        )?
        .broadcast_as((3, bs, self.inv_freq.len(), 1))?
        .contiguous()?;
        // (3, bs, head_dim / 2, seq_len) -> (3, bs, seq_len, head_dim / 2)
        let freqs = inv_freq_expanded
            .matmul(&position_ids_expanded)?
            .transpose(2, 3)?;
        // (3, bs, seq_len, head_dim)
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?.contiguous()?;
        let cos = self.select_sections(&emb.cos()?)?;
        let sin = self.select_sections(&emb.sin()?)?;
        Ok((cos.to_dtype(dtype)?, sin.to_dtype(dtype)?))
    }

    // (3, bs, seq_len, head_dim) -> (bs, 1, seq_len, head_dim)
    fn select_sections(&self, xs: &Tensor) -> Result<Tensor> {
        let sections = self.mrope_section.repeat(2);
        let selected = split_tensor(xs, &sections, D::Minus1)?
            .iter()
            .enumerate()
            .map(|(i, m)| m.i(i % 3))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&selected, D::Minus1)?
            .unsqueeze(1)?
            .contiguous()?)
    }
}

#[derive(Debug, Clone)]
pub struct VisionRotaryEmbedding {
    inv_freq: Vec<f32>,
}

impl VisionRotaryEmbedding {
    pub fn new(dim: usize, theta_base: Option<f32>) -> Self {
        let theta_base = theta_base.unwrap_or(10000.0_f32);
        let inv_freq = compute_default_rope_parameters(dim, theta_base);
        Self { inv_freq }
    }

    /// Angle table of shape (seqlen, dim / 2).
    pub fn forward(&self, seqlen: usize, device: &Device) -> Result<Tensor> {
        let seq = Tensor::arange(0.0_f32, seqlen as f32, device)?.reshape((seqlen, 1))?;
        let inv_freq = Tensor::from_vec(self.inv_freq.clone(), (1, self.inv_freq.len()), device)?;
        let freqs = seq.matmul(&inv_freq)?;
        Ok(freqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_half_swaps_and_negates() -> Result<()> {
        let x = Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu)?;
        assert_eq!(rotate_half(&x)?.to_vec1::<f32>()?, vec![-3., -4., 1., 2.]);
        Ok(())
    }

    #[test]
    fn mrope_equal_positions_match_plain_rope() -> Result<()> {
        // with identical t/h/w rows the sectioned embedding collapses to 1-d rope
        let rope = Qwen2VLTextRotaryEmbedding::new(8, 10000.0, vec![1, 1, 2])?;
        let pos = Tensor::arange(0u32, 5, &Device::Cpu)?
            .reshape((1, 1, 5))?
            .broadcast_as((3, 1, 5))?
            .contiguous()?;
        let (cos, _sin) = rope.forward(&pos, DType::F32)?;
        assert_eq!(cos.dims(), &[1, 1, 5, 8]);

        let inv_freq = compute_default_rope_parameters(8, 10000.0);
        let row = cos.i((0, 0, 3))?.to_vec1::<f32>()?;
        for (j, value) in row.iter().enumerate() {
            let expected = (3.0 * inv_freq[j % 4]).cos();
            assert!((value - expected).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn mrope_rejects_bad_sections() {
        assert!(Qwen2VLTextRotaryEmbedding::new(8, 10000.0, vec![1, 1, 1]).is_err());
    }

    #[test]
    fn vision_rotary_table_shape() -> Result<()> {
        let rope = VisionRotaryEmbedding::new(40, None);
        let table = rope.forward(7, &Device::Cpu)?;
        assert_eq!(table.dims(), &[7, 20]);
        Ok(())
    }
}
