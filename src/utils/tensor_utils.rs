use anyhow::{Result, anyhow};
use candle_core::{D, DType, Device, IndexOp, Tensor, shape::Dim};

pub fn prepare_causal_attention_mask(
    b_size: usize,
    tgt_len: usize,
    seqlen_offset: usize,
    device: &Device,
) -> Result<Tensor> {
    let arange = Tensor::arange(0u32, tgt_len as u32, device)?;
    let arange = arange.unsqueeze(1)?.broadcast_as((tgt_len, tgt_len))?;
    let upper_triangle = arange.t()?.gt(&arange)?;
    let mask = upper_triangle.where_cond(
        &Tensor::new(f32::NEG_INFINITY, device)?.broadcast_as(arange.shape())?,
        &Tensor::new(0f32, device)?.broadcast_as(arange.shape())?,
    )?;
    // cached positions are always visible
    let mask = if seqlen_offset > 0 {
        let mask0 = Tensor::zeros((tgt_len, seqlen_offset), DType::F32, device)?;
        Tensor::cat(&[&mask0, &mask], D::Minus1)?
    } else {
        mask
    };
    let mask = mask
        .expand((b_size, 1, tgt_len, tgt_len + seqlen_offset))?
        .to_dtype(DType::F32)?;
    Ok(mask)
}

pub fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        Ok(xs)
    } else {
        let (b_sz, n_kv_head, seq_len, head_dim) = xs.dims4()?;
        // cat then reshape avoids a strided copy, see huggingface/candle#2043
        let kv = Tensor::cat(&vec![&xs; n_rep], 2)?.reshape((
            b_sz,
            n_kv_head * n_rep,
            seq_len,
            head_dim,
        ))?;
        Ok(kv)
    }
}

/// Splits `t` along `dim` into consecutive chunks of the given lengths.
///
/// `t: (25)`, `splits: [5, 10, 5, 5]` yields tensors of length 5, 10, 5 and 5.
pub fn split_tensor<D: Dim>(t: &Tensor, splits: &[usize], dim: D) -> Result<Vec<Tensor>> {
    let dim = dim.to_index(t.shape(), "split")?;
    let total: usize = splits.iter().sum();
    if total != t.dim(dim)? {
        return Err(anyhow!(
            "split sizes sum to {} but dim {} has size {}",
            total,
            dim,
            t.dim(dim)?
        ));
    }
    let mut split_res = Vec::with_capacity(splits.len());
    let mut index = 0;
    for split in splits {
        split_res.push(t.narrow(dim, index, *split)?);
        index += *split;
    }
    Ok(split_res)
}

pub fn nonzero_index_vec(mask: &Tensor) -> Result<Vec<u32>> {
    let mask = if mask.dtype() != DType::U32 {
        mask.to_dtype(DType::U32)?
    } else {
        mask.clone()
    };
    match mask.rank() {
        1 => {
            let indices = mask
                .to_vec1::<u32>()?
                .iter()
                .enumerate()
                .filter_map(|(idx, &val)| if val != 0 { Some(idx as u32) } else { None })
                .collect();
            Ok(indices)
        }
        rank => Err(anyhow!("nonzero_index_vec expects rank 1, got {}", rank)),
    }
}

/// Groups the nonzero positions of a 1-d mask into half-open runs.
///
/// Nonzero indices `[0, 3, 4, 5, 8, 9]` become `[(0, 1), (3, 6), (8, 10)]`.
pub fn nonzero_slice(mask: &Tensor) -> Result<Vec<(usize, usize)>> {
    let index_vec = nonzero_index_vec(mask)?;
    let mut slices: Vec<(usize, usize)> = Vec::new();
    for idx in index_vec {
        let idx = idx as usize;
        match slices.last_mut() {
            Some((_, end)) if *end == idx => *end = idx + 1,
            _ => slices.push((idx, idx + 1)),
        }
    }
    Ok(slices)
}

/// Writes the rows of `replace` into `original` at every position flagged in `mask`.
///
/// original: (1, seq_len, hidden), replace: (n, hidden), mask: (1, seq_len) with n nonzeros.
pub fn masked_scatter_dim0(original: &Tensor, replace: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if original.dim(0)? != 1 || mask.dim(0)? != 1 {
        return Err(anyhow!(
            "masked_scatter_dim0 needs batch size 1, got original {} and mask {}",
            original.dim(0)?,
            mask.dim(0)?
        ));
    }
    let mut original = original.squeeze(0)?;
    let mask = mask.squeeze(0)?;
    let hidden = original.dim(1)?;
    let mut sub_start = 0usize;
    for (start, end) in nonzero_slice(&mask)? {
        let sub_end = sub_start + (end - start);
        let sub_replace = replace.i((sub_start..sub_end, ..))?;
        original = original.slice_assign(&[(start..end), (0..hidden)], &sub_replace)?;
        sub_start = sub_end;
    }
    if sub_start != replace.dim(0)? {
        return Err(anyhow!(
            "mask selects {} rows but {} replacement rows were given",
            sub_start,
            replace.dim(0)?
        ));
    }
    Ok(original.unsqueeze(0)?)
}

pub fn quick_gelu(xs: &Tensor) -> Result<Tensor> {
    let x = candle_nn::ops::sigmoid(&xs.affine(1.702, 0.0)?)?;
    Ok(xs.mul(&x)?)
}

pub fn get_equal_mask(input_ids: &Tensor, token_id: u32) -> Result<Tensor> {
    let token = Tensor::new(vec![token_id], input_ids.device())?.to_dtype(input_ids.dtype())?;
    let mask = input_ids.broadcast_eq(&token)?.to_dtype(DType::U32)?;
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_blocks_future_positions() -> Result<()> {
        let mask = prepare_causal_attention_mask(1, 3, 0, &Device::Cpu)?;
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows = mask.i((0, 0))?.to_vec2::<f32>()?;
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert!(rows[1][2].is_infinite());
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn causal_mask_keeps_cache_visible() -> Result<()> {
        let mask = prepare_causal_attention_mask(1, 2, 4, &Device::Cpu)?;
        assert_eq!(mask.dims(), &[1, 1, 2, 6]);
        let rows = mask.i((0, 0))?.to_vec2::<f32>()?;
        assert_eq!(&rows[0][..5], &[0.0; 5]);
        assert!(rows[0][5].is_infinite());
        Ok(())
    }

    #[test]
    fn nonzero_slice_groups_runs() -> Result<()> {
        let mask = Tensor::new(&[1u32, 0, 0, 1, 1, 1, 0, 0, 1, 1], &Device::Cpu)?;
        assert_eq!(nonzero_slice(&mask)?, vec![(0, 1), (3, 6), (8, 10)]);
        let empty = Tensor::zeros(4, DType::U32, &Device::Cpu)?;
        assert!(nonzero_slice(&empty)?.is_empty());
        Ok(())
    }

    #[test]
    fn masked_scatter_replaces_flagged_rows() -> Result<()> {
        let original = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu)?;
        let replace = Tensor::new(&[[1f32, 1.], [2., 2.]], &Device::Cpu)?;
        let mask = Tensor::new(&[[0u32, 1, 1, 0]], &Device::Cpu)?;
        let out = masked_scatter_dim0(&original, &replace, &mask)?;
        assert_eq!(
            out.squeeze(0)?.to_vec2::<f32>()?,
            vec![vec![0., 0.], vec![1., 1.], vec![2., 2.], vec![0., 0.]]
        );
        Ok(())
    }

    #[test]
    fn masked_scatter_rejects_count_mismatch() -> Result<()> {
        let original = Tensor::zeros((1, 3, 2), DType::F32, &Device::Cpu)?;
        let replace = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        let mask = Tensor::new(&[[0u32, 1, 0]], &Device::Cpu)?;
        assert!(masked_scatter_dim0(&original, &replace, &mask).is_err());
        Ok(())
    }

    #[test]
    fn quick_gelu_matches_formula() -> Result<()> {
        let xs = Tensor::new(&[-1f32, 0., 2.], &Device::Cpu)?;
        let out = quick_gelu(&xs)?.to_vec1::<f32>()?;
        for (x, y) in [-1f32, 0., 2.].iter().zip(out) {
            let expected = x / (1.0 + (-1.702 * x).exp());
            assert!((y - expected).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn split_tensor_by_lengths() -> Result<()> {
        let t = Tensor::arange(0u32, 10, &Device::Cpu)?;
        let parts = split_tensor(&t, &[3, 7], 0)?;
        assert_eq!(parts[0].to_vec1::<u32>()?, vec![0, 1, 2]);
        assert_eq!(parts[1].dim(0)?, 7);
        assert!(split_tensor(&t, &[3, 3], 0).is_err());
        Ok(())
    }
}
