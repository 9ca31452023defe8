use anyhow::{Result, anyhow};
use candle_core::{D, Device, IndexOp, Tensor};
use candle_nn::{
    Activation, Embedding, Init, LayerNorm, Linear, Module, RmsNorm, VarBuilder, embedding,
    linear, linear_no_bias, rms_norm,
};

use crate::{
    models::{
        common::{GateUpDownMLP, eager_attention_forward, get_layer_norm},
        qwen2vl::config::{Qwen2VLConfig, Qwen2VLVisionConfig, VisionActivation},
    },
    position_embed::rope::{
        Qwen2VLTextRotaryEmbedding, VisionRotaryEmbedding, apply_rotary_pos_emb,
        apply_rotary_pos_emb_vision,
    },
    utils::tensor_utils::{
        get_equal_mask, masked_scatter_dim0, prepare_causal_attention_mask, quick_gelu,
        split_tensor,
    },
};

pub struct Qwen2VLVisionMLP {
    fc1: Linear,
    fc2: Linear,
    act: VisionActivation,
}

impl Qwen2VLVisionMLP {
    pub fn new(cfg: &Qwen2VLVisionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_dim = (cfg.embed_dim as f64 * cfg.mlp_ratio) as usize;
        let fc1 = linear(cfg.embed_dim, hidden_dim, vb.pp("fc1"))?;
        let fc2 = linear(hidden_dim, cfg.embed_dim, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            act: cfg.hidden_act,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.apply(&self.fc1)?;
        let xs = match self.act {
            VisionActivation::QuickGelu => quick_gelu(&xs)?,
            VisionActivation::Gelu => xs.apply(&Activation::Gelu)?,
            VisionActivation::Silu => xs.apply(&Activation::Silu)?,
        };
        Ok(xs.apply(&self.fc2)?)
    }
}

/// Conv3d patch embedding applied as a matmul on pre-flattened patches.
pub struct Qwen2VLPatchEmbed {
    proj_weight: Tensor,
}

impl Qwen2VLPatchEmbed {
    pub fn new(cfg: &Qwen2VLVisionConfig, vb: VarBuilder) -> Result<Self> {
        // (embed_dim, c, t, p, p) -> (embed_dim, c*t*p*p) -> (c*t*p*p, embed_dim)
        let proj_weight = vb
            .get_with_hints(
                (
                    cfg.embed_dim,
                    cfg.in_chans,
                    cfg.temporal_patch_size,
                    cfg.patch_size,
                    cfg.patch_size,
                ),
                "proj.weight",
                Init::Const(1.),
            )?
            .flatten(1, 4)?
            .t()?;
        Ok(Self { proj_weight })
    }

    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let pixel_values = pixel_values.to_dtype(self.proj_weight.dtype())?;
        Ok(pixel_values.matmul(&self.proj_weight)?)
    }
}

pub struct Qwen2VLPatchMerger {
    hidden_size: usize,
    ln_q: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl Qwen2VLPatchMerger {
    pub fn new(cfg: &Qwen2VLVisionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.embed_dim * cfg.spatial_merge_size.pow(2);
        let ln_q = get_layer_norm(vb.pp("ln_q"), 1e-6, cfg.embed_dim)?;
        let fc1 = linear(hidden_size, hidden_size, vb.pp("mlp.0"))?;
        let fc2 = linear(hidden_size, cfg.hidden_size, vb.pp("mlp.2"))?;
        Ok(Self {
            hidden_size,
            ln_q,
            fc1,
            fc2,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // every merge_size^2 consecutive patches collapse into one token
        let xs = self.ln_q.forward(xs)?.reshape(((), self.hidden_size))?;
        let xs = xs.apply(&self.fc1)?.apply(&Activation::Gelu)?;
        Ok(xs.apply(&self.fc2)?)
    }
}

pub struct Qwen2VLVisionAttention {
    num_heads: usize,
    qkv: Linear,
    proj: Linear,
    scaling: f64,
}

impl Qwen2VLVisionAttention {
    pub fn new(cfg: &Qwen2VLVisionConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let head_dim = dim / cfg.num_heads;
        let qkv = linear(dim, dim * 3, vb.pp("qkv"))?;
        let proj = linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            num_heads: cfg.num_heads,
            qkv,
            proj,
            scaling: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// Attention restricted to each frame: `chunks` lists the patch count per frame.
    pub fn forward(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor, chunks: &[usize]) -> Result<Tensor> {
        let seq_length = xs.dim(0)?;
        // (seq_len, 3, num_heads, head_dim) -> (3, seq_len, num_heads, head_dim)
        let qkv_states = xs
            .apply(&self.qkv)?
            .reshape((seq_length, 3, self.num_heads, ()))?
            .permute((1, 0, 2, 3))?;
        let query_states = qkv_states.i(0)?.contiguous()?;
        let key_states = qkv_states.i(1)?.contiguous()?;
        let value_states = qkv_states.i(2)?.contiguous()?;
        let (query_states, key_states) =
            apply_rotary_pos_emb_vision(&query_states, &key_states, cos, sin)?;
        // (1, num_heads, seq_len, head_dim)
        let query_states = query_states.transpose(0, 1)?.unsqueeze(0)?;
        let key_states = key_states.transpose(0, 1)?.unsqueeze(0)?;
        let value_states = value_states.transpose(0, 1)?.unsqueeze(0)?;
        let q_splits = split_tensor(&query_states, chunks, 2)?;
        let k_splits = split_tensor(&key_states, chunks, 2)?;
        let v_splits = split_tensor(&value_states, chunks, 2)?;
        let mut attn_outputs = Vec::with_capacity(chunks.len());
        for ((q, k), v) in q_splits.iter().zip(k_splits.iter()).zip(v_splits.iter()) {
            attn_outputs.push(eager_attention_forward(q, k, v, None, None, self.scaling)?);
        }
        let attn_output = Tensor::cat(&attn_outputs, 1)?.reshape((seq_length, ()))?;
        Ok(attn_output.apply(&self.proj)?)
    }
}

pub struct Qwen2VLVisionBlock {
    norm1: LayerNorm,
    norm2: LayerNorm,
    attn: Qwen2VLVisionAttention,
    mlp: Qwen2VLVisionMLP,
}

impl Qwen2VLVisionBlock {
    pub fn new(cfg: &Qwen2VLVisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: get_layer_norm(vb.pp("norm1"), 1e-6, cfg.embed_dim)?,
            norm2: get_layer_norm(vb.pp("norm2"), 1e-6, cfg.embed_dim)?,
            attn: Qwen2VLVisionAttention::new(cfg, vb.pp("attn"))?,
            mlp: Qwen2VLVisionMLP::new(cfg, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor, chunks: &[usize]) -> Result<Tensor> {
        let residual = xs.clone();
        let xs = self.attn.forward(&self.norm1.forward(xs)?, cos, sin, chunks)?;
        let xs = (residual + xs)?;
        let residual = xs.clone();
        let xs = self.mlp.forward(&self.norm2.forward(&xs)?)?;
        Ok((residual + xs)?)
    }
}

/// (row, col) of every patch in processor order: merge windows row-major,
/// patches inside a window row-major, frames repeated.
pub fn vision_patch_coords(grid_thw: &[[u32; 3]], merge_size: usize) -> Vec<(u32, u32)> {
    let m = merge_size as u32;
    let mut coords = Vec::new();
    for &[t, h, w] in grid_thw {
        let mut frame = Vec::with_capacity((h * w) as usize);
        for block_row in 0..h / m {
            for block_col in 0..w / m {
                for r in 0..m {
                    for c in 0..m {
                        frame.push((block_row * m + r, block_col * m + c));
                    }
                }
            }
        }
        for _ in 0..t {
            coords.extend_from_slice(&frame);
        }
    }
    coords
}

pub struct Qwen2VLVisionModel {
    spatial_merge_size: usize,
    patch_embed: Qwen2VLPatchEmbed,
    rotary_pos_emb: VisionRotaryEmbedding,
    blocks: Vec<Qwen2VLVisionBlock>,
    merger: Qwen2VLPatchMerger,
}

impl Qwen2VLVisionModel {
    pub fn new(cfg: &Qwen2VLVisionConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embed = Qwen2VLPatchEmbed::new(cfg, vb.pp("patch_embed"))?;
        let head_dim = cfg.embed_dim / cfg.num_heads;
        let rotary_pos_emb = VisionRotaryEmbedding::new(head_dim / 2, None);
        let vb_blocks = vb.pp("blocks");
        let blocks = (0..cfg.depth)
            .map(|i| Qwen2VLVisionBlock::new(cfg, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let merger = Qwen2VLPatchMerger::new(cfg, vb.pp("merger"))?;
        Ok(Self {
            spatial_merge_size: cfg.spatial_merge_size,
            patch_embed,
            rotary_pos_emb,
            blocks,
            merger,
        })
    }

    pub fn rot_pos_emb(&self, grid_thw: &[[u32; 3]], device: &Device) -> Result<Tensor> {
        let coords = vision_patch_coords(grid_thw, self.spatial_merge_size);
        let max_hw = grid_thw
            .iter()
            .map(|[_, h, w]| *h.max(w))
            .max()
            .unwrap_or(0);
        let freq_table = self.rotary_pos_emb.forward(max_hw as usize, device)?;
        let (rows, cols): (Vec<u32>, Vec<u32>) = coords.into_iter().unzip();
        let n = rows.len();
        let rows = Tensor::from_vec(rows, n, device)?;
        let cols = Tensor::from_vec(cols, n, device)?;
        let emb_h = freq_table.index_select(&rows, 0)?;
        let emb_w = freq_table.index_select(&cols, 0)?;
        Ok(Tensor::cat(&[emb_h, emb_w], 1)?.contiguous()?)
    }

    /// pixel_values: (num_patches, c*t*p*p). Returns (num_patches / merge_size^2, hidden_size).
    pub fn forward(&self, pixel_values: &Tensor, grid_thw: &[[u32; 3]]) -> Result<Tensor> {
        let mut hidden_states = self.patch_embed.forward(pixel_values)?;
        let rotary_pos_emb = self.rot_pos_emb(grid_thw, pixel_values.device())?;
        let emb = Tensor::cat(&[&rotary_pos_emb, &rotary_pos_emb], D::Minus1)?;
        let cos = emb.cos()?;
        let sin = emb.sin()?;
        let chunks: Vec<usize> = grid_thw
            .iter()
            .flat_map(|&[t, h, w]| std::iter::repeat_n((h * w) as usize, t as usize))
            .collect();
        for block in &self.blocks {
            hidden_states = block.forward(&hidden_states, &cos, &sin, &chunks)?;
        }
        self.merger.forward(&hidden_states)
    }
}

pub struct Qwen2VLTextAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_attention_heads: usize,
    num_key_value_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
    hidden_size: usize,
    scaling: f64,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Qwen2VLTextAttention {
    pub fn new(cfg: &Qwen2VLConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let head_dim = cfg.head_dim();
        let num_attention_heads = cfg.num_attention_heads;
        let num_key_value_heads = cfg.num_key_value_heads;
        // qkv carry a bias in Qwen2, the output projection does not
        let q_proj = linear(hidden_size, num_attention_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear(hidden_size, num_key_value_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear(hidden_size, num_key_value_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_attention_heads * head_dim, hidden_size, vb.pp("o_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_attention_heads,
            num_key_value_heads,
            num_kv_groups: num_attention_heads / num_key_value_heads,
            head_dim,
            hidden_size,
            scaling: 1f64 / f64::sqrt(head_dim as f64),
            kv_cache: None,
        })
    }

    pub fn forward(
        &mut self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _) = xs.dims3()?;
        let query_states = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?;
        let key_states = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?;
        let value_states = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?;
        let (query_states, key_states) =
            apply_rotary_pos_emb(&query_states, &key_states, cos, sin, false)?;
        let (key_states, value_states) = match &self.kv_cache {
            None => (key_states, value_states),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &key_states], 2)?,
                Tensor::cat(&[prev_v, &value_states], 2)?,
            ),
        };
        self.kv_cache = Some((key_states.clone(), value_states.clone()));
        let attn_output = eager_attention_forward(
            &query_states,
            &key_states,
            &value_states,
            Some(self.num_kv_groups),
            attention_mask,
            self.scaling,
        )?;
        let attn_output = attn_output.reshape((b_sz, q_len, self.hidden_size))?;
        Ok(attn_output.apply(&self.o_proj)?)
    }

    pub fn clear_kv_cache(&mut self) {
        self.kv_cache = None
    }
}

pub struct Qwen2VLDecoderLayer {
    self_attn: Qwen2VLTextAttention,
    mlp: GateUpDownMLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl Qwen2VLDecoderLayer {
    pub fn new(cfg: &Qwen2VLConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = Qwen2VLTextAttention::new(cfg, vb.pp("self_attn"))?;
        let mlp = GateUpDownMLP::new(
            vb.pp("mlp"),
            cfg.hidden_size,
            cfg.intermediate_size,
            cfg.hidden_act,
            false,
        )?;
        let input_layernorm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    pub fn forward(
        &mut self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let residual = xs.clone();
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attn.forward(&xs, cos, sin, attention_mask)?;
        let xs = residual.add(&xs)?;
        let residual = xs.clone();
        let xs = self.post_attention_layernorm.forward(&xs)?;
        let xs = self.mlp.forward(&xs)?;
        Ok(residual.add(&xs)?)
    }

    pub fn clear_kv_cache(&mut self) {
        self.self_attn.clear_kv_cache();
    }
}

pub struct Qwen2VLTextModel {
    embed_tokens: Embedding,
    layers: Vec<Qwen2VLDecoderLayer>,
    norm: RmsNorm,
    rotary_emb: Qwen2VLTextRotaryEmbedding,
}

impl Qwen2VLTextModel {
    pub fn new(cfg: &Qwen2VLConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| Qwen2VLDecoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        let rotary_emb = Qwen2VLTextRotaryEmbedding::new(
            cfg.head_dim(),
            cfg.rope_theta,
            cfg.rope_scaling.mrope_section.clone(),
        )?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary_emb,
        })
    }

    /// position_ids: (3, bs, seq_len)
    pub fn forward(
        &mut self,
        inputs_embeds: &Tensor,
        seqlen_offset: usize,
        position_ids: &Tensor,
    ) -> Result<Tensor> {
        let (b_size, seq_len, _) = inputs_embeds.dims3()?;
        let (cos, sin) = self.rotary_emb.forward(position_ids, inputs_embeds.dtype())?;
        let attention_mask = if seq_len <= 1 {
            None
        } else {
            Some(prepare_causal_attention_mask(
                b_size,
                seq_len,
                seqlen_offset,
                inputs_embeds.device(),
            )?)
        };
        let mut xs = inputs_embeds.clone();
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, &cos, &sin, attention_mask.as_ref())?;
        }
        Ok(xs.apply(&self.norm)?)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_kv_cache()
        }
    }
}

/// 3-axis rope positions of a single prompt.
///
/// Text tokens advance all three axes together. The placeholder tokens of an image
/// take `(t, h, w)` positions on its merged grid, offset by the preceding text, and
/// the text after the image resumes from the largest position used so far plus one.
/// Returns the rows `[t, h, w]` and the delta between the next free position and
/// the prompt length, which decode steps add to their cache offset.
pub fn mrope_position_ids(
    input_ids: &[u32],
    image_grid_thw: &[[u32; 3]],
    image_token_id: u32,
    vision_start_token_id: u32,
    spatial_merge_size: usize,
) -> Result<([Vec<u32>; 3], i64)> {
    let image_starts: Vec<usize> = input_ids
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[0] == vision_start_token_id && pair[1] == image_token_id)
        .map(|(i, _)| i + 1)
        .collect();
    if image_starts.len() != image_grid_thw.len() {
        return Err(anyhow!(
            "prompt holds {} images but {} image grids were given",
            image_starts.len(),
            image_grid_thw.len()
        ));
    }
    let m = spatial_merge_size as u32;
    let mut rows: [Vec<u32>; 3] = std::array::from_fn(|_| Vec::with_capacity(input_ids.len()));
    let mut next_pos = 0u32;
    let mut text_start = 0usize;
    for (&image_start, &[t, h, w]) in image_starts.iter().zip(image_grid_thw) {
        if image_start < text_start {
            return Err(anyhow!("image at token {} overlaps the previous image", image_start));
        }
        for _ in text_start..image_start {
            rows.iter_mut().for_each(|row| row.push(next_pos));
            next_pos += 1;
        }
        let (llm_h, llm_w) = (h / m, w / m);
        for ti in 0..t {
            for hi in 0..llm_h {
                for wi in 0..llm_w {
                    rows[0].push(next_pos + ti);
                    rows[1].push(next_pos + hi);
                    rows[2].push(next_pos + wi);
                }
            }
        }
        next_pos += t.max(llm_h).max(llm_w);
        text_start = image_start + (t * llm_h * llm_w) as usize;
    }
    if text_start > input_ids.len() {
        return Err(anyhow!(
            "image placeholders run past the end of the prompt ({} > {})",
            text_start,
            input_ids.len()
        ));
    }
    for _ in text_start..input_ids.len() {
        rows.iter_mut().for_each(|row| row.push(next_pos));
        next_pos += 1;
    }
    let delta = next_pos as i64 - input_ids.len() as i64;
    Ok((rows, delta))
}

pub struct Qwen2VLModel {
    config: Qwen2VLConfig,
    visual: Qwen2VLVisionModel,
    language_model: Qwen2VLTextModel,
    lm_head: Linear,
    rope_delta: i64,
}

impl Qwen2VLModel {
    /// Accepts both checkpoint layouts: `model.*` + `visual.*`, and the newer
    /// `model.language_model.*` + `model.visual.*`.
    pub fn new(config: Qwen2VLConfig, vb: VarBuilder) -> Result<Self> {
        let (text_prefix, visual_prefix) =
            if vb.contains_tensor("model.language_model.embed_tokens.weight") {
                ("model.language_model", "model.visual")
            } else {
                ("model", "visual")
            };
        let visual = Qwen2VLVisionModel::new(&config.vision_config, vb.pp(visual_prefix))?;
        let language_model = Qwen2VLTextModel::new(&config, vb.pp(text_prefix))?;
        let lm_head = if config.tie_word_embeddings || !vb.contains_tensor("lm_head.weight") {
            Linear::new(language_model.embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };
        Ok(Self {
            config,
            visual,
            language_model,
            lm_head,
            rope_delta: 0,
        })
    }

    pub fn config(&self) -> &Qwen2VLConfig {
        &self.config
    }

    /// input_ids: (1, seq_len) u32. Returns the logits of the last position, (1, 1, vocab).
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        pixel_values: Option<&Tensor>,
        image_grid_thw: Option<&Tensor>,
        seqlen_offset: usize,
    ) -> Result<Tensor> {
        let (bs, seq_len) = input_ids.dims2()?;
        if bs != 1 {
            return Err(anyhow!("only batch size 1 is supported, got {}", bs));
        }
        let mut inputs_embeds = self.language_model.embed_tokens.forward(input_ids)?;
        let grid_thw: Vec<[u32; 3]> = match image_grid_thw {
            Some(grid) => grid
                .to_vec2::<u32>()?
                .into_iter()
                .map(|row| {
                    <[u32; 3]>::try_from(row)
                        .map_err(|row| anyhow!("grid_thw rows need 3 values, got {:?}", row))
                })
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };
        if let Some(pixel_values) = pixel_values
            && !grid_thw.is_empty()
        {
            let image_embeds = self
                .visual
                .forward(pixel_values, &grid_thw)?
                .to_dtype(inputs_embeds.dtype())?;
            let image_mask = get_equal_mask(input_ids, self.config.image_token_id)?;
            let n_image_tokens = image_mask.sum_all()?.to_scalar::<u32>()? as usize;
            if n_image_tokens != image_embeds.dim(0)? {
                return Err(anyhow!(
                    "image tokens {} do not match image features {}",
                    n_image_tokens,
                    image_embeds.dim(0)?
                ));
            }
            inputs_embeds = masked_scatter_dim0(&inputs_embeds, &image_embeds, &image_mask)?;
        }

        let device = input_ids.device();
        let position_ids = if seqlen_offset == 0 {
            let ids = input_ids.i(0)?.to_vec1::<u32>()?;
            let (rows, delta) = mrope_position_ids(
                &ids,
                &grid_thw,
                self.config.image_token_id,
                self.config.vision_start_token_id,
                self.config.vision_config.spatial_merge_size,
            )?;
            self.rope_delta = delta;
            Tensor::from_vec(rows.concat(), (3, 1, seq_len), device)?
        } else {
            let start = seqlen_offset as i64 + self.rope_delta;
            if start < 0 {
                return Err(anyhow!("negative rope position {}", start));
            }
            Tensor::arange(start as u32, (start + seq_len as i64) as u32, device)?
                .reshape((1, 1, seq_len))?
                .broadcast_as((3, 1, seq_len))?
                .contiguous()?
        };
        let outputs = self
            .language_model
            .forward(&inputs_embeds, seqlen_offset, &position_ids)?;
        let hidden_state = outputs.narrow(1, seq_len - 1, 1)?;
        Ok(self.lm_head.forward(&hidden_state)?)
    }

    pub fn clear_kv_cache(&mut self) {
        self.language_model.clear_kv_cache();
        self.rope_delta = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VS: u32 = 151652;
    const VE: u32 = 151653;
    const IMG: u32 = 151655;

    #[test]
    fn mrope_positions_follow_image_grid() -> Result<()> {
        let ids = [11, VS, IMG, IMG, IMG, IMG, VE, 12];
        let (rows, delta) = mrope_position_ids(&ids, &[[1, 4, 4]], IMG, VS, 2)?;
        assert_eq!(rows[0], vec![0, 1, 2, 2, 2, 2, 4, 5]);
        assert_eq!(rows[1], vec![0, 1, 2, 2, 3, 3, 4, 5]);
        assert_eq!(rows[2], vec![0, 1, 2, 3, 2, 3, 4, 5]);
        assert_eq!(delta, -2);
        Ok(())
    }

    #[test]
    fn mrope_positions_text_only() -> Result<()> {
        let (rows, delta) = mrope_position_ids(&[5, 6, 7], &[], IMG, VS, 2)?;
        for row in rows {
            assert_eq!(row, vec![0, 1, 2]);
        }
        assert_eq!(delta, 0);
        Ok(())
    }

    #[test]
    fn mrope_positions_reject_missing_grid() {
        let ids = [VS, IMG, IMG, IMG, IMG, VE];
        assert!(mrope_position_ids(&ids, &[], IMG, VS, 2).is_err());
        assert!(mrope_position_ids(&ids, &[[1, 8, 8]], IMG, VS, 2).is_err());
    }

    #[test]
    fn patch_coords_walk_merge_windows() {
        let coords = vision_patch_coords(&[[1, 2, 4]], 2);
        assert_eq!(
            coords,
            vec![
                (0, 0),
                (0, 1),
                (1, 0),
                (1, 1),
                (0, 2),
                (0, 3),
                (1, 2),
                (1, 3)
            ]
        );
        assert_eq!(vision_patch_coords(&[[2, 2, 2]], 2).len(), 8);
    }
}
