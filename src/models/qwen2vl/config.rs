use candle_nn::Activation;
use serde::Deserialize;

/// Activation of the vision tower MLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionActivation {
    QuickGelu,
    Gelu,
    Silu,
}

fn default_quick_gelu() -> VisionActivation {
    VisionActivation::QuickGelu
}

fn default_silu() -> Activation {
    Activation::Silu
}

fn default_in_chans() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_dtype() -> String {
    "bfloat16".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Qwen2VLVisionConfig {
    pub depth: usize,
    pub embed_dim: usize,
    pub mlp_ratio: f64,
    pub num_heads: usize,
    #[serde(default = "default_in_chans", alias = "in_channels")]
    pub in_chans: usize,
    /// Width of the language model the merger projects into.
    pub hidden_size: usize,
    pub patch_size: usize,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
    #[serde(default = "default_quick_gelu")]
    pub hidden_act: VisionActivation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RopeScaling {
    #[serde(alias = "rope_type")]
    pub r#type: String,
    pub mrope_section: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Qwen2VLConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default = "default_silu")]
    pub hidden_act: Activation,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
    pub rope_scaling: RopeScaling,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_dtype", alias = "dtype")]
    pub torch_dtype: String,
    pub vision_start_token_id: u32,
    pub vision_end_token_id: u32,
    pub image_token_id: u32,
    pub video_token_id: u32,
    pub vision_config: Qwen2VLVisionConfig,
}

impl Qwen2VLConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Multiple(ids) => ids.clone(),
        }
    }
}

fn default_repetition_penalty() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Qwen2VLGenerationConfig {
    pub eos_token_id: TokenIds,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
}

impl Default for Qwen2VLGenerationConfig {
    fn default() -> Self {
        Self {
            eos_token_id: TokenIds::Multiple(vec![151645, 151643]),
            pad_token_id: Some(151643),
            repetition_penalty: 1.0,
        }
    }
}

fn default_min_pixels() -> usize {
    56 * 56
}

fn default_max_pixels() -> usize {
    28 * 28 * 1280
}

fn default_patch_size() -> usize {
    14
}

fn default_temporal_patch_size() -> usize {
    2
}

fn default_merge_size() -> usize {
    2
}

fn default_image_mean() -> Vec<f32> {
    vec![0.481_454_66, 0.457_827_5, 0.408_210_73]
}

fn default_image_std() -> Vec<f32> {
    vec![0.268_629_54, 0.261_302_58, 0.275_777_1]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default = "default_min_pixels")]
    pub min_pixels: usize,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_temporal_patch_size")]
    pub temporal_patch_size: usize,
    #[serde(default = "default_merge_size")]
    pub merge_size: usize,
    #[serde(default = "default_image_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_image_std")]
    pub image_std: Vec<f32>,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            min_pixels: default_min_pixels(),
            max_pixels: default_max_pixels(),
            patch_size: default_patch_size(),
            temporal_patch_size: default_temporal_patch_size(),
            merge_size: default_merge_size(),
            image_mean: default_image_mean(),
            image_std: default_image_std(),
        }
    }
}
