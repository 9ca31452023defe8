use anyhow::Result;
use showui::models::qwen2vl::config::{
    PreprocessorConfig, Qwen2VLConfig, Qwen2VLGenerationConfig, VisionActivation,
};

const SHOWUI_2B_CONFIG: &str = r#"{
  "architectures": ["Qwen2VLForConditionalGeneration"],
  "attention_dropout": 0.0,
  "bos_token_id": 151643,
  "eos_token_id": 151645,
  "vision_start_token_id": 151652,
  "vision_end_token_id": 151653,
  "vision_token_id": 151654,
  "image_token_id": 151655,
  "video_token_id": 151656,
  "hidden_act": "silu",
  "hidden_size": 1536,
  "initializer_range": 0.02,
  "intermediate_size": 8960,
  "max_position_embeddings": 32768,
  "max_window_layers": 28,
  "model_type": "qwen2_vl",
  "num_attention_heads": 12,
  "num_hidden_layers": 28,
  "num_key_value_heads": 2,
  "rms_norm_eps": 1e-06,
  "rope_theta": 1000000.0,
  "sliding_window": 32768,
  "tie_word_embeddings": true,
  "torch_dtype": "bfloat16",
  "use_cache": true,
  "use_sliding_window": false,
  "vision_config": {
    "depth": 32,
    "embed_dim": 1280,
    "mlp_ratio": 4,
    "num_heads": 16,
    "in_chans": 3,
    "hidden_size": 1536,
    "patch_size": 14,
    "spatial_merge_size": 2,
    "temporal_patch_size": 2
  },
  "rope_scaling": {"type": "mrope", "mrope_section": [16, 24, 24]},
  "vocab_size": 151936
}"#;

#[test]
fn showui_2b_config() -> Result<()> {
    let config: Qwen2VLConfig = serde_json::from_str(SHOWUI_2B_CONFIG)?;
    assert_eq!(config.head_dim(), 128);
    assert_eq!(config.rope_scaling.mrope_section, vec![16, 24, 24]);
    assert_eq!(
        config.rope_scaling.mrope_section.iter().sum::<usize>() * 2,
        config.head_dim()
    );
    assert_eq!(config.image_token_id, 151655);
    assert!(config.tie_word_embeddings);
    assert_eq!(config.vision_config.hidden_act, VisionActivation::QuickGelu);
    assert_eq!(config.vision_config.mlp_ratio, 4.0);
    Ok(())
}

#[test]
fn generation_config() -> Result<()> {
    let config: Qwen2VLGenerationConfig = serde_json::from_str(
        r#"{"bos_token_id": 151643, "pad_token_id": 151643, "do_sample": true,
            "eos_token_id": [151645, 151643], "repetition_penalty": 1.05,
            "temperature": 0.1, "top_p": 0.001, "top_k": 1}"#,
    )?;
    assert_eq!(config.eos_token_id.to_vec(), vec![151645, 151643]);
    assert_eq!(config.repetition_penalty, 1.05);

    let single: Qwen2VLGenerationConfig = serde_json::from_str(r#"{"eos_token_id": 151645}"#)?;
    assert_eq!(single.eos_token_id.to_vec(), vec![151645]);
    assert_eq!(single.repetition_penalty, 1.0);
    Ok(())
}

#[test]
fn preprocessor_config() -> Result<()> {
    let config: PreprocessorConfig = serde_json::from_str(
        r#"{"min_pixels": 3136, "max_pixels": 12845056, "patch_size": 14,
            "temporal_patch_size": 2, "merge_size": 2,
            "image_processor_type": "Qwen2VLImageProcessor"}"#,
    )?;
    assert_eq!(config.max_pixels, 12_845_056);
    assert_eq!(config.image_mean, PreprocessorConfig::default().image_mean);
    Ok(())
}
