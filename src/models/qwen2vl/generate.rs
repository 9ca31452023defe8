use std::time::Instant;

use anyhow::{Result, anyhow};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::utils::apply_repeat_penalty;
use tracing::{debug, info};

use crate::{
    chat_template::{ChatMessage, ChatTemplate},
    models::{
        GenerateModel, GenerationOutput,
        qwen2vl::{
            config::{Qwen2VLConfig, Qwen2VLGenerationConfig},
            model::Qwen2VLModel,
            processor::Qwen2VLProcessor,
        },
    },
    tokenizer::TokenizerModel,
    utils::{find_type_files, get_device, get_dtype, get_logit_processor},
};

const SEED: u64 = 34562;

pub struct Qwen2VLGenerateModel {
    chat_template: ChatTemplate,
    tokenizer: TokenizerModel,
    pre_processor: Qwen2VLProcessor,
    qwen2_vl: Qwen2VLModel,
    device: Device,
    eos_token_ids: Vec<u32>,
    repetition_penalty: f32,
}

impl Qwen2VLGenerateModel {
    pub fn init(path: &str, device: Option<&Device>, dtype: Option<DType>) -> Result<Self> {
        let start = Instant::now();
        let chat_template = ChatTemplate::init(path)?;
        let tokenizer = TokenizerModel::init(path)?;
        let config_path = std::path::Path::new(path).join("config.json");
        let cfg: Qwen2VLConfig = serde_json::from_slice(&std::fs::read(&config_path)?)
            .map_err(|e| anyhow!("parse {} error: {}", config_path.display(), e))?;
        let device = get_device(device);
        let dtype = get_dtype(dtype, &cfg.torch_dtype);
        let pre_processor = Qwen2VLProcessor::new(path, &device, dtype)?;
        let model_list = find_type_files(path, "safetensors")?;
        if model_list.is_empty() {
            return Err(anyhow!("no safetensors weights found in {}", path));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&model_list, dtype, &device)? };
        let qwen2_vl = Qwen2VLModel::new(cfg, vb)?;
        let generation_config_path = std::path::Path::new(path).join("generation_config.json");
        let generation_config: Qwen2VLGenerationConfig = if generation_config_path.exists() {
            serde_json::from_slice(&std::fs::read(&generation_config_path)?)?
        } else {
            Qwen2VLGenerationConfig::default()
        };
        info!(
            ?device,
            ?dtype,
            shards = model_list.len(),
            "qwen2-vl loaded in {:.2?}",
            start.elapsed()
        );
        Ok(Self {
            chat_template,
            tokenizer,
            pre_processor,
            qwen2_vl,
            device,
            eos_token_ids: generation_config.eos_token_id.to_vec(),
            repetition_penalty: generation_config.repetition_penalty,
        })
    }
}

impl GenerateModel for Qwen2VLGenerateModel {
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        max_new_tokens: usize,
    ) -> Result<GenerationOutput> {
        // greedy decoding, no sampling knobs
        let mut logit_processor = get_logit_processor(None, None, None, SEED);
        let mes_render = self.chat_template.apply_chat_template(messages)?;
        let input = self.pre_processor.process_info(messages, &mes_render)?;
        let prompt_ids = self.tokenizer.text_encode_vec(&input.replace_text, true)?;
        debug!(prompt_tokens = prompt_ids.len(), "prompt encoded");
        let mut input_ids = Tensor::from_slice(&prompt_ids, (1, prompt_ids.len()), &self.device)?;
        let mut seq_len = prompt_ids.len();
        let mut seqlen_offset = 0;
        let mut pixel_values = input.pixel_values.as_ref();
        let mut image_grid_thw = input.image_grid_thw.as_ref();
        let mut output_ids = prompt_ids.clone();
        let result = (|| -> Result<()> {
            for _ in 0..max_new_tokens {
                let logits =
                    self.qwen2_vl
                        .forward(&input_ids, pixel_values, image_grid_thw, seqlen_offset)?;
                let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
                let logits = if (self.repetition_penalty - 1.0).abs() > f32::EPSILON {
                    apply_repeat_penalty(&logits, self.repetition_penalty, &output_ids)?
                } else {
                    logits
                };
                let next_token = logit_processor.sample(&logits)?;
                output_ids.push(next_token);
                if self.eos_token_ids.contains(&next_token) {
                    break;
                }
                seqlen_offset += seq_len;
                seq_len = 1;
                input_ids = Tensor::from_vec(vec![next_token], (1, 1), &self.device)?;
                pixel_values = None;
                image_grid_thw = None;
            }
            Ok(())
        })();
        self.qwen2_vl.clear_kv_cache();
        result?;
        Ok(GenerationOutput {
            input_ids: vec![prompt_ids],
            output_ids: vec![output_ids],
        })
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.token_decode(ids)
    }
}
