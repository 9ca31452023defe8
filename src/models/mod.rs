pub mod common;
pub mod qwen2vl;

use anyhow::Result;

use crate::chat_template::ChatMessage;

/// Prompt and full output token ids (prompt followed by the generated tokens),
/// one row per batch element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub input_ids: Vec<Vec<u32>>,
    pub output_ids: Vec<Vec<u32>>,
}

pub trait GenerateModel {
    fn generate(&mut self, messages: &[ChatMessage], max_new_tokens: usize)
    -> Result<GenerationOutput>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}
