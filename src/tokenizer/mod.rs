use std::path::Path;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tokenizers::{
    AddedToken, Tokenizer, decoders::byte_level::ByteLevel as ByteLevelDecoder, models::bpe::BPE,
    pre_tokenizers::byte_level::ByteLevel,
};

pub struct TokenizerModel {
    pub tokenizer: Tokenizer,
}

impl TokenizerModel {
    /// Loads `tokenizer.json`, or builds a byte-level BPE from `vocab.json` + `merges.txt`.
    pub fn init(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            return Err(anyhow!("model path not found: {}", path.display()));
        }
        let tokenizer_file = path.join("tokenizer.json");
        let tokenizer = if tokenizer_file.exists() {
            Tokenizer::from_file(&tokenizer_file)
                .map_err(|e| anyhow!("tokenizer from file error: {}", e))?
        } else {
            Self::from_vocab_merges(path)?
        };
        Ok(Self { tokenizer })
    }

    fn from_vocab_merges(path: &Path) -> Result<Tokenizer> {
        let vocab_file = path.join("vocab.json");
        let merges_file = path.join("merges.txt");
        if !vocab_file.exists() || !merges_file.exists() {
            return Err(anyhow!(
                "neither tokenizer.json nor vocab.json + merges.txt found in {}",
                path.display()
            ));
        }
        let (vocab_file, merges_file) = (
            vocab_file.to_string_lossy().to_string(),
            merges_file.to_string_lossy().to_string(),
        );
        let bpe = BPE::from_file(&vocab_file, &merges_file)
            .build()
            .map_err(|e| anyhow!("failed to build BPE tokenizer: {}", e))?;
        let mut tokenizer = Tokenizer::new(bpe);
        tokenizer.with_pre_tokenizer(Some(ByteLevel::new(false, true, false)));
        tokenizer.with_decoder(Some(ByteLevelDecoder::default()));

        // <|im_start|>, <|image_pad|> and friends live in added_tokens_decoder
        let config_file = path.join("tokenizer_config.json");
        if config_file.exists() {
            let config: Value = serde_json::from_slice(&std::fs::read(&config_file)?)?;
            if let Some(Value::Object(tokens_map)) = config.get("added_tokens_decoder") {
                let special_tokens: Vec<AddedToken> = tokens_map
                    .values()
                    .filter_map(|info| {
                        let content = info.get("content")?.as_str()?;
                        let special = info.get("special").and_then(Value::as_bool).unwrap_or(false);
                        Some(AddedToken::from(content.to_string(), special))
                    })
                    .collect();
                if !special_tokens.is_empty() {
                    tokenizer.add_special_tokens(&special_tokens);
                }
            }
        }
        Ok(tokenizer)
    }

    pub fn text_encode_vec(&self, text: &str, add_special_token: bool) -> Result<Vec<u32>> {
        let token_id = self
            .tokenizer
            .encode(text, add_special_token)
            .map_err(|e| anyhow!("tokenizer encode error: {}", e))?
            .get_ids()
            .to_vec();
        Ok(token_id)
    }

    pub fn token_decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("tokenizer decode error: {}", e))
    }
}
