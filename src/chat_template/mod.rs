use std::path::Path;

use anyhow::{Result, anyhow};
use image::DynamicImage;
use minijinja::{Environment, ErrorKind, Value as MiniJinjaValue, context};
use serde::Serialize;
use tracing::debug;

use crate::utils::string_to_static_str;

/// Qwen2-VL template, used when the checkpoint ships none.
pub const QWEN2_VL_CHAT_TEMPLATE: &str = "{% set image_count = namespace(value=0) %}{% set video_count = namespace(value=0) %}{% for message in messages %}{% if loop.first and message['role'] != 'system' %}<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n{% endif %}<|im_start|>{{ message['role'] }}\n{% if message['content'] is string %}{{ message['content'] }}<|im_end|>\n{% else %}{% for content in message['content'] %}{% if content['type'] == 'image' or 'image' in content or 'image_url' in content %}{% set image_count.value = image_count.value + 1 %}{% if add_vision_id %}Picture {{ image_count.value }}: {% endif %}<|vision_start|><|image_pad|><|vision_end|>{% elif content['type'] == 'video' or 'video' in content %}{% set video_count.value = video_count.value + 1 %}{% if add_vision_id %}Video {{ video_count.value }}: {% endif %}<|vision_start|><|video_pad|><|vision_end|>{% elif 'text' in content %}{{ content['text'] }}{% endif %}{% endfor %}<|im_end|>\n{% endif %}{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One part of a multimodal message. Images carry their own resize bounds.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        #[serde(skip)]
        image: DynamicImage,
        #[serde(skip_serializing_if = "Option::is_none")]
        min_pixels: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_pixels: Option<u32>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

/// Reads the chat template from the model directory, trying
/// `tokenizer_config.json`, `chat_template.json` and `chat_template.jinja` in turn.
pub fn get_template(path: &Path) -> Result<String> {
    for file in ["tokenizer_config.json", "chat_template.json"] {
        let file_path = path.join(file);
        if !file_path.exists() {
            continue;
        }
        let config: serde_json::Value = serde_json::from_slice(&std::fs::read(&file_path)?)
            .map_err(|e| anyhow!("load {} error: {}", file, e))?;
        if let Some(template) = config["chat_template"].as_str() {
            debug!("chat template loaded from {}", file);
            return Ok(template.to_string());
        }
    }
    let jinja_path = path.join("chat_template.jinja");
    if jinja_path.exists() {
        return std::fs::read_to_string(&jinja_path)
            .map_err(|e| anyhow!("failed to read chat_template.jinja: {}", e));
    }
    Err(anyhow!("no chat template found in {}", path.display()))
}

pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    pub fn init(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            return Err(anyhow!("model path not found: {}", path.display()));
        }
        let template = match get_template(path) {
            Ok(template) => template,
            Err(e) => {
                debug!("{}, using the built-in Qwen2-VL template", e);
                QWEN2_VL_CHAT_TEMPLATE.to_string()
            }
        };
        Self::from_template(template)
    }

    pub fn from_template(template: String) -> Result<Self> {
        let template = string_to_static_str(template);
        let mut env = Environment::new();
        env.add_filter("tojson", |v: MiniJinjaValue| {
            serde_json::to_string(&v)
                .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))
        });
        env.add_filter("split", |s: String, delimiter: String| {
            s.split(&delimiter)
                .map(|s| s.to_string())
                .collect::<Vec<String>>()
        });
        env.add_filter("lstrip", |s: String, chars: Option<String>| match chars {
            Some(chars_str) => s.trim_start_matches(chars_str.as_str()).to_string(),
            None => s.trim_start().to_string(),
        });
        env.add_filter("rstrip", |s: String, chars: Option<String>| match chars {
            Some(chars_str) => s.trim_end_matches(chars_str.as_str()).to_string(),
            None => s.trim_end().to_string(),
        });
        env.add_template("chat", template)
            .map_err(|e| anyhow!("parse chat template error: {}", e))?;
        Ok(Self { env })
    }

    pub fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String> {
        let context = context! {
            messages => messages,
            add_generation_prompt => true,
        };
        let template = self
            .env
            .get_template("chat")
            .map_err(|e| anyhow!("render template error {}", e))?;
        template
            .render(context)
            .map_err(|e| anyhow!("render template error {}", e))
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    #[test]
    fn renders_image_and_text_parts() -> Result<()> {
        let template = ChatTemplate::from_template(QWEN2_VL_CHAT_TEMPLATE.to_string())?;
        let messages = vec![ChatMessage {
            role: Role::User,
            content: vec![
                ContentPart::text("locate:"),
                ContentPart::Image {
                    image: DynamicImage::ImageRgb8(RgbImage::new(2, 2)),
                    min_pixels: Some(10),
                    max_pixels: None,
                },
                ContentPart::text("the button"),
            ],
        }];
        let rendered = template.apply_chat_template(&messages)?;
        assert_eq!(
            rendered,
            "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
             <|im_start|>user\nlocate:<|vision_start|><|image_pad|><|vision_end|>the button<|im_end|>\n\
             <|im_start|>assistant\n"
        );
        Ok(())
    }

    #[test]
    fn image_part_serializes_bounds_only() -> Result<()> {
        let part = ContentPart::Image {
            image: DynamicImage::ImageRgb8(RgbImage::new(1, 1)),
            min_pixels: Some(3136),
            max_pixels: Some(6272),
        };
        assert_eq!(
            serde_json::to_value(&part)?,
            serde_json::json!({"type": "image", "min_pixels": 3136, "max_pixels": 6272})
        );
        Ok(())
    }

    #[test]
    fn missing_template_files_fall_back_to_builtin() -> Result<()> {
        let dir = std::env::temp_dir().join("showui-empty-model-dir");
        std::fs::create_dir_all(&dir)?;
        let template = ChatTemplate::init(dir.to_str().ok_or(anyhow!("temp dir not utf-8"))?)?;
        let rendered = template.apply_chat_template(&[ChatMessage {
            role: Role::User,
            content: vec![ContentPart::text("hi")],
        }])?;
        assert!(rendered.ends_with("<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"));
        Ok(())
    }
}
