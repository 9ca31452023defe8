//! Screenshot grounding: prompt assembly, one generation call and
//! best-effort extraction of an `x, y` pair from the model's reply.

use std::time::Instant;

use anyhow::{Result, anyhow};
use candle_core::{DType, Device};
use image::DynamicImage;
use tracing::{debug, info};

use crate::{
    chat_template::{ChatMessage, ContentPart, Role},
    literal::{self, Literal},
    models::{GenerateModel, qwen2vl::generate::Qwen2VLGenerateModel},
};

pub const SYSTEM_PROMPT: &str = "Based on the screenshot of the page, I give a text description and you give its corresponding location. The coordinate represents a clickable location [x, y] for an element, which is a relative coordinate on the screenshot, scaled from 0 to 1.";

pub const MIN_PIXELS: u32 = 256 * 28 * 28;
pub const MAX_PIXELS: u32 = 1344 * 28 * 28;
pub const MAX_NEW_TOKENS: usize = 128;

/// The single user turn sent for every request. Pixel bounds never depend on the image.
pub fn build_messages(image: DynamicImage, query: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: Role::User,
        content: vec![
            ContentPart::text(SYSTEM_PROMPT),
            ContentPart::Image {
                image,
                min_pixels: Some(MIN_PIXELS),
                max_pixels: Some(MAX_PIXELS),
            },
            ContentPart::text(query),
        ],
    }]
}

/// Drops the echoed prompt from each output row.
pub fn trim_prompt_tokens(input_ids: &[Vec<u32>], output_ids: &[Vec<u32>]) -> Vec<Vec<u32>> {
    input_ids
        .iter()
        .zip(output_ids)
        .map(|(input, output)| output.get(input.len()..).unwrap_or_default().to_vec())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prediction {
    /// The reply was a two-element list, formatted as `x, y`.
    Parsed(String),
    /// Anything else, returned as decoded.
    RawFallback(String),
}

impl Prediction {
    pub fn into_text(self) -> String {
        match self {
            Prediction::Parsed(text) | Prediction::RawFallback(text) => text,
        }
    }
}

pub fn parse_coordinates(text: &str) -> Prediction {
    match literal::parse(text) {
        Ok(Literal::List(items)) if items.len() == 2 => {
            Prediction::Parsed(format!("{}, {}", items[0], items[1]))
        }
        Ok(other) => {
            debug!(value = %other.repr(), "model output is not a two-element list");
            Prediction::RawFallback(text.to_string())
        }
        Err(e) => {
            debug!("model output is not a literal: {}", e);
            Prediction::RawFallback(text.to_string())
        }
    }
}

/// Model plus pre/post-processing, constructed once and shared by the server.
pub struct Grounder {
    model: Box<dyn GenerateModel + Send>,
}

impl Grounder {
    pub fn new(model: Box<dyn GenerateModel + Send>) -> Self {
        Self { model }
    }

    pub fn load(path: &str, device: Option<&Device>, dtype: Option<DType>) -> Result<Self> {
        let model = Qwen2VLGenerateModel::init(path, device, dtype)?;
        Ok(Self::new(Box::new(model)))
    }

    pub fn predict(&mut self, image: DynamicImage, query: &str) -> Result<Prediction> {
        let start = Instant::now();
        let messages = build_messages(image, query);
        let output = self.model.generate(&messages, MAX_NEW_TOKENS)?;
        let generated = trim_prompt_tokens(&output.input_ids, &output.output_ids);
        let first = generated
            .first()
            .ok_or(anyhow!("generation returned no sequences"))?;
        let text = self.model.decode(first)?;
        let prediction = parse_coordinates(&text);
        info!(
            parsed = matches!(prediction, Prediction::Parsed(_)),
            new_tokens = first.len(),
            "grounding finished in {:.2?}",
            start.elapsed()
        );
        Ok(prediction)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use anyhow::{Result, anyhow};

    use crate::{
        chat_template::{ChatMessage, ContentPart},
        models::{GenerateModel, GenerationOutput},
    };

    /// Replies with fixed text. Prompt ids are `[1, 2, 3]`, the reply is
    /// always the token ids `[7, 8]`, so decoding anything else means the
    /// prompt was not trimmed.
    pub struct ScriptedModel {
        pub reply: String,
        pub fail: bool,
        pub seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    impl ScriptedModel {
        pub fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail: false,
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl GenerateModel for ScriptedModel {
        fn generate(
            &mut self,
            messages: &[ChatMessage],
            max_new_tokens: usize,
        ) -> Result<GenerationOutput> {
            if self.fail {
                return Err(anyhow!("device out of memory"));
            }
            assert_eq!(max_new_tokens, super::MAX_NEW_TOKENS);
            self.seen
                .lock()
                .map_err(|e| anyhow!("{}", e))?
                .push(messages.to_vec());
            Ok(GenerationOutput {
                input_ids: vec![vec![1, 2, 3]],
                output_ids: vec![vec![1, 2, 3, 7, 8]],
            })
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            if ids != [7, 8] {
                return Err(anyhow!("unexpected ids {:?}", ids));
            }
            Ok(self.reply.clone())
        }
    }

    pub fn image_bounds(messages: &[ChatMessage]) -> Vec<(Option<u32>, Option<u32>)> {
        messages
            .iter()
            .flat_map(|m| &m.content)
            .filter_map(|part| match part {
                ContentPart::Image {
                    min_pixels,
                    max_pixels,
                    ..
                } => Some((*min_pixels, *max_pixels)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::{testing::*, *};

    fn screenshot(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
    }

    #[test]
    fn two_element_list_is_formatted() {
        assert_eq!(
            parse_coordinates("[0.42, 0.81]"),
            Prediction::Parsed("0.42, 0.81".to_string())
        );
        assert_eq!(
            parse_coordinates("[1e-1, -0]"),
            Prediction::Parsed("1e-1, -0".to_string())
        );
        assert_eq!(
            parse_coordinates("['left', [1, 'a']]"),
            Prediction::Parsed("left, [1, 'a']".to_string())
        );
        assert_eq!(
            parse_coordinates("[- 0.5, 0.2]"),
            Prediction::Parsed("- 0.5, 0.2".to_string())
        );
    }

    #[test]
    fn anything_else_is_returned_unchanged() {
        for text in [
            "[0.1, 0.2, 0.3]",
            "click here",
            "(0.1, 0.2)",
            "0.5",
            "[0.1, 0.2",
            "",
            "{'x': 0.1, 'y': 0.2}",
            "\n  [0.1, 0.2]",
        ] {
            assert_eq!(
                parse_coordinates(text),
                Prediction::RawFallback(text.to_string())
            );
        }
    }

    #[test]
    fn prompt_prefix_is_trimmed_per_row() {
        let trimmed = trim_prompt_tokens(
            &[vec![1, 2], vec![5]],
            &[vec![1, 2, 9, 10], vec![5]],
        );
        assert_eq!(trimmed, vec![vec![9, 10], vec![]]);
        assert_eq!(trim_prompt_tokens(&[vec![1, 2, 3]], &[vec![1]]), vec![Vec::<u32>::new()]);
    }

    #[test]
    fn message_layout() {
        let messages = build_messages(screenshot(4, 4), "");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        let content = &messages[0].content;
        assert!(matches!(&content[0], ContentPart::Text { text } if text == SYSTEM_PROMPT));
        assert!(matches!(&content[1], ContentPart::Image { .. }));
        assert!(matches!(&content[2], ContentPart::Text { text } if text.is_empty()));
    }

    #[test]
    fn pixel_bounds_do_not_depend_on_image_size() -> Result<()> {
        let model = ScriptedModel::new("[0.42, 0.81]");
        let seen = model.seen.clone();
        let mut grounder = Grounder::new(Box::new(model));
        for (w, h) in [(1, 1), (1920, 1080), (28, 5000)] {
            let prediction = grounder.predict(screenshot(w, h), "the search box")?;
            assert_eq!(prediction, Prediction::Parsed("0.42, 0.81".to_string()));
        }
        let seen = seen.lock().map_err(|e| anyhow!("{}", e))?;
        assert_eq!(seen.len(), 3);
        for messages in seen.iter() {
            assert_eq!(
                image_bounds(messages),
                vec![(Some(200_704), Some(1_053_696))]
            );
        }
        Ok(())
    }

    #[test]
    fn raw_reply_passes_through_grounder() -> Result<()> {
        let mut grounder = Grounder::new(Box::new(ScriptedModel::new("I can't find it")));
        let prediction = grounder.predict(screenshot(8, 8), "a missing button")?;
        assert_eq!(prediction.into_text(), "I can't find it");
        Ok(())
    }

    #[test]
    fn model_failure_propagates() {
        let mut model = ScriptedModel::new("[0, 0]");
        model.fail = true;
        let mut grounder = Grounder::new(Box::new(model));
        assert!(grounder.predict(screenshot(8, 8), "x").is_err());
    }
}
