use std::time::Instant;

use anyhow::{Result, anyhow};
use image::{DynamicImage, ImageReader};
use tracing::info;

use crate::{
    exec::ExecModel,
    grounding::{Grounder, Prediction},
    utils::img_utils::get_image,
};

pub struct ShowUIExec;

fn open_image(image: &str) -> Result<DynamicImage> {
    if image.contains("://") || image.starts_with("data:") {
        return get_image(image);
    }
    ImageReader::open(image)
        .map_err(|e| anyhow!("failed to open {}: {}", image, e))?
        .decode()
        .map_err(|e| anyhow!("failed to decode {}: {}", image, e))
}

impl ExecModel for ShowUIExec {
    fn run(image: &str, query: &str, output: Option<&str>, weight_path: &str) -> Result<()> {
        let screenshot = open_image(image)?;

        let start = Instant::now();
        let mut grounder = Grounder::load(weight_path, None, None)?;
        info!("model loaded in {:.2?}", start.elapsed());

        let prediction = grounder.predict(screenshot, query)?;
        if let Prediction::RawFallback(_) = &prediction {
            info!("model reply is not a coordinate pair, printing it as is");
        }
        let text = prediction.into_text();
        println!("{}", text);

        if let Some(out) = output {
            std::fs::write(out, &text)?;
            info!("output saved to {}", out);
        }
        Ok(())
    }
}
