use anyhow::{Result, anyhow};
use candle_core::{DType, Device, IndexOp, Shape, Tensor};
use image::DynamicImage;
use tracing::debug;

use crate::{
    chat_template::{ChatMessage, ContentPart},
    models::qwen2vl::config::PreprocessorConfig,
    utils::{ceil_by_factor, floor_by_factor, img_utils::to_rgb, round_by_factor},
};

const MAX_ASPECT_RATIO: f64 = 200.0;

/// Token-expanded prompt plus the pixel tensors the vision tower consumes.
#[derive(Clone)]
pub struct GeneralInput {
    pub replace_text: String,
    /// (total_patches, c * temporal_patch_size * patch_size^2)
    pub pixel_values: Option<Tensor>,
    /// (num_images, 3) u32 rows of `[grid_t, grid_h, grid_w]`
    pub image_grid_thw: Option<Tensor>,
}

pub struct Qwen2VLProcessor {
    cfg: PreprocessorConfig,
    device: Device,
    dtype: DType,
    image_token: String,
}

impl Qwen2VLProcessor {
    pub fn new(path: &str, device: &Device, dtype: DType) -> Result<Self> {
        let cfg_file = std::path::Path::new(path).join("preprocessor_config.json");
        let cfg = if cfg_file.exists() {
            serde_json::from_slice(&std::fs::read(&cfg_file)?)
                .map_err(|e| anyhow!("load preprocessor_config.json error: {}", e))?
        } else {
            debug!("preprocessor_config.json not found, using Qwen2-VL defaults");
            PreprocessorConfig::default()
        };
        Self::from_config(cfg, device, dtype)
    }

    pub fn from_config(cfg: PreprocessorConfig, device: &Device, dtype: DType) -> Result<Self> {
        if cfg.image_mean.len() != 3 || cfg.image_std.len() != 3 {
            return Err(anyhow!(
                "image_mean and image_std need 3 channels, got {} and {}",
                cfg.image_mean.len(),
                cfg.image_std.len()
            ));
        }
        Ok(Self {
            cfg,
            device: device.clone(),
            dtype,
            image_token: "<|image_pad|>".to_string(),
        })
    }

    pub fn config(&self) -> &PreprocessorConfig {
        &self.cfg
    }

    fn factor(&self) -> u32 {
        (self.cfg.patch_size * self.cfg.merge_size) as u32
    }

    /// Resizes, rescales and normalizes one image into a (1, c, h, w) f32 tensor.
    pub fn process_img(
        &self,
        img: &DynamicImage,
        min_pixels: u32,
        max_pixels: u32,
        img_mean: &Tensor,
        img_std: &Tensor,
    ) -> Result<Tensor> {
        let (resize_h, resize_w) = smart_resize(
            img.height(),
            img.width(),
            self.factor(),
            min_pixels,
            max_pixels,
        )?;
        let img = to_rgb(img).resize_exact(
            resize_w,
            resize_h,
            image::imageops::FilterType::CatmullRom,
        );
        let img_vec = img.to_rgb8().into_raw();
        // (h, w, c) -> (c, h, w)
        let img_tensor = Tensor::from_vec(
            img_vec,
            (resize_h as usize, resize_w as usize, 3),
            &self.device,
        )?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
        let img_tensor = img_tensor.affine(1.0 / 255.0, 0.)?;
        let img_tensor = img_tensor.broadcast_sub(img_mean)?.broadcast_div(img_std)?;
        Ok(img_tensor.unsqueeze(0)?)
    }

    /// Cuts a (t, c, h, w) clip into flattened patches ordered merge-window by merge-window.
    pub fn process_vision_tensor(&self, img_tensor: &Tensor) -> Result<(Tensor, [u32; 3])> {
        let temporal_patch_size = self.cfg.temporal_patch_size;
        let patch_size = self.cfg.patch_size;
        let merge_size = self.cfg.merge_size;
        let t = img_tensor.dim(0)?;
        // pad time with copies of the last frame
        let img_tensor = if t % temporal_patch_size != 0 {
            let repeat_num = temporal_patch_size - t % temporal_patch_size;
            let repeats = img_tensor.i(t - 1)?.unsqueeze(0)?.repeat((repeat_num, 1, 1, 1))?;
            Tensor::cat(&[img_tensor, &repeats], 0)?
        } else {
            img_tensor.clone()
        };
        let channel = img_tensor.dim(1)?;
        let grid_t = img_tensor.dim(0)? / temporal_patch_size;
        let grid_h = img_tensor.dim(2)? / patch_size;
        let grid_w = img_tensor.dim(3)? / patch_size;
        if grid_h % merge_size != 0 || grid_w % merge_size != 0 {
            return Err(anyhow!(
                "patch grid {}x{} is not divisible by merge_size {}",
                grid_h,
                grid_w,
                merge_size
            ));
        }
        let shape = Shape::from(vec![
            grid_t,
            temporal_patch_size,
            channel,
            grid_h / merge_size,
            merge_size,
            patch_size,
            grid_w / merge_size,
            merge_size,
            patch_size,
        ]);
        // -> (grid_t, grid_h / m, grid_w / m, m, m, c, temporal_patch_size, patch_size, patch_size)
        let img_tensor = img_tensor
            .reshape(shape)?
            .permute(vec![0, 3, 6, 4, 7, 2, 1, 5, 8])?;
        let img_tensor = img_tensor
            .reshape((
                grid_t * grid_h * grid_w,
                channel * temporal_patch_size * patch_size * patch_size,
            ))?
            .contiguous()?;
        Ok((img_tensor, [grid_t as u32, grid_h as u32, grid_w as u32]))
    }

    pub fn process_images(
        &self,
        images: &[(&DynamicImage, u32, u32)],
    ) -> Result<(Tensor, Tensor)> {
        let img_mean = Tensor::from_slice(self.cfg.image_mean.as_slice(), (3, 1, 1), &self.device)?;
        let img_std = Tensor::from_slice(self.cfg.image_std.as_slice(), (3, 1, 1), &self.device)?;
        let mut pixel_values_vec = Vec::with_capacity(images.len());
        let mut grid_thw_vec = Vec::with_capacity(images.len() * 3);
        for (img, min_pixels, max_pixels) in images {
            let img_tensor = self.process_img(img, *min_pixels, *max_pixels, &img_mean, &img_std)?;
            // a still image fills the temporal patch by repetition
            let img_tensor = img_tensor
                .repeat((self.cfg.temporal_patch_size, 1, 1, 1))?
                .contiguous()?;
            let (patches, grid_thw) = self.process_vision_tensor(&img_tensor)?;
            debug!(?grid_thw, "image patches prepared");
            pixel_values_vec.push(patches);
            grid_thw_vec.extend_from_slice(&grid_thw);
        }
        let pixel_values = Tensor::cat(&pixel_values_vec, 0)?.to_dtype(self.dtype)?;
        let grid_thw = Tensor::from_vec(grid_thw_vec, (images.len(), 3), &self.device)?;
        Ok((pixel_values, grid_thw))
    }

    /// Collects the image parts of `messages` and expands each `<|image_pad|>` in `text`
    /// to the number of merged patches its image produces.
    pub fn process_info(&self, messages: &[ChatMessage], text: &str) -> Result<GeneralInput> {
        let images: Vec<(&DynamicImage, u32, u32)> = messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|part| match part {
                ContentPart::Image {
                    image,
                    min_pixels,
                    max_pixels,
                } => Some((
                    image,
                    min_pixels.unwrap_or(self.cfg.min_pixels as u32),
                    max_pixels.unwrap_or(self.cfg.max_pixels as u32),
                )),
                ContentPart::Text { .. } => None,
            })
            .collect();
        if images.is_empty() {
            return Ok(GeneralInput {
                replace_text: text.to_string(),
                pixel_values: None,
                image_grid_thw: None,
            });
        }
        let (pixel_values, image_grid_thw) = self.process_images(&images)?;
        let replace_text = self.expand_image_tokens(text, &image_grid_thw.to_vec2::<u32>()?)?;
        Ok(GeneralInput {
            replace_text,
            pixel_values: Some(pixel_values),
            image_grid_thw: Some(image_grid_thw),
        })
    }

    pub fn expand_image_tokens(&self, text: &str, grid_thw: &[Vec<u32>]) -> Result<String> {
        let merge_length = self.cfg.merge_size.pow(2);
        let pieces: Vec<&str> = text.split(self.image_token.as_str()).collect();
        let n_tokens = pieces.len() - 1;
        if n_tokens != grid_thw.len() {
            return Err(anyhow!(
                "prompt has {} image tokens but {} images were given",
                n_tokens,
                grid_thw.len()
            ));
        }
        let mut expanded = String::with_capacity(text.len());
        for (i, piece) in pieces.iter().enumerate() {
            expanded.push_str(piece);
            if let Some(grid) = grid_thw.get(i) {
                let repeat_num = grid.iter().product::<u32>() as usize / merge_length;
                expanded.push_str(&self.image_token.repeat(repeat_num));
            }
        }
        Ok(expanded)
    }
}

/// Picks output dimensions that are multiples of `factor`, keep the aspect ratio
/// and land the pixel count inside `[min_pixels, max_pixels]`.
pub fn smart_resize(
    img_h: u32,
    img_w: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32)> {
    if img_h == 0 || img_w == 0 {
        return Err(anyhow!("image has zero size: {}x{}", img_w, img_h));
    }
    let ratio = img_h.max(img_w) as f64 / img_h.min(img_w) as f64;
    if ratio > MAX_ASPECT_RATIO {
        return Err(anyhow!(
            "absolute aspect ratio must be smaller than {}, got {:.2}",
            MAX_ASPECT_RATIO,
            ratio
        ));
    }
    let (h, w) = (img_h as f64, img_w as f64);
    let mut h_bar = factor.max(round_by_factor(h, factor));
    let mut w_bar = factor.max(round_by_factor(w, factor));
    let area = h_bar as u64 * w_bar as u64;
    if area > max_pixels as u64 {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = factor.max(floor_by_factor(h / beta, factor));
        w_bar = factor.max(floor_by_factor(w / beta, factor));
    } else if area < min_pixels as u64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = ceil_by_factor(h * beta, factor);
        w_bar = ceil_by_factor(w * beta, factor);
    }
    Ok((h_bar, w_bar))
}
