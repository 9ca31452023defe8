use std::io::Cursor;

use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose};
use image::{DynamicImage, ImageReader, Rgb, RgbImage};

use crate::utils::get_file_path;

pub fn load_image_from_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| anyhow!("failed to read image format: {}", e))?
        .decode()
        .map_err(|e| anyhow!("failed to decode image: {}", e))
}

/// Blocking fetch, call it off the async runtime.
pub fn load_image_from_url(url: &str) -> Result<DynamicImage> {
    let response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| anyhow!("failed to fetch image from url: {}", e))?;
    let bytes = response
        .bytes()
        .map_err(|e| anyhow!("failed to get image bytes: {}", e))?;
    load_image_from_bytes(&bytes)
}

pub fn load_image_from_base64(base64_data: &str) -> Result<DynamicImage> {
    let image_data = general_purpose::STANDARD
        .decode(base64_data.trim())
        .map_err(|e| anyhow!("failed to decode base64 image: {}", e))?;
    load_image_from_bytes(&image_data)
}

/// Resolves an `http(s)://` url, a `file://` url or a `data:image/...;base64,` url.
pub fn get_image(file: &str) -> Result<DynamicImage> {
    if file.starts_with("http://") || file.starts_with("https://") {
        return load_image_from_url(file);
    }
    if file.starts_with("file://") {
        let path = get_file_path(file)?;
        return ImageReader::open(&path)
            .map_err(|e| anyhow!("failed to open {}: {}", path.display(), e))?
            .decode()
            .map_err(|e| anyhow!("failed to decode image: {}", e));
    }
    if file.starts_with("data:image") {
        return get_image_from_data_url(file);
    }
    Err(anyhow!("unsupported image reference: {:.64}", file))
}

/// Accepts only inline `data:image/...;base64,` urls. Never touches the filesystem or network.
pub fn get_image_from_data_url(url: &str) -> Result<DynamicImage> {
    match url
        .strip_prefix("data:image/")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        Some((_, data)) => load_image_from_base64(data),
        None => Err(anyhow!("image must be a data:image/...;base64, url")),
    }
}

/// Drops the alpha channel by compositing onto white.
pub fn to_rgb(img: &DynamicImage) -> DynamicImage {
    if !img.color().has_alpha() {
        return DynamicImage::ImageRgb8(img.to_rgb8());
    }
    let rgba = img.to_rgba8();
    let rgb = RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as f32 / 255.0;
        let blend = |c: u8| (c as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        Rgb([blend(r), blend(g), blend(b)])
    });
    DynamicImage::ImageRgb8(rgb)
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;

    fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }

    #[test]
    fn transparent_pixels_become_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 0])));
        assert_eq!(to_rgb(&img).to_rgb8().get_pixel(0, 0).0, [255, 255, 255]);
        let opaque = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([9, 8, 7, 255])));
        assert_eq!(to_rgb(&opaque).to_rgb8().get_pixel(0, 0).0, [9, 8, 7]);
    }

    #[test]
    fn data_url_decodes() -> Result<()> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])));
        let url = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(png_bytes(&img)?)
        );
        let decoded = get_image(&url)?;
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        let decoded = get_image_from_data_url(&url)?;
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        Ok(())
    }

    #[test]
    fn inline_only_loader_refuses_references() {
        for url in [
            "file:///etc/hosts",
            "http://127.0.0.1/a.png",
            "https://example.com/a.png",
            "data:text/plain;base64,aGk=",
            "data:image/png,raw",
        ] {
            assert!(get_image_from_data_url(url).is_err(), "{url}");
        }
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(load_image_from_bytes(b"not an image").is_err());
        assert!(get_image("ftp://example.com/a.png").is_err());
    }
}
