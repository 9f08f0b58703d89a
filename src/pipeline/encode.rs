//! Image encoding: `DynamicImage` → base64 PNG.
//!
//! Every backend accepts images as base64 embedded in a JSON body (Gemini
//! `inline_data`, OpenAI-style `data:` URLs, edgequake-llm `ImageData`). PNG
//! is lossless, and crisp digits matter far more than payload size when the
//! model has to tell an 8 from a 3 in a dollar amount.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// A rendered page ready to attach to a backend request.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    /// 1-based page number in the source document.
    pub page: usize,
    pub data_b64: String,
    pub mime_type: &'static str,
}

impl PageImage {
    /// `data:` URL form used by OpenAI-compatible APIs.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_b64)
    }

    /// Raw PNG bytes, for backends that need a file (local OCR).
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data_b64)
    }
}

/// Encode a rasterised page as a base64 PNG.
pub fn encode_page(page: usize, img: &DynamicImage) -> Result<PageImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let data_b64 = STANDARD.encode(&buf);
    debug!("Encoded page {} → {} bytes base64", page, data_b64.len());

    Ok(PageImage {
        page,
        data_b64,
        mime_type: "image/png",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(3, &img).expect("encode should succeed");
        assert_eq!(data.page, 3);
        assert_eq!(data.mime_type, "image/png");
        let decoded = data.decode().expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
        assert!(data.data_url().starts_with("data:image/png;base64,"));
    }
}
