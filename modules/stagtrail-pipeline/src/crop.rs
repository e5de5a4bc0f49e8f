//! Still-image decode and crop extraction for the embedding path.

use std::io::Cursor;

use image::DynamicImage;

use stagtrail_common::BBox;

/// Fixed padding applied around a detection box before embedding, clamped
/// to the image bounds.
pub const CROP_PADDING_PX: i32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum CropError {
    #[error("unreadable image: {0}")]
    Decode(String),

    #[error("detection box degenerate after clamping")]
    EmptyBox,

    #[error("crop encode failed: {0}")]
    Encode(String),
}

/// Decode image bytes, rejecting anything malformed up front so corrupt
/// files fail the image instead of the inference call.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, CropError> {
    image::load_from_memory(bytes).map_err(|e| CropError::Decode(e.to_string()))
}

/// Cut the padded detection box out of the image and re-encode it as PNG
/// bytes for the embedding engine.
pub fn crop_to_png(img: &DynamicImage, bbox: BBox) -> Result<Vec<u8>, CropError> {
    let padded = bbox.padded(CROP_PADDING_PX, img.width(), img.height());
    if padded.width <= 0 || padded.height <= 0 {
        return Err(CropError::EmptyBox);
    }

    let crop = img.crop_imm(
        padded.x as u32,
        padded.y as u32,
        padded.width as u32,
        padded.height as u32,
    );

    let mut out = Cursor::new(Vec::new());
    crop.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| CropError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(w, h, image::Rgb([120, 90, 60])))
    }

    #[test]
    fn crop_is_padded_and_clamped() {
        let img = solid_image(100, 80);
        let png = crop_to_png(&img, BBox::new(90, 70, 20, 20)).unwrap();
        let round = image::load_from_memory(&png).unwrap();
        // Box extends past the right/bottom edge; padding only applies on
        // the top-left side and the rest clamps.
        assert_eq!(round.width(), 100 - (90 - CROP_PADDING_PX) as u32);
        assert_eq!(round.height(), 80 - (70 - CROP_PADDING_PX) as u32);
    }

    #[test]
    fn degenerate_box_is_rejected() {
        let img = solid_image(50, 50);
        // Fully outside the image.
        let result = crop_to_png(&img, BBox::new(200, 200, -10, 10));
        assert!(matches!(result, Err(CropError::EmptyBox)));
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        assert!(matches!(decode(b"not an image"), Err(CropError::Decode(_))));
    }
}
