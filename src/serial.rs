//! Wire serialization for observations.
//!
//! Frames cross process boundaries as base64-encoded PNG ([`EncodedFrame`]),
//! both when a simulator server returns them and when the pool hands
//! observations to a trainer. [`SerializedObservation`] is the JSON-ready
//! mirror of [`Observation`].

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use serde::{Deserialize, Serialize};

use crate::env::observation::Observation;

/// A rendered frame in transit: PNG bytes, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedFrame {
    /// Image container format. Always `"png"` for frames we produce.
    pub format: String,
    pub width: u32,
    pub height: u32,
    /// Base64 (standard alphabet, padded) over the PNG byte stream.
    pub data: String,
}

/// A JSON-ready observation: prompt text plus encoded frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedObservation {
    pub text: String,
    pub image_placeholder: String,
    pub images: Vec<EncodedFrame>,
}

/// Encode a frame as base64 PNG.
pub fn encode_frame(frame: &RgbImage) -> Result<EncodedFrame> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(
            frame.as_raw(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .context("failed to encode frame as png")?;

    Ok(EncodedFrame {
        format: "png".to_string(),
        width: frame.width(),
        height: frame.height(),
        data: STANDARD.encode(&png),
    })
}

/// Decode a frame received over the wire.
///
/// The image payload is sniffed from its magic bytes, so a server that sends
/// another container format than it declares still decodes.
pub fn decode_frame(frame: &EncodedFrame) -> Result<RgbImage> {
    let bytes = STANDARD
        .decode(&frame.data)
        .context("frame payload is not valid base64")?;
    let image = image::load_from_memory(&bytes).context("failed to decode frame image")?;
    Ok(image.to_rgb8())
}

/// Convert an in-memory observation into its wire form.
pub fn serialize_observation(observation: &Observation) -> Result<SerializedObservation> {
    let images = observation
        .images
        .iter()
        .map(encode_frame)
        .collect::<Result<Vec<_>>>()?;
    Ok(SerializedObservation {
        text: observation.text.clone(),
        image_placeholder: observation.image_placeholder.to_string(),
        images,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::observation::IMAGE_PLACEHOLDER;

    fn checker_frame() -> RgbImage {
        RgbImage::from_fn(8, 6, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([200, 30, 30])
            } else {
                image::Rgb([30, 30, 200])
            }
        })
    }

    #[test]
    fn frame_survives_the_wire() {
        let frame = checker_frame();
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(encoded.format, "png");
        assert_eq!(encoded.width, 8);
        assert_eq!(encoded.height, 6);

        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_rejects_garbage() {
        let not_base64 = EncodedFrame {
            format: "png".into(),
            width: 8,
            height: 6,
            data: "!!not base64!!".into(),
        };
        assert!(decode_frame(&not_base64).is_err());

        let not_png = EncodedFrame {
            format: "png".into(),
            width: 8,
            height: 6,
            data: STANDARD.encode(b"plain text, no image header"),
        };
        assert!(decode_frame(&not_png).is_err());
    }

    #[test]
    fn observation_serializes_with_placeholder_and_frames() {
        let observation = Observation {
            text: format!("{IMAGE_PLACEHOLDER}\n instruction: test"),
            image_placeholder: IMAGE_PLACEHOLDER,
            images: vec![checker_frame(), checker_frame()],
        };

        let serialized = serialize_observation(&observation).unwrap();
        assert_eq!(serialized.image_placeholder, IMAGE_PLACEHOLDER);
        assert_eq!(serialized.images.len(), 2);

        let json = serde_json::to_value(&serialized).unwrap();
        assert_eq!(json["images"][0]["format"], "png");
        assert!(json["text"].as_str().unwrap().starts_with(IMAGE_PLACEHOLDER));
    }
}
