//! Decoding of request payloads into images.
//!
//! Images arrive as raw file bytes, as files on disk or as base64 strings.
//! Base64 input may use either the standard or the URL-safe alphabet, may
//! omit padding and may carry a `data:<mime>;base64,` header as produced by
//! browser APIs such as `canvas.toDataURL`.

use std::fs;
use std::path::Path;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use image::DynamicImage;
use thiserror::Error;

use crate::preprocess::ImageSourceError;

/// Standard alphabet decoder which accepts input with or without padding.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Errors that can occur when reading an input image.
#[derive(Debug, Error)]
pub enum ImageInputError {
    /// The payload contained no data.
    #[error("image data is empty")]
    Empty,

    /// The payload was not valid base64.
    #[error("invalid base64 image data: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The bytes could not be decoded as an image.
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    /// The decoded image has a layout that cannot be processed.
    #[error("unsupported image layout: {0}")]
    Pixels(#[from] ImageSourceError),

    /// Reading the image from disk failed.
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

impl ImageInputError {
    /// Return true if the error was caused by the supplied data rather than
    /// the environment.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ImageInputError::Io(_))
    }
}

/// Convert a base64 string into the form accepted by the standard alphabet
/// decoder.
///
/// This strips surrounding and embedded whitespace and any data URL header,
/// and maps the URL-safe characters `-` and `_` back to `+` and `/`.
pub fn normalize_base64(text: &str) -> String {
    let text = text.trim();
    let payload = match text.get(..5) {
        Some(scheme) if scheme.eq_ignore_ascii_case("data:") => text
            .split_once(',')
            .map(|(_header, payload)| payload)
            .unwrap_or(""),
        _ => text,
    };

    payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect()
}

/// Decode a base64 string in either alphabet into bytes.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, ImageInputError> {
    let normalized = normalize_base64(text);
    if normalized.is_empty() {
        return Err(ImageInputError::Empty);
    }
    let bytes = BASE64.decode(normalized)?;
    if bytes.is_empty() {
        return Err(ImageInputError::Empty);
    }
    Ok(bytes)
}

/// Decode an encoded image file (PNG, JPEG, WebP, GIF or BMP).
///
/// The format is determined from the content.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ImageInputError> {
    if bytes.is_empty() {
        return Err(ImageInputError::Empty);
    }
    Ok(image::load_from_memory(bytes)?)
}

/// Read and decode an image file.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage, ImageInputError> {
    let bytes = fs::read(path)?;
    decode_image(&bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;
    use image::{GrayImage, ImageFormat, Luma};

    use super::{decode_base64, decode_image, normalize_base64, ImageInputError};

    fn encode_png(image: &GrayImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_normalize_base64() {
        struct Case<'a> {
            input: &'a str,
            expected: &'a str,
        }

        let cases = [
            Case {
                input: "ab+/",
                expected: "ab+/",
            },
            Case {
                input: "ab-_",
                expected: "ab+/",
            },
            Case {
                input: "  ab\ncd\r\n",
                expected: "abcd",
            },
            Case {
                input: "data:image/png;base64,iVBOR-_w==",
                expected: "iVBOR+/w==",
            },
            Case {
                input: "DATA:image/jpeg;base64,abcd",
                expected: "abcd",
            },
            Case {
                input: "data:image/png;base64",
                expected: "",
            },
        ];

        for Case { input, expected } in cases {
            assert_eq!(normalize_base64(input), expected, "input {:?}", input);
        }
    }

    #[test]
    fn test_decode_url_safe_base64() {
        // Bytes chosen so the standard encoding contains both `+` and `/`.
        let bytes = [0xfb, 0xef, 0xff, 0x01, 0x02];
        let standard = STANDARD.encode(bytes);
        assert!(standard.contains('+') && standard.contains('/'));

        let url_safe = URL_SAFE_NO_PAD.encode(bytes);
        assert!(url_safe.contains('-') && url_safe.contains('_'));

        assert_eq!(decode_base64(&standard).unwrap(), bytes);
        assert_eq!(decode_base64(&url_safe).unwrap(), bytes);
    }

    #[test]
    fn test_decode_base64_errors() {
        assert!(matches!(decode_base64(""), Err(ImageInputError::Empty)));
        assert!(matches!(decode_base64("  \n"), Err(ImageInputError::Empty)));
        assert!(matches!(
            decode_base64("not*base64"),
            Err(ImageInputError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_image() {
        let image = GrayImage::from_pixel(7, 3, Luma([200]));
        let png = encode_png(&image);

        let decoded = decode_image(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (7, 3));

        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(&png));
        let decoded = decode_image(&decode_base64(&data_url).unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (7, 3));

        assert!(matches!(decode_image(&[]), Err(ImageInputError::Empty)));
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ImageInputError::Decode(_)));
        assert!(err.is_client_error());
    }
}
