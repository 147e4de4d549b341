use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};
use serde_json::json;

use scrawl::{ModelKind, Recognition, RGB_NORM_MEAN, RGB_NORM_STD};

pub enum OutputFormat {
    /// Output the recognized text only.
    Text,

    /// Output the recognized text and its score in JSON format.
    Json,
}

/// Format a recognition result as plain text.
pub fn format_text_output(recognition: &Recognition) -> String {
    recognition.text.clone()
}

/// Format a recognition result as JSON.
pub fn format_json_output(recognition: &Recognition) -> Result<String, serde_json::Error> {
    let json_data = json!({
        "prediction": recognition.text,
        "score": recognition.score,
    });
    serde_json::to_string_pretty(&json_data)
}

/// Convert a prepared model input back into a CHW image with values in
/// [0, 1].
///
/// CTC inputs are `[1, width, height, 1]` greyscale tensors in the model's
/// reading orientation, which are turned upright again. Generation inputs are
/// `[1, 3, height, width]` tensors whose normalization is undone.
pub fn model_input_to_image(input: NdTensorView<f32, 4>, kind: ModelKind) -> NdTensor<f32, 3> {
    match kind {
        ModelKind::Ctc => {
            let [_, width, height, _] = input.shape();
            let mut image = NdTensor::zeros([1, height, width]);
            for y in 0..height {
                for x in 0..width {
                    image[[0, y, x]] = input[[0, x, height - 1 - y, 0]];
                }
            }
            image
        }
        ModelKind::TrOcr => {
            let [_, chans, height, width] = input.shape();
            let mut image = NdTensor::zeros([chans, height, width]);
            for c in 0..chans {
                for y in 0..height {
                    for x in 0..width {
                        image[[c, y, x]] = input[[0, c, y, x]] * RGB_NORM_STD + RGB_NORM_MEAN;
                    }
                }
            }
            image
        }
    }
}

/// Convert an HWC float tensor with values in the range [0, 1] to `Vec<u8>`
/// with values scaled to [0, 255].
pub fn image_from_tensor(tensor: NdTensorView<f32, 3>) -> Vec<u8> {
    tensor
        .iter()
        .map(|x| (x.clamp(0., 1.) * 255.0) as u8)
        .collect()
}
