use std::path::Path;
use std::time::Instant;

use anyhow::anyhow;
use image::DynamicImage;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};

mod errors;
mod generation;
pub mod image_input;
mod model;
mod models;
mod preprocess;
mod recognition;
mod trocr;
mod vocabulary;

#[cfg(test)]
mod test_util;

use image_input::{decode_base64, decode_image, load_image, ImageInputError};

pub use errors::{ModelRunError, PredictError};
pub use generation::{GeneratorConfig, TextGenerator, DEFAULT_MAX_TOKENS};
pub use model::{ImageToTextModel, Model, TokenDecoder};
pub use models::{load_model, ModelKind, ModelSource, CACHE_DIR_ENV};
pub use preprocess::{
    pad_geometry, prepare_rgb_image, DimOrder, ImagePixels, ImageSource, ImageSourceError,
    PadGeometry, DEFAULT_GENERATOR_INPUT_HW, DEFAULT_INPUT_HEIGHT, DEFAULT_INPUT_WIDTH,
    RGB_NORM_MEAN, RGB_NORM_STD,
};
pub use recognition::{
    DecodeMethod, OutputActivation, OutputLayout, Recognition, RecognizerConfig, TextRecognizer,
    DEFAULT_MAX_LEN,
};
pub use trocr::{
    load_trocr, TrOcrFiles, TrOcrModel, TrOcrTokenizer, DEFAULT_TROCR_MODEL, DEFAULT_TROCR_REVISION,
};
pub use vocabulary::{LabelScheme, Vocabulary, VocabularyError, UNKNOWN_TOKEN};

/// Configuration for an [HtrEngine] instance.
///
/// An engine uses either a CTC `recognition_model` with its `vocabulary`, or
/// a `generation_model` with its `tokenizer`.
#[derive(Default)]
pub struct HtrEngineParams {
    /// CTC model used to recognize handwritten text.
    pub recognition_model: Option<Box<dyn Model>>,

    /// Vocabulary the recognition model was trained with.
    pub vocabulary: Option<Vocabulary>,

    /// Options for preparing model inputs and decoding outputs.
    pub recognizer: RecognizerConfig,

    /// Encoder-decoder model which generates text tokens.
    pub generation_model: Option<Box<dyn ImageToTextModel>>,

    /// Tokenizer which converts the generation model's tokens to text.
    pub tokenizer: Option<Box<dyn TokenDecoder>>,

    /// Options for the generation model.
    pub generator: GeneratorConfig,
}

enum Recognizer {
    Ctc(TextRecognizer),
    Generator(TextGenerator),
}

/// Recognizes handwritten text in images.
///
/// An engine is created once, with the model and vocabulary loaded, and can
/// then be shared between threads to serve any number of predictions.
pub struct HtrEngine {
    recognizer: Recognizer,
}

/// Input image for recognition. Instances are created using
/// [HtrEngine::prepare_input].
pub struct HtrInput {
    /// `[1, width, height, 1]` greyscale tensor with pixel values in [0, 1]
    /// for CTC models, or a `[1, 3, height, width]` RGB tensor with values in
    /// [-1, 1] for generation models.
    pub(crate) image: NdTensor<f32, 4>,
}

impl HtrInput {
    /// Return the tensor that is passed to the recognition model.
    pub fn tensor(&self) -> NdTensorView<'_, f32, 4> {
        self.image.view()
    }
}

impl HtrEngine {
    /// Construct a new engine from a given configuration.
    pub fn new(params: HtrEngineParams) -> anyhow::Result<HtrEngine> {
        let recognizer = match params.generation_model {
            Some(model) => {
                if params.recognition_model.is_some() {
                    return Err(anyhow!("Recognition and generation models are both set"));
                }
                let tokenizer = params.tokenizer.ok_or(anyhow!("Tokenizer not loaded"))?;
                Recognizer::Generator(TextGenerator::new(model, tokenizer, params.generator)?)
            }
            None => {
                let model = params
                    .recognition_model
                    .ok_or(anyhow!("Recognition model not loaded"))?;
                let vocabulary = params.vocabulary.ok_or(anyhow!("Vocabulary not loaded"))?;
                Recognizer::Ctc(TextRecognizer::from_model(model, vocabulary, params.recognizer)?)
            }
        };
        Ok(HtrEngine { recognizer })
    }

    /// Return the kind of model the engine runs.
    pub fn kind(&self) -> ModelKind {
        match &self.recognizer {
            Recognizer::Ctc(_) => ModelKind::Ctc,
            Recognizer::Generator(_) => ModelKind::TrOcr,
        }
    }

    /// Return the size of model input images as (width, height).
    pub fn input_size(&self) -> (usize, usize) {
        match &self.recognizer {
            Recognizer::Ctc(recognizer) => recognizer.input_size(),
            Recognizer::Generator(generator) => generator.input_size(),
        }
    }

    /// Return the vocabulary of a CTC model.
    pub fn vocabulary(&self) -> Option<&Vocabulary> {
        match &self.recognizer {
            Recognizer::Ctc(recognizer) => Some(recognizer.vocabulary()),
            Recognizer::Generator(_) => None,
        }
    }

    /// Preprocess an image for use with other methods of the engine.
    ///
    /// For CTC models the image is converted to greyscale, resized to fit the
    /// model's input size without distortion, padded and rotated into the
    /// orientation the model reads. For generation models it is converted to
    /// RGB and stretched to the encoder's input size.
    pub fn prepare_input(&self, image: ImageSource) -> anyhow::Result<HtrInput> {
        let image = match &self.recognizer {
            Recognizer::Ctc(recognizer) => recognizer.prepare_input(image)?,
            Recognizer::Generator(generator) => generator.prepare_input(image)?,
        };
        Ok(HtrInput { image })
    }

    /// Recognize the text in a prepared image.
    pub fn recognize(&self, input: &HtrInput) -> anyhow::Result<Recognition> {
        match &self.recognizer {
            Recognizer::Ctc(recognizer) => recognizer.recognize(input.image.clone()),
            Recognizer::Generator(generator) => generator.recognize(input.image.view()),
        }
    }

    /// Recognize the text in several prepared images.
    ///
    /// CTC models process the images in one model run. Generation models
    /// process them one at a time.
    pub fn recognize_batch(&self, inputs: &[HtrInput]) -> anyhow::Result<Vec<Recognition>> {
        match &self.recognizer {
            Recognizer::Ctc(recognizer) => recognizer
                .recognize_batch(inputs.iter().map(|input| input.image.clone()).collect()),
            Recognizer::Generator(generator) => inputs
                .iter()
                .map(|input| generator.recognize(input.image.view()))
                .collect(),
        }
    }

    /// Convenience API that returns only the recognized text of an image.
    pub fn get_text(&self, input: &HtrInput) -> anyhow::Result<String> {
        Ok(self.recognize(input)?.text)
    }

    /// Preprocess a decoded image, as [HtrEngine::prepare_input] does.
    pub fn prepare_image(&self, image: &DynamicImage) -> Result<HtrInput, PredictError> {
        let input = if image.color().has_color() {
            let rgb = image.to_rgb8();
            let source = ImageSource::from_bytes(rgb.as_raw(), rgb.dimensions())
                .map_err(ImageInputError::from)?;
            self.prepare_input(source)?
        } else {
            let luma = image.to_luma8();
            let source = ImageSource::from_bytes(luma.as_raw(), luma.dimensions())
                .map_err(ImageInputError::from)?;
            self.prepare_input(source)?
        };
        Ok(input)
    }

    /// Prepare a decoded image and recognize the text in it.
    pub fn predict_image(&self, image: &DynamicImage) -> Result<Recognition, PredictError> {
        let start = Instant::now();
        let input = self.prepare_image(image)?;
        let recognition = self.recognize(&input)?;

        tracing::debug!(
            width = image.width(),
            height = image.height(),
            chars = recognition.labels.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.,
            "recognized image"
        );

        Ok(recognition)
    }

    /// Decode an encoded image file (PNG, JPEG, ...) and recognize the text
    /// in it.
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Recognition, PredictError> {
        let image = decode_image(bytes)?;
        self.predict_image(&image)
    }

    /// Decode a base64-encoded image file and recognize the text in it.
    ///
    /// See [image_input::normalize_base64] for the accepted encodings.
    pub fn predict_base64(&self, image_base64: &str) -> Result<Recognition, PredictError> {
        let bytes = decode_base64(image_base64)?;
        self.predict_bytes(&bytes)
    }

    /// Read an image file and recognize the text in it.
    pub fn predict_path<P: AsRef<Path>>(&self, path: P) -> Result<Recognition, PredictError> {
        let image = load_image(path)?;
        self.predict_image(&image)
    }
}

/// Load a model, then recognize the text in a base64-encoded image.
///
/// With a vocabulary, `model_reference` names a CTC model as a file path or an
/// HTTP(S) URL, see [ModelSource::parse]. Without one, it names a TrOCR model
/// as a hub repository ID or a local directory, see [TrOcrFiles::locate].
///
/// This loads everything from scratch on each call. Use [HtrEngine] directly
/// to make several predictions with the same model.
pub fn predict(
    image_base64: &str,
    model_reference: &str,
    vocabulary_path: Option<&str>,
) -> anyhow::Result<String> {
    let params = match vocabulary_path {
        Some(vocabulary_path) => HtrEngineParams {
            recognition_model: Some(Box::new(load_model(ModelSource::parse(model_reference))?)),
            vocabulary: Some(Vocabulary::from_file(vocabulary_path)?),
            ..Default::default()
        },
        None => {
            let (model, tokenizer) = load_trocr(model_reference, None)?;
            HtrEngineParams {
                generation_model: Some(Box::new(model)),
                tokenizer: Some(Box::new(tokenizer)),
                ..Default::default()
            }
        }
    };
    let engine = HtrEngine::new(params)?;
    let recognition = engine.predict_base64(image_base64)?;
    Ok(recognition.text)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
    use rten_tensor::prelude::*;

    use super::{HtrEngine, HtrEngineParams, ModelKind, PredictError};
    use crate::image_input::ImageInputError;
    use crate::test_util::{
        fake_vocabulary, FakeGenerationModel, FakeRecognitionModel, FakeTokenizer, FAKE_EOS_TOKEN,
    };

    fn fake_engine() -> HtrEngine {
        HtrEngine::new(HtrEngineParams {
            recognition_model: Some(Box::new(FakeRecognitionModel::new())),
            vocabulary: Some(fake_vocabulary()),
            ..Default::default()
        })
        .unwrap()
    }

    /// Generate a 128x32 image that the fake recognition model reads as "hi".
    ///
    /// The fake model emits class `31 - y` for a white pixel in row `y`, and
    /// each group of 4 columns forms one timestep.
    fn gen_test_image() -> GrayImage {
        let mut image = GrayImage::new(128, 32);
        for x in 0..20 {
            image.put_pixel(x, 31 - 8, Luma([255]));
        }
        for x in 20..40 {
            image.put_pixel(x, 31 - 9, Luma([255]));
        }
        image
    }

    /// Create an engine whose generation model reads "ok" in every image.
    fn fake_generation_engine() -> HtrEngine {
        HtrEngine::new(HtrEngineParams {
            generation_model: Some(Box::new(FakeGenerationModel::new(&[15, 11, FAKE_EOS_TOKEN]))),
            tokenizer: Some(Box::new(FakeTokenizer)),
            ..Default::default()
        })
        .unwrap()
    }

    fn encode_png(image: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_engine_requires_model_and_vocabulary() {
        let err = HtrEngine::new(HtrEngineParams {
            vocabulary: Some(fake_vocabulary()),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "Recognition model not loaded");

        let err = HtrEngine::new(HtrEngineParams {
            recognition_model: Some(Box::new(FakeRecognitionModel::new())),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "Vocabulary not loaded");
    }

    #[test]
    fn test_engine_prepare_input() {
        let engine = fake_engine();
        assert_eq!(engine.kind(), ModelKind::Ctc);
        assert_eq!(engine.vocabulary().map(|v| v.len()), Some(29));
        let image = gen_test_image();
        let source = crate::ImageSource::from_bytes(image.as_raw(), image.dimensions()).unwrap();
        let input = engine.prepare_input(source).unwrap();

        let (width, height) = engine.input_size();
        assert_eq!(input.tensor().shape(), [1, width, height, 1]);
        assert_eq!(engine.get_text(&input).unwrap(), "hi");
    }

    #[test]
    fn test_engine_predict_image() {
        let engine = fake_engine();

        let grey = DynamicImage::ImageLuma8(gen_test_image());
        assert_eq!(engine.predict_image(&grey).unwrap().text, "hi");

        // Color images are converted to greyscale first.
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_fn(128, 32, |x, y| {
            let value = gen_test_image().get_pixel(x, y)[0];
            Rgb([value, value, value])
        }));
        assert_eq!(engine.predict_image(&rgb).unwrap().text, "hi");
    }

    #[test]
    fn test_engine_predict_bytes_and_base64() {
        let engine = fake_engine();
        let png = encode_png(&DynamicImage::ImageLuma8(gen_test_image()));

        assert_eq!(engine.predict_bytes(&png).unwrap().text, "hi");

        let url_safe = URL_SAFE.encode(&png);
        assert_eq!(engine.predict_base64(&url_safe).unwrap().text, "hi");

        let data_url = format!("data:image/png;base64,{}", url_safe);
        assert_eq!(engine.predict_base64(&data_url).unwrap().text, "hi");
    }

    #[test]
    fn test_engine_predict_blank_image() {
        let engine = fake_engine();
        let blank = DynamicImage::ImageLuma8(GrayImage::new(300, 40));
        assert_eq!(engine.predict_image(&blank).unwrap().text, "");
    }

    #[test]
    fn test_engine_predict_invalid_input() {
        let engine = fake_engine();

        let err = engine.predict_bytes(b"").unwrap_err();
        assert!(matches!(err, PredictError::Input(ImageInputError::Empty)));
        assert!(err.is_client_error());

        let err = engine.predict_bytes(b"GIF89a but not really").unwrap_err();
        assert!(err.is_client_error());

        let err = engine.predict_base64("%%%").unwrap_err();
        assert!(matches!(
            err,
            PredictError::Input(ImageInputError::Base64(_))
        ));
        assert!(err.is_client_error());

        let err = engine.predict_path("does/not/exist.png").unwrap_err();
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_engine_predict_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("word.png");
        gen_test_image().save(&path).unwrap();

        let engine = fake_engine();
        assert_eq!(engine.predict_path(&path).unwrap().text, "hi");
    }

    #[test]
    fn test_engine_recognize_batch() {
        let engine = fake_engine();
        let image = gen_test_image();
        let blank = GrayImage::new(64, 16);

        let inputs: Vec<_> = [&image, &blank]
            .into_iter()
            .map(|img| {
                let source =
                    crate::ImageSource::from_bytes(img.as_raw(), img.dimensions()).unwrap();
                engine.prepare_input(source).unwrap()
            })
            .collect();
        let texts: Vec<_> = engine
            .recognize_batch(&inputs)
            .unwrap()
            .into_iter()
            .map(|r| r.text)
            .collect();
        assert_eq!(texts, ["hi", ""]);
    }

    #[test]
    fn test_engine_requires_tokenizer_for_generation() {
        let err = HtrEngine::new(HtrEngineParams {
            generation_model: Some(Box::new(FakeGenerationModel::new(&[]))),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "Tokenizer not loaded");

        let err = HtrEngine::new(HtrEngineParams {
            recognition_model: Some(Box::new(FakeRecognitionModel::new())),
            vocabulary: Some(fake_vocabulary()),
            generation_model: Some(Box::new(FakeGenerationModel::new(&[]))),
            tokenizer: Some(Box::new(FakeTokenizer)),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert_eq!(
            err.to_string(),
            "Recognition and generation models are both set"
        );
    }

    #[test]
    fn test_generation_engine_predict() {
        let engine = fake_generation_engine();
        assert_eq!(engine.kind(), ModelKind::TrOcr);
        assert_eq!(engine.input_size(), (384, 384));
        assert!(engine.vocabulary().is_none());

        let grey = DynamicImage::ImageLuma8(gen_test_image());
        let input = engine.prepare_image(&grey).unwrap();
        assert_eq!(input.tensor().shape(), [1, 3, 384, 384]);

        let png = encode_png(&grey);
        assert_eq!(engine.predict_bytes(&png).unwrap().text, "ok");

        // The model restarts its sequence for each image.
        let rgb = DynamicImage::ImageRgb8(RgbImage::new(50, 20));
        assert_eq!(engine.predict_image(&rgb).unwrap().text, "ok");

        let inputs = [engine.prepare_image(&rgb).unwrap(), input];
        let texts: Vec<_> = engine
            .recognize_batch(&inputs)
            .unwrap()
            .into_iter()
            .map(|r| r.text)
            .collect();
        assert_eq!(texts, ["ok", "ok"]);
    }
}
