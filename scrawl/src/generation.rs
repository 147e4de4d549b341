use std::sync::Mutex;
use std::time::Instant;

use anyhow::anyhow;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};

use crate::errors::ModelRunError;
use crate::model::{ImageToTextModel, TokenDecoder};
use crate::preprocess::{prepare_rgb_image, ImageSource, DEFAULT_GENERATOR_INPUT_HW};
use crate::recognition::Recognition;

/// Default limit on the length of a generated sequence, including the
/// decoder start token and the end-of-sequence token.
pub const DEFAULT_MAX_TOKENS: usize = 20;

/// Configuration for a [TextGenerator].
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorConfig {
    /// Maximum length of a generated sequence, including the decoder start
    /// token.
    pub max_tokens: usize,

    /// Size of the image encoder's input, as (height, width).
    pub input_hw: [usize; 2],
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            max_tokens: DEFAULT_MAX_TOKENS,
            input_hw: DEFAULT_GENERATOR_INPUT_HW,
        }
    }
}

/// Pick the highest scoring token from a set of logits and return it along
/// with its log probability.
fn greedy_token(logits: &[f32]) -> Option<(u32, f32)> {
    let (token, &max) = logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    let sum_exp: f32 = logits.iter().map(|x| (x - max).exp()).sum();
    Some((token as u32, -sum_exp.ln()))
}

/// Recognizes text by generating it token by token with an encoder-decoder
/// model.
///
/// Decoding is greedy. A model instance holds the state of one sequence, so
/// concurrent calls are serialized.
pub struct TextGenerator {
    model: Mutex<Box<dyn ImageToTextModel>>,
    tokenizer: Box<dyn TokenDecoder>,
    config: GeneratorConfig,
}

impl TextGenerator {
    pub fn new<M: ImageToTextModel + 'static, T: TokenDecoder + 'static>(
        model: M,
        tokenizer: T,
        config: GeneratorConfig,
    ) -> anyhow::Result<TextGenerator> {
        if config.max_tokens < 2 {
            return Err(anyhow!(
                "max tokens must be at least 2 but is {}",
                config.max_tokens
            ));
        }
        Ok(TextGenerator {
            model: Mutex::new(Box::new(model)),
            tokenizer: Box::new(tokenizer),
            config,
        })
    }

    /// Return the size of input images as (width, height).
    pub fn input_size(&self) -> (usize, usize) {
        let [height, width] = self.config.input_hw;
        (width, height)
    }

    /// Prepare an image for input into the model. The result is a
    /// `[1, 3, height, width]` tensor.
    pub fn prepare_input(&self, image: ImageSource) -> anyhow::Result<NdTensor<f32, 4>> {
        prepare_rgb_image(image, self.config.input_hw)
    }

    /// Generate token IDs for a prepared image.
    ///
    /// Returns the generated tokens, without the decoder start token and
    /// end-of-sequence token, and the sum of their log probabilities.
    fn generate(&self, input: NdTensorView<f32, 4>) -> anyhow::Result<(Vec<u32>, f32)> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("generation model lock poisoned"))?;

        model.encode(input)?;

        let eos_token = model.eos_token_id();
        let mut tokens = vec![model.decoder_start_token_id()];
        let mut score = 0.;

        while tokens.len() < self.config.max_tokens {
            // After the first step, earlier positions are cached by the model
            // and only the newest token is passed.
            let start_pos = tokens.len() - 1;
            let logits = model.decode(&tokens[start_pos..], start_pos)?;
            let (token, log_prob) = greedy_token(&logits).ok_or_else(|| {
                ModelRunError::WrongOutput("decoder returned empty logits".to_string())
            })?;
            score += log_prob;
            if token == eos_token {
                break;
            }
            tokens.push(token);
        }

        tokens.remove(0);
        Ok((tokens, score))
    }

    /// Recognize the text in a prepared image.
    ///
    /// `input` is a `[1, 3, height, width]` tensor produced by
    /// [TextGenerator::prepare_input].
    pub fn recognize(&self, input: NdTensorView<f32, 4>) -> anyhow::Result<Recognition> {
        let [_, _, height, width] = input.shape();
        let [expected_height, expected_width] = self.config.input_hw;
        if input.shape() != [1, 3, expected_height, expected_width] {
            return Err(anyhow!(
                "input has shape {:?} but expected {:?}",
                input.shape(),
                [1, 3, expected_height, expected_width]
            ));
        }

        let start = Instant::now();
        let (tokens, score) = self.generate(input)?;
        tracing::debug!(
            height,
            width,
            tokens = tokens.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.,
            "generated tokens"
        );

        let text = self.tokenizer.decode(&tokens)?;
        Ok(Recognition {
            text,
            labels: tokens.into_iter().map(|token| token as usize).collect(),
            score,
        })
    }
}
