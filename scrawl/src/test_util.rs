use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use rten::Dimension;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView, Tensor, TensorView};

use crate::model::{ImageToTextModel, Model, TokenDecoder};
use crate::recognition::{OutputActivation, OutputLayout};
use crate::vocabulary::{LabelScheme, Vocabulary};

pub const FAKE_INPUT_WIDTH: usize = 128;
pub const FAKE_INPUT_HEIGHT: usize = 32;

/// Width of the input columns that map to one output timestep.
pub const FAKE_DOWNSAMPLE: usize = 4;

/// Vocabulary with 29 tokens, for use with the default [FakeRecognitionModel],
/// which emits 32 classes.
pub fn fake_vocabulary() -> Vocabulary {
    Vocabulary::parse("a b c d e f g h i j k l m n o p q r s t u v w x y z ! ? .").unwrap()
}

/// Create a `[1, width, height, 1]` model input for a [FakeRecognitionModel].
///
/// Each `(start, end, class)` span sets row `class` of the input to 1 for
/// the columns that make up timesteps `start..end` of the output.
pub fn fake_input(spans: &[(usize, usize, usize)]) -> NdTensor<f32, 4> {
    let mut input = NdTensor::zeros([1, FAKE_INPUT_WIDTH, FAKE_INPUT_HEIGHT, 1]);
    for &(start, end, class) in spans {
        for x in start * FAKE_DOWNSAMPLE..end * FAKE_DOWNSAMPLE {
            input[[0, x, class, 0]] = 1.;
        }
    }
    input
}

/// Fake text recognition model.
///
/// This takes an NHWC input with C=1 and returns an output with shape
/// `[N, W / 4, H]`. Each group of 4 input columns is treated as a one-hot
/// vector of class probabilities. Groups containing no value above 0.5
/// produce the CTC blank.
pub struct FakeRecognitionModel {
    input_shape: Vec<Dimension>,
    label_scheme: LabelScheme,
    output_layout: OutputLayout,
    output_activation: OutputActivation,
}

impl FakeRecognitionModel {
    pub fn new() -> FakeRecognitionModel {
        FakeRecognitionModel {
            input_shape: vec![
                Dimension::Symbolic("batch".to_string()),
                Dimension::Fixed(FAKE_INPUT_WIDTH),
                Dimension::Fixed(FAKE_INPUT_HEIGHT),
                Dimension::Fixed(1),
            ],
            label_scheme: LabelScheme::StringLookup,
            output_layout: OutputLayout::BatchSeqClass,
            output_activation: OutputActivation::Probabilities,
        }
    }

    pub fn with_input_shape(mut self, shape: Vec<Dimension>) -> Self {
        self.input_shape = shape;
        self
    }

    pub fn with_label_scheme(mut self, scheme: LabelScheme) -> Self {
        self.label_scheme = scheme;
        self
    }

    pub fn with_output_layout(mut self, layout: OutputLayout) -> Self {
        self.output_layout = layout;
        self
    }

    pub fn with_output_activation(mut self, activation: OutputActivation) -> Self {
        self.output_activation = activation;
        self
    }
}

impl Model for FakeRecognitionModel {
    fn input_shape(&self) -> anyhow::Result<Vec<Dimension>> {
        Ok(self.input_shape.clone())
    }

    fn run(&self, input: TensorView<f32>) -> anyhow::Result<Tensor<f32>> {
        let input: NdTensor<f32, 4> = input
            .to_tensor()
            .try_into()
            .map_err(|_| anyhow!("expected 4D input"))?;
        let [batch, width, height, _] = input.shape();
        let seq_len = width / FAKE_DOWNSAMPLE;
        let class_count = height;
        let blank = self.label_scheme.blank_class(class_count);

        let (on, off) = match self.output_activation {
            OutputActivation::Probabilities => (1., 0.),
            OutputActivation::LogProbabilities => (0., -100.),
        };

        let mut output = NdTensor::full([batch, seq_len, class_count], off);
        for n in 0..batch {
            for t in 0..seq_len {
                let mut best: Option<(usize, f32)> = None;
                for class in 0..class_count {
                    let value = (t * FAKE_DOWNSAMPLE..(t + 1) * FAKE_DOWNSAMPLE)
                        .map(|x| input[[n, x, class, 0]])
                        .fold(f32::NEG_INFINITY, f32::max);
                    if value > 0.5 && best.map_or(true, |(_, best_value)| value > best_value) {
                        best = Some((class, value));
                    }
                }
                let class = best.map(|(class, _)| class).unwrap_or(blank);
                output[[n, t, class]] = on;
            }
        }

        if self.output_layout == OutputLayout::SeqBatchClass {
            output.permute([1, 0, 2]);
        }

        Ok(output.to_tensor().into())
    }
}

pub const FAKE_START_TOKEN: u32 = 0;
pub const FAKE_EOS_TOKEN: u32 = 27;

/// Number of logits returned by [FakeGenerationModel] for each step.
const FAKE_TOKEN_COUNT: usize = 28;

/// Fake encoder-decoder model which generates a scripted token sequence,
/// followed by [FAKE_EOS_TOKEN] once the script runs out.
///
/// The arguments of each `decode` call are recorded, see
/// [FakeGenerationModel::calls].
pub struct FakeGenerationModel {
    script: Vec<u32>,
    step: Option<usize>,
    calls: Arc<Mutex<Vec<(Vec<u32>, usize)>>>,
}

impl FakeGenerationModel {
    pub fn new(script: &[u32]) -> FakeGenerationModel {
        FakeGenerationModel {
            script: script.to_vec(),
            step: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Return a handle to the `(tokens, start_pos)` arguments of `decode`
    /// calls.
    pub fn calls(&self) -> Arc<Mutex<Vec<(Vec<u32>, usize)>>> {
        self.calls.clone()
    }
}

impl ImageToTextModel for FakeGenerationModel {
    fn decoder_start_token_id(&self) -> u32 {
        FAKE_START_TOKEN
    }

    fn eos_token_id(&self) -> u32 {
        FAKE_EOS_TOKEN
    }

    fn encode(&mut self, image: NdTensorView<f32, 4>) -> anyhow::Result<()> {
        if image.size(1) != 3 {
            return Err(anyhow!("expected RGB input"));
        }
        self.step = Some(0);
        Ok(())
    }

    fn decode(&mut self, tokens: &[u32], start_pos: usize) -> anyhow::Result<Vec<f32>> {
        let step = self.step.ok_or(anyhow!("decode called before encode"))?;
        if start_pos != step {
            return Err(anyhow!("expected start position {} but got {}", step, start_pos));
        }
        self.calls
            .lock()
            .map_err(|_| anyhow!("lock poisoned"))?
            .push((tokens.to_vec(), start_pos));

        let token = self.script.get(step).copied().unwrap_or(FAKE_EOS_TOKEN);
        self.step = Some(step + 1);

        let mut logits = vec![0.; FAKE_TOKEN_COUNT];
        logits[token as usize] = 10.;
        Ok(logits)
    }
}

/// Tokenizer for [FakeGenerationModel] which maps tokens 1 to 26 to the
/// letters "a" to "z" and skips all others.
pub struct FakeTokenizer;

impl TokenDecoder for FakeTokenizer {
    fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        Ok(ids
            .iter()
            .filter(|&&id| (1..=26).contains(&id))
            .map(|&id| char::from(b'a' + (id - 1) as u8))
            .collect())
    }
}
