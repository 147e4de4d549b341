use std::time::Instant;

use anyhow::anyhow;
use rayon::prelude::*;
use rten::ctc::{CtcDecoder, CtcHypothesis};
use rten::{thread_pool, Dimension};
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, Tensor};

use crate::errors::ModelRunError;
use crate::model::Model;
use crate::preprocess::{
    prepare_image, resize_with_pad, to_model_input, ImageSource, DEFAULT_INPUT_HEIGHT,
    DEFAULT_INPUT_WIDTH,
};
use crate::vocabulary::{LabelScheme, Vocabulary};

/// Default limit on the number of labels kept from a decoded sequence.
pub const DEFAULT_MAX_LEN: usize = 21;

/// Offset added to probabilities before taking the log, so that zero
/// probabilities produce a finite score.
const LOG_EPSILON: f32 = 1e-7;

/// Method used to decode sequence model outputs to a sequence of labels.
///
/// See [CtcDecoder] for more details.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum DecodeMethod {
    #[default]
    Greedy,
    BeamSearch {
        width: u32,
    },
}

/// Order of dimensions in the recognition model's output.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum OutputLayout {
    /// `[batch, sequence, class]`, as produced by Keras models.
    #[default]
    BatchSeqClass,

    /// `[sequence, batch, class]`, as produced by PyTorch CTC models.
    SeqBatchClass,
}

/// Kind of values in the recognition model's output.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum OutputActivation {
    /// Softmax probabilities.
    #[default]
    Probabilities,

    /// Log-softmax outputs.
    LogProbabilities,
}

/// Options which control how a [TextRecognizer] prepares inputs and
/// interprets outputs.
#[derive(Clone, Debug)]
pub struct RecognizerConfig {
    /// How model classes map to vocabulary tokens.
    pub label_scheme: LabelScheme,

    /// Method used to decode character sequence outputs to labels.
    pub decode_method: DecodeMethod,

    /// Maximum number of labels kept from a decoded sequence, or `None` to
    /// keep all of them.
    pub max_len: Option<usize>,

    pub output_layout: OutputLayout,

    pub output_activation: OutputActivation,

    /// Input image size as (width, height), used when the model does not
    /// specify fixed dimensions.
    pub input_size: (usize, usize),
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        RecognizerConfig {
            label_scheme: LabelScheme::default(),
            decode_method: DecodeMethod::default(),
            max_len: Some(DEFAULT_MAX_LEN),
            output_layout: OutputLayout::default(),
            output_activation: OutputActivation::default(),
            input_size: (DEFAULT_INPUT_WIDTH, DEFAULT_INPUT_HEIGHT),
        }
    }
}

/// Text recognized in a single image.
#[derive(Clone, Debug, PartialEq)]
pub struct Recognition {
    /// Decoded text.
    pub text: String,

    /// Model class labels of the decoded characters, after truncation to the
    /// maximum length. For generation models these are token IDs.
    pub labels: Vec<usize>,

    /// Score of the decoded hypothesis, as reported by the CTC decoder. For
    /// generation models this is the log probability of the generated tokens.
    pub score: f32,
}

/// Recognizes the text in images of single handwritten words or lines.
pub struct TextRecognizer {
    model: Box<dyn Model>,
    vocabulary: Vocabulary,
    config: RecognizerConfig,
    input_width: usize,
    input_height: usize,
}

impl TextRecognizer {
    /// Initialize a text recognizer from a trained model. Fails if the model
    /// does not have the expected input layout.
    ///
    /// The model is expected to take an NHWC input where the sequence axis
    /// comes first, ie. `[batch, width, height, 1]`.
    pub fn from_model<M: Model + 'static>(
        model: M,
        vocabulary: Vocabulary,
        config: RecognizerConfig,
    ) -> anyhow::Result<TextRecognizer> {
        let input_shape = model.input_shape()?;
        let [_batch, width, height, channels]: [Dimension; 4] =
            input_shape.try_into().map_err(|shape: Vec<Dimension>| {
                anyhow!(
                    "recognition model input has {} dims but expected 4",
                    shape.len()
                )
            })?;

        if let Dimension::Fixed(channels) = channels {
            if channels != 1 {
                return Err(anyhow!(
                    "recognition model expects {} input channels but only greyscale is supported",
                    channels
                ));
            }
        }

        let (default_width, default_height) = config.input_size;
        let input_width = match width {
            Dimension::Fixed(size) => size,
            Dimension::Symbolic(_) => default_width,
        };
        let input_height = match height {
            Dimension::Fixed(size) => size,
            Dimension::Symbolic(_) => default_height,
        };

        Ok(TextRecognizer {
            model: Box::new(model),
            vocabulary,
            config,
            input_width,
            input_height,
        })
    }

    /// Return the size of input images as (width, height).
    pub fn input_size(&self) -> (usize, usize) {
        (self.input_width, self.input_height)
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Prepare an image for input into the recognition model.
    ///
    /// The result is a `[1, width, height, 1]` tensor. This method exists for
    /// model debugging purposes to expose the preprocessing that
    /// [TextRecognizer::recognize] expects to have been applied.
    pub fn prepare_input(&self, image: ImageSource) -> anyhow::Result<NdTensor<f32, 4>> {
        let grey = prepare_image(image);
        let padded = resize_with_pad(&grey, [self.input_height, self.input_width])?;
        Ok(to_model_input(padded.view()))
    }

    /// Run text recognition on an NHWC batch of images, and return a
    /// `[batch, seq, class]` tensor of model outputs.
    fn run(&self, input: NdTensor<f32, 4>) -> Result<NdTensor<f32, 3>, ModelRunError> {
        let input: Tensor<f32> = input.into();
        let output = self
            .model
            .run(input.view())
            .map_err(|err| ModelRunError::RunFailed(err.into()))?;

        let output_ndim = output.ndim();
        let mut rec_sequence: NdTensor<f32, 3> = output.try_into().map_err(|_| {
            ModelRunError::WrongOutput(format!(
                "expected recognition output to have 3 dims but it has {}",
                output_ndim
            ))
        })?;

        if self.config.output_layout == OutputLayout::SeqBatchClass {
            // Transpose from [seq, batch, class] => [batch, seq, class]
            rec_sequence.permute([1, 0, 2]);
        }

        Ok(rec_sequence)
    }

    /// Recognize the text in a single prepared image.
    ///
    /// `input` is a `[1, width, height, 1]` tensor produced by
    /// [TextRecognizer::prepare_input].
    pub fn recognize(&self, input: NdTensor<f32, 4>) -> anyhow::Result<Recognition> {
        self.recognize_batch(vec![input])?
            .pop()
            .ok_or(anyhow!("recognition produced no output"))
    }

    /// Recognize the text in a batch of prepared images.
    ///
    /// The images are run through the model as a single batch, then the
    /// output sequences are decoded in parallel. Results are returned in the
    /// same order as `inputs`.
    pub fn recognize_batch(
        &self,
        inputs: Vec<NdTensor<f32, 4>>,
    ) -> anyhow::Result<Vec<Recognition>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let item_shape = [1, self.input_width, self.input_height, 1];
        let batch_size = inputs.len();
        let mut batch_data = Vec::with_capacity(batch_size * self.input_width * self.input_height);
        for (index, input) in inputs.iter().enumerate() {
            if input.shape() != item_shape {
                return Err(anyhow!(
                    "input {} has shape {:?} but expected {:?}",
                    index,
                    input.shape(),
                    item_shape
                ));
            }
            batch_data.extend(input.iter().copied());
        }
        let batch = NdTensor::from_data(
            [batch_size, self.input_width, self.input_height, 1],
            batch_data,
        );

        let start = Instant::now();
        let rec_output = self.run(batch)?;
        tracing::debug!(
            batch_size,
            output_shape = ?rec_output.shape(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.,
            "ran recognition model"
        );

        let [output_batch, _seq, class_count] = rec_output.shape();
        if output_batch != batch_size {
            return Err(ModelRunError::WrongOutput(format!(
                "output batch size ({}) does not match input batch size ({})",
                output_batch, batch_size
            ))
            .into());
        }

        let expected_classes = self.config.label_scheme.class_count(&self.vocabulary);
        if class_count != expected_classes {
            return Err(ModelRunError::WrongOutput(format!(
                "output class count ({}) does not match vocabulary size ({}), expected {} classes",
                class_count,
                self.vocabulary.len(),
                expected_classes
            ))
            .into());
        }

        let results: Vec<Recognition> = thread_pool().run(|| {
            (0..batch_size)
                .into_par_iter()
                .map(|index| self.decode(&rec_output, index))
                .collect()
        });

        Ok(results)
    }

    /// Decode the output sequence for one item in a batch.
    fn decode(&self, rec_output: &NdTensor<f32, 3>, batch_index: usize) -> Recognition {
        let ctc_input = self.ctc_input(rec_output, batch_index);
        let blank = self.blank_class(rec_output.size(2));

        let decoder = CtcDecoder::new();
        let hypothesis: CtcHypothesis = match self.config.decode_method {
            DecodeMethod::Greedy => decoder.decode_greedy(ctc_input.view()),
            DecodeMethod::BeamSearch { width } => decoder.decode_beam(ctc_input.view(), width),
        };

        let mut labels: Vec<usize> = hypothesis
            .steps()
            .iter()
            .map(|step| decoder_label_to_class(step.label as usize, blank))
            .collect();
        if let Some(max_len) = self.config.max_len {
            labels.truncate(max_len);
        }

        let text = labels
            .iter()
            .map(|&label| self.vocabulary.label_text(label))
            .collect();

        Recognition {
            text,
            labels,
            score: hypothesis.score(),
        }
    }

    fn blank_class(&self, class_count: usize) -> usize {
        self.config.label_scheme.blank_class(class_count)
    }

    /// Extract the `[seq, class]` matrix for one batch item and convert it to
    /// the form the CTC decoder expects: log probabilities with the blank
    /// in column 0.
    fn ctc_input(&self, rec_output: &NdTensor<f32, 3>, batch_index: usize) -> NdTensor<f32, 2> {
        let [_, seq_len, class_count] = rec_output.shape();
        let blank = self.blank_class(class_count);
        let activation = self.config.output_activation;

        let mut ctc_input = NdTensor::zeros([seq_len, class_count]);
        for t in 0..seq_len {
            for class in 0..class_count {
                let value = rec_output[[batch_index, t, class]];
                let log_prob = match activation {
                    OutputActivation::Probabilities => (value + LOG_EPSILON).ln(),
                    OutputActivation::LogProbabilities => value,
                };
                ctc_input[[t, class_to_decoder_label(class, blank)]] = log_prob;
            }
        }
        ctc_input
    }
}

/// Map a model class to the label used by [CtcDecoder], which reserves
/// label 0 for the blank.
fn class_to_decoder_label(class: usize, blank: usize) -> usize {
    if class == blank {
        0
    } else if class < blank {
        class + 1
    } else {
        class
    }
}

/// Inverse of [class_to_decoder_label] for non-blank labels.
fn decoder_label_to_class(label: usize, blank: usize) -> usize {
    if label <= blank {
        label - 1
    } else {
        label
    }
}
