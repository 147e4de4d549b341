use anyhow::anyhow;

use rten_tensor::{NdTensorView, Tensor, TensorView};

/// Interface for running a text recognition model.
///
/// This is implemented for [rten::Model]. Other runtimes, or fakes in tests,
/// can implement it to be used with [TextRecognizer](crate::TextRecognizer).
pub trait Model: Send + Sync {
    /// Return the expected input shape as a mix of fixed and dynamic-sized
    /// dimensions.
    fn input_shape(&self) -> anyhow::Result<Vec<rten::Dimension>>;

    /// Run the model and return inference outputs.
    fn run(&self, input: TensorView<f32>) -> anyhow::Result<Tensor<f32>>;
}

impl Model for rten::Model {
    fn input_shape(&self) -> anyhow::Result<Vec<rten::Dimension>> {
        let input_id = self
            .input_ids()
            .first()
            .copied()
            .ok_or(anyhow!("model has no inputs"))?;
        let input_shape = self
            .node_info(input_id)
            .and_then(|info| info.shape())
            .ok_or(anyhow!("model does not specify expected input shape"))?;
        Ok(input_shape.into_iter().collect())
    }

    fn run(&self, input: TensorView<f32>) -> anyhow::Result<Tensor<f32>> {
        let output = self.run_one(input.into(), None)?.try_into()?;
        Ok(output)
    }
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn input_shape(&self) -> anyhow::Result<Vec<rten::Dimension>> {
        (**self).input_shape()
    }

    fn run(&self, input: TensorView<f32>) -> anyhow::Result<Tensor<f32>> {
        (**self).run(input)
    }
}

/// Interface for an encoder-decoder model which generates text tokens from
/// an image, such as TrOCR.
///
/// Models are stateful. [encode](ImageToTextModel::encode) starts a new
/// sequence and each following [decode](ImageToTextModel::decode) call
/// extends it by one step.
pub trait ImageToTextModel: Send {
    /// Token that every generated sequence starts with.
    fn decoder_start_token_id(&self) -> u32;

    /// Token that ends a generated sequence.
    fn eos_token_id(&self) -> u32;

    /// Encode a `[1, 3, height, width]` image and discard decoder state left
    /// over from the previous sequence.
    fn encode(&mut self, image: NdTensorView<f32, 4>) -> anyhow::Result<()>;

    /// Run the decoder on the tokens of the current sequence starting at
    /// position `start_pos`, and return the logits for the next token.
    ///
    /// Tokens before `start_pos` were passed to earlier calls, and the model
    /// may have cached their keys and values.
    fn decode(&mut self, tokens: &[u32], start_pos: usize) -> anyhow::Result<Vec<f32>>;
}

impl<M: ImageToTextModel + ?Sized> ImageToTextModel for Box<M> {
    fn decoder_start_token_id(&self) -> u32 {
        (**self).decoder_start_token_id()
    }

    fn eos_token_id(&self) -> u32 {
        (**self).eos_token_id()
    }

    fn encode(&mut self, image: NdTensorView<f32, 4>) -> anyhow::Result<()> {
        (**self).encode(image)
    }

    fn decode(&mut self, tokens: &[u32], start_pos: usize) -> anyhow::Result<Vec<f32>> {
        (**self).decode(tokens, start_pos)
    }
}

/// Converts token IDs produced by an [ImageToTextModel] into text.
pub trait TokenDecoder: Send + Sync {
    /// Decode a sequence of token IDs, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> anyhow::Result<String>;
}

impl<T: TokenDecoder + ?Sized> TokenDecoder for Box<T> {
    fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        (**self).decode(ids)
    }
}
