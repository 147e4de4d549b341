//! TrOCR text generation using candle, with weights from the Hugging Face
//! hub.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{trocr, vit};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use rten_tensor::prelude::*;
use rten_tensor::NdTensorView;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::model::{ImageToTextModel, TokenDecoder};

/// Hub repository of the default TrOCR model.
pub const DEFAULT_TROCR_MODEL: &str = "microsoft/trocr-base-handwritten";

/// Revision of [DEFAULT_TROCR_MODEL] that has weights in safetensors format.
pub const DEFAULT_TROCR_REVISION: &str = "refs/pr/3";

/// Hub repository with a `tokenizer.json` for the TrOCR decoder vocabulary.
const TOKENIZER_REPO: &str = "ToluClassics/candle-trocr-tokenizer";

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Deserialize)]
struct TrOcrConfig {
    encoder: vit::Config,
    decoder: trocr::TrOCRConfig,
}

/// Local paths of the files that make up a TrOCR model.
#[derive(Clone, Debug, PartialEq)]
pub struct TrOcrFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

impl TrOcrFiles {
    /// Use the `config.json`, `model.safetensors` and `tokenizer.json` files
    /// in `dir`.
    pub fn from_dir(dir: &Path) -> TrOcrFiles {
        TrOcrFiles {
            config: dir.join(CONFIG_FILE),
            weights: dir.join(WEIGHTS_FILE),
            tokenizer: dir.join(TOKENIZER_FILE),
        }
    }

    /// Download a model from the Hugging Face hub, or reuse the copy in the
    /// local hub cache.
    pub fn from_hub(model_id: &str, revision: &str) -> anyhow::Result<TrOcrFiles> {
        let api = ApiBuilder::new()
            .with_progress(false)
            .build()
            .context("Failed to initialize Hugging Face API")?;

        tracing::info!(model_id, revision, "fetching model from hub");
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        let config = repo
            .get(CONFIG_FILE)
            .with_context(|| format!("Failed to fetch {} from {}", CONFIG_FILE, model_id))?;
        let weights = repo
            .get(WEIGHTS_FILE)
            .with_context(|| format!("Failed to fetch {} from {}", WEIGHTS_FILE, model_id))?;
        let tokenizer = api
            .model(TOKENIZER_REPO.to_string())
            .get(TOKENIZER_FILE)
            .with_context(|| {
                format!("Failed to fetch {} from {}", TOKENIZER_FILE, TOKENIZER_REPO)
            })?;

        Ok(TrOcrFiles {
            config,
            weights,
            tokenizer,
        })
    }

    /// Resolve a model reference, which is either a local directory or a
    /// hub repository ID.
    ///
    /// `revision` defaults to [DEFAULT_TROCR_REVISION] for
    /// [DEFAULT_TROCR_MODEL] and to "main" for other repositories.
    pub fn locate(reference: &str, revision: Option<&str>) -> anyhow::Result<TrOcrFiles> {
        let path = Path::new(reference);
        if path.is_dir() {
            return Ok(TrOcrFiles::from_dir(path));
        }
        let revision = revision.unwrap_or(if reference == DEFAULT_TROCR_MODEL {
            DEFAULT_TROCR_REVISION
        } else {
            "main"
        });
        TrOcrFiles::from_hub(reference, revision)
    }
}

/// TrOCR encoder-decoder model running on the CPU.
pub struct TrOcrModel {
    model: trocr::TrOCRModel,
    decoder_config: trocr::TrOCRConfig,
    device: Device,
    encoder_output: Option<Tensor>,
}

impl TrOcrModel {
    /// Load the model from a `config.json` file with `encoder` and `decoder`
    /// sections, and a safetensors weights file.
    pub fn load(config_path: &Path, weights_path: &Path) -> anyhow::Result<TrOcrModel> {
        let device = Device::Cpu;

        let config_file = File::open(config_path)
            .with_context(|| format!("Failed to open \"{}\"", config_path.display()))?;
        let config: TrOcrConfig = serde_json::from_reader(BufReader::new(config_file))
            .with_context(|| format!("Failed to parse \"{}\"", config_path.display()))?;

        // The weights file must not be modified while it is mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)?
        };
        let model = trocr::TrOCRModel::new(&config.encoder, &config.decoder, vb)?;
        tracing::debug!(path = %weights_path.display(), "loaded TrOCR model");

        Ok(TrOcrModel {
            model,
            decoder_config: config.decoder,
            device,
            encoder_output: None,
        })
    }
}

impl ImageToTextModel for TrOcrModel {
    fn decoder_start_token_id(&self) -> u32 {
        self.decoder_config.decoder_start_token_id
    }

    fn eos_token_id(&self) -> u32 {
        self.decoder_config.eos_token_id
    }

    fn encode(&mut self, image: NdTensorView<f32, 4>) -> anyhow::Result<()> {
        self.model.reset_kv_cache();
        self.encoder_output = None;

        let [batch, chans, height, width] = image.shape();
        let pixels = Tensor::from_vec(
            image.to_vec(),
            (batch, chans, height, width),
            &self.device,
        )?;
        self.encoder_output = Some(self.model.encoder().forward(&pixels)?);
        Ok(())
    }

    fn decode(&mut self, tokens: &[u32], start_pos: usize) -> anyhow::Result<Vec<f32>> {
        let encoder_output = self
            .encoder_output
            .as_ref()
            .ok_or(anyhow!("decode called before encode"))?;

        let input_ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.decode(&input_ids, encoder_output, start_pos)?;
        let logits = logits.squeeze(0)?;
        let logits = logits.get(logits.dim(0)? - 1)?;
        Ok(logits.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

/// Tokenizer for TrOCR decoder outputs.
pub struct TrOcrTokenizer(Tokenizer);

impl TrOcrTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<TrOcrTokenizer> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|err| anyhow!("Failed to load tokenizer: {}", err))?;
        Ok(TrOcrTokenizer(tokenizer))
    }
}

impl TokenDecoder for TrOcrTokenizer {
    fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.0
            .decode(ids, true)
            .map_err(|err| anyhow!("Failed to decode tokens: {}", err))
    }
}

/// Load a TrOCR model and its tokenizer.
///
/// See [TrOcrFiles::locate] for the accepted references.
pub fn load_trocr(
    reference: &str,
    revision: Option<&str>,
) -> anyhow::Result<(TrOcrModel, TrOcrTokenizer)> {
    let files = TrOcrFiles::locate(reference, revision)?;
    let tokenizer = TrOcrTokenizer::from_file(&files.tokenizer)?;
    let model = TrOcrModel::load(&files.config, &files.weights)?;
    Ok((model, tokenizer))
}
