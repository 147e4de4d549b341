//! Server configuration from command line flags and environment variables.

use scrawl::{
    DecodeMethod, GeneratorConfig, LabelScheme, ModelKind, OutputActivation, OutputLayout,
    RecognizerConfig, DEFAULT_MAX_TOKENS, DEFAULT_TROCR_MODEL,
};

/// Address the server listens on by default.
pub const DEFAULT_ADDR: &str = "0.0.0.0:8711";

/// Default limit on request body size.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Beam width used when `--beam` is enabled.
const BEAM_WIDTH: u32 = 100;

const MODEL_KIND_ENV: &str = "SCRAWL_MODEL_KIND";
const MODEL_ENV: &str = "SCRAWL_MODEL";
const REVISION_ENV: &str = "SCRAWL_MODEL_REVISION";
const VOCAB_ENV: &str = "SCRAWL_VOCAB";
const ADDR_ENV: &str = "SCRAWL_ADDR";
const MAX_BODY_ENV: &str = "SCRAWL_MAX_BODY_BYTES";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub model_kind: ModelKind,

    /// Path or URL of a CTC model, or hub ID or directory of a TrOCR model.
    pub model: String,

    /// Hub revision of a TrOCR model.
    pub revision: Option<String>,

    /// Path to the vocabulary file. Set for CTC models only.
    pub vocabulary: Option<String>,

    /// Socket address to listen on.
    pub addr: String,

    /// Maximum size of a request body in bytes.
    pub max_body_bytes: usize,

    pub recognizer: RecognizerConfig,

    pub generator: GeneratorConfig,
}

fn parse_max_body(value: &str, source: &str) -> Result<usize, lexopt::Error> {
    value
        .parse()
        .map_err(|err| format!("invalid value \"{}\" for {}: {}", value, source, err).into())
}

impl ServerConfig {
    /// Read configuration from the process arguments, falling back to
    /// environment variables for values not given as flags.
    pub fn from_env() -> Result<ServerConfig, lexopt::Error> {
        Self::parse(lexopt::Parser::from_env(), |key| std::env::var(key).ok())
    }

    /// Read configuration from a parser, using `env` to look up fallback
    /// values.
    pub fn parse<E: Fn(&str) -> Option<String>>(
        mut parser: lexopt::Parser,
        env: E,
    ) -> Result<ServerConfig, lexopt::Error> {
        use lexopt::prelude::*;

        let mut addr = None;
        let mut max_body_bytes = None;
        let mut model = None;
        let mut model_kind: Option<ModelKind> = None;
        let mut revision = None;
        let mut vocabulary = None;
        let mut recognizer = RecognizerConfig::default();
        let mut generator = GeneratorConfig::default();

        while let Some(arg) = parser.next()? {
            match arg {
                Long("addr") => {
                    addr = Some(parser.value()?.string()?);
                }
                Long("beam") => {
                    recognizer.decode_method = DecodeMethod::BeamSearch { width: BEAM_WIDTH };
                }
                Long("blank-first") => {
                    recognizer.label_scheme = LabelScheme::BlankFirst;
                }
                Long("log-probs") => {
                    recognizer.output_activation = OutputActivation::LogProbabilities;
                }
                Long("max-body-bytes") => {
                    let value = parser.value()?.string()?;
                    max_body_bytes = Some(parse_max_body(&value, "--max-body-bytes")?);
                }
                Long("max-len") => {
                    let len: usize = parser.value()?.parse()?;
                    recognizer.max_len = if len == 0 { None } else { Some(len) };
                }
                Long("max-tokens") => {
                    generator.max_tokens = parser.value()?.parse()?;
                }
                Long("model") => {
                    model = Some(parser.value()?.string()?);
                }
                Long("model-kind") => {
                    model_kind = Some(parser.value()?.parse()?);
                }
                Long("revision") => {
                    revision = Some(parser.value()?.string()?);
                }
                Long("seq-first") => {
                    recognizer.output_layout = OutputLayout::SeqBatchClass;
                }
                Long("vocab") => {
                    vocabulary = Some(parser.value()?.string()?);
                }
                Long("help") => {
                    println!(
                        "Serve handwritten text recognition over HTTP.

Usage: {bin_name} --model <path-or-url> --vocab <path> [OPTIONS]
       {bin_name} --model-kind trocr [--model <hub-id-or-dir>] [OPTIONS]

Options:

  --model-kind <ctc|trocr>   [env: {MODEL_KIND_ENV}, default: ctc]

    Kind of recognition model. CTC models need a vocabulary. TrOCR models
    are fetched from the Hugging Face hub.

  --model <path-or-url>   [env: {MODEL_ENV}]

    Text recognition model. URLs are downloaded once and cached. For TrOCR
    this is a hub repository ID or a local directory, and defaults to
    {DEFAULT_TROCR_MODEL}.

  --vocab <path>   [env: {VOCAB_ENV}]

    Vocabulary file the CTC model was trained with.

  --revision <rev>   [env: {REVISION_ENV}]

    Hub revision of the TrOCR model.

  --addr <host:port>   [env: {ADDR_ENV}, default: {DEFAULT_ADDR}]

    Address to listen on.

  --max-body-bytes <n>   [env: {MAX_BODY_ENV}, default: {DEFAULT_MAX_BODY_BYTES}]

    Maximum size of a request body.

Advanced options:

  --beam

    Use beam search for decoding.

  --blank-first

    The model uses class 0 for the CTC blank.

  --log-probs

    The model outputs log probabilities.

  --max-len <n>

    Maximum number of characters to output (0 for no limit).

  --max-tokens <n>   [default: {DEFAULT_MAX_TOKENS}]

    Maximum length of a TrOCR token sequence.

  --seq-first

    The model output has shape [sequence, batch, class].
",
                        bin_name = parser.bin_name().unwrap_or("scrawl-server"),
                    );
                    std::process::exit(0);
                }
                _ => return Err(arg.unexpected()),
            }
        }

        let model_kind = match model_kind {
            Some(kind) => kind,
            None => match env(MODEL_KIND_ENV) {
                Some(value) => value
                    .parse::<ModelKind>()
                    .map_err(|err| format!("invalid {}: {}", MODEL_KIND_ENV, err))?,
                None => ModelKind::Ctc,
            },
        };
        let model = model.or_else(|| env(MODEL_ENV));
        let vocabulary = vocabulary.or_else(|| env(VOCAB_ENV));
        let (model, vocabulary) = match model_kind {
            ModelKind::Ctc => {
                let model =
                    model.ok_or(format!("missing `--model` arg or {} variable", MODEL_ENV))?;
                let vocabulary =
                    vocabulary.ok_or(format!("missing `--vocab` arg or {} variable", VOCAB_ENV))?;
                (model, Some(vocabulary))
            }
            ModelKind::TrOcr => (
                model.unwrap_or_else(|| DEFAULT_TROCR_MODEL.to_string()),
                None,
            ),
        };
        let revision = revision.or_else(|| env(REVISION_ENV));
        let addr = addr
            .or_else(|| env(ADDR_ENV))
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let max_body_bytes = match max_body_bytes {
            Some(size) => size,
            None => match env(MAX_BODY_ENV) {
                Some(value) => parse_max_body(&value, MAX_BODY_ENV)?,
                None => DEFAULT_MAX_BODY_BYTES,
            },
        };

        Ok(ServerConfig {
            model_kind,
            model,
            revision,
            vocabulary,
            addr,
            max_body_bytes,
            recognizer,
            generator,
        })
    }
}
