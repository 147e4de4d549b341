use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, BufWriter};

use rten_tensor::prelude::*;
use rten_tensor::NdTensorView;
use scrawl::{
    load_model, load_trocr, DecodeMethod, GeneratorConfig, HtrEngine, HtrEngineParams, LabelScheme,
    ModelKind, ModelSource, OutputActivation, OutputLayout, RecognizerConfig, Vocabulary,
    DEFAULT_MAX_LEN, DEFAULT_MAX_TOKENS, DEFAULT_TROCR_MODEL,
};
use tracing_subscriber::EnvFilter;

mod output;
use output::{
    format_json_output, format_text_output, image_from_tensor, model_input_to_image, OutputFormat,
};

/// Beam width used when `--beam` is enabled.
const BEAM_WIDTH: u32 = 100;

/// Write a CHW image to a PNG file in `path`.
fn write_image(path: &str, img: NdTensorView<f32, 3>) -> Result<(), Box<dyn Error>> {
    let [chans, img_height, img_width] = img.shape();
    let color_type = match chans {
        1 => png::ColorType::Grayscale,
        3 => png::ColorType::Rgb,
        _ => return Err("Unsupported channel count".into()),
    };

    let hwc_img = img.permuted([1, 2, 0]); // CHW => HWC

    let out_img = image_from_tensor(hwc_img);
    let file = fs::File::create(path)?;
    let writer = BufWriter::new(file);
    let mut encoder = png::Encoder::new(writer, img_width as u32, img_height as u32);
    encoder.set_color(color_type);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&out_img)?;

    Ok(())
}

/// Where the image to recognize comes from.
enum ImageArg {
    /// Base64-encoded image file contents.
    Base64(String),

    /// Read base64-encoded image from stdin.
    Stdin,

    /// Path to an image file.
    Path(String),
}

struct Args {
    model_kind: ModelKind,

    /// Path to the vocabulary file. Only used by CTC models.
    vocabulary: Option<String>,

    /// Path or URL of a CTC model, or hub ID or directory of a TrOCR model.
    model: String,

    /// Hub revision of a TrOCR model.
    revision: Option<String>,

    /// Maximum length of a generated token sequence.
    max_tokens: usize,

    image: ImageArg,

    /// Enable debug output.
    debug: bool,

    output_format: OutputFormat,

    /// Output file path. Defaults to stdout.
    output_path: Option<String>,

    /// Path to write the preprocessed model input to.
    dump_input_path: Option<String>,

    /// Use beam search for sequence decoding.
    beam_search: bool,

    /// Maximum number of characters to output, or `None` for no limit.
    max_len: Option<usize>,

    label_scheme: LabelScheme,
    output_layout: OutputLayout,
    output_activation: OutputActivation,
}

fn parse_args(mut parser: lexopt::Parser) -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values = VecDeque::new();
    let mut beam_search = false;
    let mut debug = false;
    let mut dump_input_path = None;
    let mut image_path = None;
    let mut label_scheme = LabelScheme::StringLookup;
    let mut max_len = Some(DEFAULT_MAX_LEN);
    let mut max_tokens = DEFAULT_MAX_TOKENS;
    let mut model_kind = ModelKind::Ctc;
    let mut output_activation = OutputActivation::Probabilities;
    let mut output_format = OutputFormat::Text;
    let mut output_layout = OutputLayout::BatchSeqClass;
    let mut output_path = None;
    let mut revision = None;
    let mut trocr_model = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push_back(val.string()?),
            Long("beam") => {
                beam_search = true;
            }
            Long("blank-first") => {
                label_scheme = LabelScheme::BlankFirst;
            }
            Long("debug") => {
                debug = true;
            }
            Long("dump-input") => {
                dump_input_path = Some(parser.value()?.string()?);
            }
            Short('i') | Long("image") => {
                image_path = Some(parser.value()?.string()?);
            }
            Short('j') | Long("json") => {
                output_format = OutputFormat::Json;
            }
            Long("log-probs") => {
                output_activation = OutputActivation::LogProbabilities;
            }
            Long("max-len") => {
                let len: usize = parser.value()?.parse()?;
                max_len = if len == 0 { None } else { Some(len) };
            }
            Long("max-tokens") => {
                max_tokens = parser.value()?.parse()?;
            }
            Long("model-kind") => {
                model_kind = parser.value()?.parse()?;
            }
            Short('o') | Long("output") => {
                output_path = Some(parser.value()?.string()?);
            }
            Long("revision") => {
                revision = Some(parser.value()?.string()?);
            }
            Long("seq-first") => {
                output_layout = OutputLayout::SeqBatchClass;
            }
            Long("trocr-model") => {
                trocr_model = Some(parser.value()?.string()?);
            }
            Long("help") => {
                println!(
                    "Recognize handwritten text in an image.

Usage: {bin_name} [OPTIONS] <vocabulary> <model> [<base64-image>]
       {bin_name} --model-kind trocr [OPTIONS] [<base64-image>]

The model may be a file path or an http(s) URL. URLs are downloaded once and
cached. Use \"-\" as <base64-image> to read the image from stdin.

Options:

  --model-kind <ctc|trocr>

    Kind of recognition model (default ctc). CTC models need a vocabulary.
    TrOCR models are fetched from the Hugging Face hub.

  --trocr-model <hub-id-or-dir>

    TrOCR model to use (default {trocr_model}).

  --revision <rev>

    Hub revision of the TrOCR model.

  --debug

    Enable debug output.

  --dump-input <path>

    Save the preprocessed model input as a PNG image.

  -i, --image <path>

    Read the image from a file instead of a base64 argument.

  -j, --json

    Output text and score in JSON format.

  -o, --output <path>

    Output file path (defaults to stdout)

Advanced options:

  --beam

    Use beam search for decoding.

  --blank-first

    The model uses class 0 for the CTC blank and classes 1..=N for tokens.

  --log-probs

    The model outputs log probabilities instead of probabilities.

  --max-len <n>

    Maximum number of characters to output (default {max_len}, 0 for no limit).

  --max-tokens <n>

    Maximum length of a TrOCR token sequence (default {max_tokens}).

  --seq-first

    The model output has shape [sequence, batch, class].
",
                    bin_name = parser.bin_name().unwrap_or("scrawl"),
                    max_len = DEFAULT_MAX_LEN,
                    max_tokens = DEFAULT_MAX_TOKENS,
                    trocr_model = DEFAULT_TROCR_MODEL,
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let (vocabulary, model) = match model_kind {
        ModelKind::Ctc => {
            if trocr_model.is_some() {
                return Err("`--trocr-model` requires `--model-kind trocr`".into());
            }
            let vocabulary = values.pop_front().ok_or("missing `<vocabulary>` arg")?;
            let model = values.pop_front().ok_or("missing `<model>` arg")?;
            (Some(vocabulary), model)
        }
        ModelKind::TrOcr => (
            None,
            trocr_model.unwrap_or_else(|| DEFAULT_TROCR_MODEL.to_string()),
        ),
    };
    let image = match (values.pop_front(), image_path) {
        (Some(_), Some(_)) => {
            return Err("`<base64-image>` and `--image` cannot be used together".into())
        }
        (Some(value), None) if value == "-" => ImageArg::Stdin,
        (Some(value), None) => ImageArg::Base64(value),
        (None, Some(path)) => ImageArg::Path(path),
        (None, None) => return Err("missing `<base64-image>` arg".into()),
    };

    Ok(Args {
        beam_search,
        debug,
        dump_input_path,
        image,
        label_scheme,
        max_len,
        max_tokens,
        model,
        model_kind,
        output_activation,
        output_format,
        output_layout,
        output_path,
        revision,
        vocabulary,
    })
}

/// Adds context to an error reading or parsing a file.
trait FileErrorContext<T> {
    /// If `self` represents a failed operation to read a file, convert the
    /// error to a message of the form "{context} from {path}: {original_error}".
    fn file_error_context<P: fmt::Display>(self, context: &str, path: P) -> Result<T, String>;
}

impl<T, E: std::fmt::Display> FileErrorContext<T> for Result<T, E> {
    fn file_error_context<P: fmt::Display>(self, context: &str, path: P) -> Result<T, String> {
        self.map_err(|err| format!("{} from \"{}\": {}", context, path, err))
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scrawl={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args(lexopt::Parser::from_env())?;
    init_logging(args.debug);

    let params = match &args.vocabulary {
        Some(vocab_path) => {
            let vocabulary = Vocabulary::from_file(vocab_path)
                .file_error_context("Failed to load vocabulary", vocab_path)?;

            let model_src = ModelSource::parse(&args.model);
            let model = load_model(model_src)
                .file_error_context("Failed to load text recognition model", model_src)?;

            HtrEngineParams {
                recognition_model: Some(Box::new(model)),
                vocabulary: Some(vocabulary),
                recognizer: RecognizerConfig {
                    label_scheme: args.label_scheme,
                    decode_method: if args.beam_search {
                        DecodeMethod::BeamSearch { width: BEAM_WIDTH }
                    } else {
                        DecodeMethod::Greedy
                    },
                    max_len: args.max_len,
                    output_layout: args.output_layout,
                    output_activation: args.output_activation,
                    ..Default::default()
                },
                ..Default::default()
            }
        }
        None => {
            let (model, tokenizer) = load_trocr(&args.model, args.revision.as_deref())
                .file_error_context("Failed to load TrOCR model", &args.model)?;
            HtrEngineParams {
                generation_model: Some(Box::new(model)),
                tokenizer: Some(Box::new(tokenizer)),
                generator: GeneratorConfig {
                    max_tokens: args.max_tokens,
                    ..Default::default()
                },
                ..Default::default()
            }
        }
    };
    let engine = HtrEngine::new(params)?;
    tracing::debug!(kind = %args.model_kind, input_size = ?engine.input_size(), "engine ready");

    let image = match &args.image {
        ImageArg::Path(path) => {
            scrawl::image_input::load_image(path).file_error_context("Failed to read image", path)?
        }
        ImageArg::Base64(data) => scrawl::image_input::decode_base64(data)
            .and_then(|bytes| scrawl::image_input::decode_image(&bytes))
            .map_err(|err| format!("Failed to read image: {}", err))?,
        ImageArg::Stdin => {
            let data = io::read_to_string(io::stdin())
                .map_err(|err| format!("Failed to read image from stdin: {}", err))?;
            scrawl::image_input::decode_base64(&data)
                .and_then(|bytes| scrawl::image_input::decode_image(&bytes))
                .map_err(|err| format!("Failed to read image: {}", err))?
        }
    };

    if let Some(dump_path) = &args.dump_input_path {
        let input = engine.prepare_image(&image)?;
        let input_img = model_input_to_image(input.tensor(), engine.kind());
        write_image(dump_path, input_img.view())
            .file_error_context("Failed to write model input", dump_path)?;
    }

    let recognition = engine.predict_image(&image)?;

    let content = match args.output_format {
        OutputFormat::Text => format_text_output(&recognition),
        OutputFormat::Json => format_json_output(&recognition)?,
    };
    if let Some(output_path) = &args.output_path {
        std::fs::write(output_path, format!("{}\n", content).into_bytes())
            .file_error_context("Failed to write output", output_path)?;
    } else {
        println!("{}", content);
    }

    Ok(())
}
