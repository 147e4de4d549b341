//! API server binary entry point

use anyhow::Context;
use scrawl::{
    load_model, load_trocr, HtrEngine, HtrEngineParams, ModelKind, ModelSource, Vocabulary,
};
use scrawl_server::{start_server, AppState, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Load a CTC model and its vocabulary.
fn load_ctc_params(config: &ServerConfig, vocab_path: &str) -> anyhow::Result<HtrEngineParams> {
    let vocabulary = Vocabulary::from_file(vocab_path)
        .with_context(|| format!("Failed to load vocabulary from \"{}\"", vocab_path))?;
    tracing::info!(
        path = %vocab_path,
        tokens = vocabulary.len(),
        "loaded vocabulary"
    );

    let model_src = ModelSource::parse(&config.model);
    let model = load_model(model_src)
        .with_context(|| format!("Failed to load text recognition model from \"{}\"", model_src))?;
    tracing::info!(model = %model_src, "loaded recognition model");

    Ok(HtrEngineParams {
        recognition_model: Some(Box::new(model)),
        vocabulary: Some(vocabulary),
        recognizer: config.recognizer.clone(),
        ..Default::default()
    })
}

/// Load a TrOCR model and its tokenizer.
fn load_trocr_params(config: &ServerConfig) -> anyhow::Result<HtrEngineParams> {
    let (model, tokenizer) = load_trocr(&config.model, config.revision.as_deref())
        .with_context(|| format!("Failed to load TrOCR model \"{}\"", config.model))?;
    tracing::info!(model = %config.model, "loaded TrOCR model");

    Ok(HtrEngineParams {
        generation_model: Some(Box::new(model)),
        tokenizer: Some(Box::new(tokenizer)),
        generator: config.generator.clone(),
        ..Default::default()
    })
}

/// Load the model named by `config` and build an engine.
fn load_engine(config: &ServerConfig) -> anyhow::Result<HtrEngine> {
    let params = match (config.model_kind, &config.vocabulary) {
        (ModelKind::Ctc, Some(vocab_path)) => load_ctc_params(config, vocab_path)?,
        (ModelKind::Ctc, None) => return Err(anyhow::anyhow!("CTC models require a vocabulary")),
        (ModelKind::TrOcr, _) => load_trocr_params(config)?,
    };
    HtrEngine::new(params)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrawl=info,scrawl_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    // Model loading may download files, so it happens before the async
    // runtime starts.
    let engine = load_engine(&config)?;
    let (width, height) = engine.input_size();
    tracing::info!(kind = %engine.kind(), width, height, "engine ready");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(start_server(
        &config.addr,
        AppState::new(engine),
        config.max_body_bytes,
    ))?;

    Ok(())
}
