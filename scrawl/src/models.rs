//! Locating and loading recognition model files.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::anyhow;
use rten::Model;
use url::Url;

/// Environment variable which overrides the model cache directory.
pub const CACHE_DIR_ENV: &str = "SCRAWL_CACHE_DIR";

/// Return the path to the directory in which downloaded models should be
/// saved.
fn cache_dir() -> Result<PathBuf, anyhow::Error> {
    let cache_dir = match std::env::var_os(CACHE_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => {
            let mut dir: PathBuf =
                home::home_dir().ok_or(anyhow!("Failed to determine home directory"))?;
            dir.push(".cache");
            dir.push("scrawl");
            dir
        }
    };

    fs::create_dir_all(&cache_dir)?;

    Ok(cache_dir)
}

/// Extract the last path segment from a URL.
///
/// eg. "https://models.com/iam-words.rten" => "iam-words.rten".
#[allow(rustdoc::bare_urls)]
fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let path = Path::new(parsed.path());
    path.file_name()
        .and_then(|f| f.to_str())
        .map(|s| s.to_string())
}

/// Download a file from `url` into `cache_dir`, if not already fetched, and
/// return the path to the local file.
fn download_file(cache_dir: &Path, url: &str) -> Result<PathBuf, anyhow::Error> {
    let filename = filename_from_url(url).ok_or(anyhow!("Could not get destination filename"))?;
    let file_path = cache_dir.join(filename);
    if file_path.exists() {
        tracing::debug!(path = %file_path.display(), "using cached model");
        return Ok(file_path);
    }

    tracing::info!(url, "downloading model");

    let response = ureq::get(url).call()?;
    let mut reader = response.into_body().into_reader();

    // Write to a temporary name first so an interrupted download is not
    // mistaken for a cached model.
    let partial_path = file_path.with_extension("partial");
    let mut file = fs::File::create(&partial_path)?;
    let size = io::copy(&mut reader, &mut file)?;
    file.sync_all()?;
    fs::rename(&partial_path, &file_path)?;

    tracing::info!(path = %file_path.display(), size, "model downloaded");

    Ok(file_path)
}

/// Location that a model can be loaded from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ModelSource<'a> {
    /// Load model from an HTTP(S) URL.
    Url(&'a str),

    /// Load model from a local file path.
    Path(&'a str),
}

impl<'a> ModelSource<'a> {
    /// Interpret a model reference given on the command line or in
    /// configuration. `http://` and `https://` references are URLs, anything
    /// else is a file path.
    pub fn parse(reference: &'a str) -> ModelSource<'a> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            ModelSource::Url(reference)
        } else {
            ModelSource::Path(reference)
        }
    }
}

impl fmt::Display for ModelSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ModelSource::Url(url) => url,
                ModelSource::Path(path) => path,
            }
        )
    }
}

/// Family of recognition model that an engine is built around.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelKind {
    /// Convolutional-recurrent model with CTC output, run with rten. Needs a
    /// vocabulary.
    #[default]
    Ctc,

    /// TrOCR encoder-decoder transformer, run with candle.
    TrOcr,
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ctc" => Ok(ModelKind::Ctc),
            "trocr" => Ok(ModelKind::TrOcr),
            _ => Err(format!(
                "unknown model kind \"{}\", expected \"ctc\" or \"trocr\"",
                s
            )),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Ctc => write!(f, "ctc"),
            ModelKind::TrOcr => write!(f, "trocr"),
        }
    }
}

/// Load a model from a given source.
///
/// If the source is a URL, the model will be downloaded and cached locally if
/// needed.
pub fn load_model(source: ModelSource) -> Result<Model, anyhow::Error> {
    let model_path = match source {
        ModelSource::Url(url) => download_file(&cache_dir()?, url)?,
        ModelSource::Path(path) => path.into(),
    };
    let model = Model::load_file(&model_path)?;
    tracing::debug!(path = %model_path.display(), "loaded model");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::{download_file, filename_from_url, load_model, ModelKind, ModelSource};

    #[test]
    fn test_model_source_parse() {
        assert_eq!(
            ModelSource::parse("https://example.com/models/words.rten"),
            ModelSource::Url("https://example.com/models/words.rten")
        );
        assert_eq!(
            ModelSource::parse("http://localhost:8000/words.rten"),
            ModelSource::Url("http://localhost:8000/words.rten")
        );
        assert_eq!(
            ModelSource::parse("models/words.rten"),
            ModelSource::Path("models/words.rten")
        );
        assert_eq!(
            ModelSource::parse("httpdocs/words.rten"),
            ModelSource::Path("httpdocs/words.rten")
        );
    }

    #[test]
    fn test_model_kind_parse() {
        assert_eq!("ctc".parse(), Ok(ModelKind::Ctc));
        assert_eq!("trocr".parse(), Ok(ModelKind::TrOcr));
        assert_eq!(ModelKind::default(), ModelKind::Ctc);
        assert_eq!(ModelKind::TrOcr.to_string(), "trocr");

        let err = "TrOCR".parse::<ModelKind>().unwrap_err();
        assert!(err.contains("unknown model kind"), "{}", err);
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/models/words.rten?v=2").as_deref(),
            Some("words.rten")
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }

    #[test]
    fn test_load_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.rten");
        let path = path.to_str().unwrap();
        assert!(load_model(ModelSource::Path(path)).is_err());
    }

    #[test]
    fn test_download_file_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("words.rten");
        std::fs::write(&cached, b"cached").unwrap();

        // The host does not resolve, so this only succeeds if the cached
        // copy is used.
        let path = download_file(dir.path(), "https://models.invalid/v1/words.rten").unwrap();
        assert_eq!(path, cached);

        let err = download_file(dir.path(), "https://models.invalid/").unwrap_err();
        assert_eq!(err.to_string(), "Could not get destination filename");
    }
}
