use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;

/// Text emitted for labels which do not correspond to a vocabulary token.
pub const UNKNOWN_TOKEN: &str = "[UNK]";

/// Errors that can occur when loading a [Vocabulary].
#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("failed to read vocabulary: {0}")]
    Io(#[from] std::io::Error),
    #[error("vocabulary is empty")]
    Empty,
    #[error("vocabulary token {index} is empty")]
    EmptyToken { index: usize },
    #[error("vocabulary token {token:?} appears more than once")]
    DuplicateToken { token: String },
}

/// Specifies how the class indices output by a recognition model map to
/// vocabulary tokens and the CTC blank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LabelScheme {
    /// Class 0 is the out-of-vocabulary token, class `i` for `i` in `1..=n` is
    /// token `i - 1` and the last class is the CTC blank. The model emits
    /// `n + 3` classes.
    ///
    /// This is the layout produced by a Keras `StringLookup` layer with one
    /// OOV index and no mask token, followed by a dense layer with
    /// `vocabulary_size + 2` outputs.
    #[default]
    StringLookup,

    /// Class 0 is the CTC blank and class `i` for `i` in `1..=n` is token
    /// `i - 1`. The model emits `n + 1` classes.
    BlankFirst,
}

impl LabelScheme {
    /// Return the number of classes a model trained with `vocab` emits.
    pub fn class_count(self, vocab: &Vocabulary) -> usize {
        match self {
            LabelScheme::StringLookup => vocab.len() + 3,
            LabelScheme::BlankFirst => vocab.len() + 1,
        }
    }

    /// Return the index of the CTC blank for a model output with
    /// `class_count` classes.
    pub fn blank_class(self, class_count: usize) -> usize {
        match self {
            LabelScheme::StringLookup => class_count.saturating_sub(1),
            LabelScheme::BlankFirst => 0,
        }
    }
}

/// Ordered set of symbols that a recognition model can emit.
#[derive(Clone, Debug, PartialEq)]
pub struct Vocabulary {
    tokens: Vec<String>,
}

impl Vocabulary {
    /// Read a vocabulary file containing tokens separated by single spaces.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Vocabulary, VocabularyError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse a space-separated token stream.
    ///
    /// Only the space character separates tokens. A single trailing line
    /// ending is removed first, since most editors append one.
    pub fn parse(text: &str) -> Result<Vocabulary, VocabularyError> {
        let text = text
            .strip_suffix("\r\n")
            .or_else(|| text.strip_suffix('\n'))
            .unwrap_or(text);
        if text.is_empty() {
            return Err(VocabularyError::Empty);
        }
        Self::from_tokens(text.split(' '))
    }

    /// Create a vocabulary from a sequence of tokens.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Vocabulary, VocabularyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(VocabularyError::Empty);
        }

        let mut seen = HashSet::with_capacity(tokens.len());
        for (index, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(VocabularyError::EmptyToken { index });
            }
            if !seen.insert(token.as_str()) {
                return Err(VocabularyError::DuplicateToken {
                    token: token.clone(),
                });
            }
        }

        Ok(Vocabulary { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(|t| t.as_str())
    }

    /// Return the text for a model class label.
    ///
    /// Both label schemes place token `i` at class `i + 1`. Labels that fall
    /// outside the vocabulary, including the OOV class of
    /// [LabelScheme::StringLookup], map to [UNKNOWN_TOKEN].
    pub fn label_text(&self, label: usize) -> &str {
        label
            .checked_sub(1)
            .and_then(|i| self.token(i))
            .unwrap_or(UNKNOWN_TOKEN)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{LabelScheme, Vocabulary, VocabularyError, UNKNOWN_TOKEN};

    #[test]
    fn test_parse_vocabulary() {
        struct Case<'a> {
            text: &'a str,
            tokens: Result<&'a [&'a str], &'a str>,
        }

        let cases = [
            Case {
                text: "a b c",
                tokens: Ok(&["a", "b", "c"]),
            },
            Case {
                text: "a b c\n",
                tokens: Ok(&["a", "b", "c"]),
            },
            Case {
                text: "a b c\r\n",
                tokens: Ok(&["a", "b", "c"]),
            },
            Case {
                text: "! \" # ' th",
                tokens: Ok(&["!", "\"", "#", "'", "th"]),
            },
            Case {
                text: "",
                tokens: Err("vocabulary is empty"),
            },
            Case {
                text: "\n",
                tokens: Err("vocabulary is empty"),
            },
            Case {
                text: "a  b",
                tokens: Err("vocabulary token 1 is empty"),
            },
            Case {
                text: "a b a",
                tokens: Err("vocabulary token \"a\" appears more than once"),
            },
        ];

        for Case { text, tokens } in cases {
            let vocab = Vocabulary::parse(text);
            match tokens {
                Ok(expected) => {
                    let vocab = vocab.unwrap();
                    assert_eq!(vocab.tokens(), expected, "input {:?}", text);
                }
                Err(message) => {
                    assert_eq!(vocab.unwrap_err().to_string(), message, "input {:?}", text)
                }
            }
        }
    }

    #[test]
    fn test_vocabulary_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "x y z").unwrap();

        let vocab = Vocabulary::from_file(file.path()).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.token(2), Some("z"));

        let missing = Vocabulary::from_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(VocabularyError::Io(_))));
    }

    #[test]
    fn test_class_count() {
        let vocab = Vocabulary::parse("a b c d").unwrap();
        assert_eq!(LabelScheme::StringLookup.class_count(&vocab), 7);
        assert_eq!(LabelScheme::BlankFirst.class_count(&vocab), 5);
        assert_eq!(LabelScheme::StringLookup.blank_class(7), 6);
        assert_eq!(LabelScheme::BlankFirst.blank_class(5), 0);
    }

    #[test]
    fn test_label_text() {
        let vocab = Vocabulary::parse("a b c").unwrap();
        assert_eq!(vocab.label_text(0), UNKNOWN_TOKEN);
        assert_eq!(vocab.label_text(1), "a");
        assert_eq!(vocab.label_text(3), "c");
        assert_eq!(vocab.label_text(4), UNKNOWN_TOKEN);
    }
}
