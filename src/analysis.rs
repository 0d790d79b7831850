//! Text analysis pipelines registered on every entity index.
//!
//! | Analyzer | Fields | Pipeline |
//! |----------|--------|----------|
//! | `raw` (built in) | `id`, `type` | whole value as one case-preserving token |
//! | [`STANDARD_ANALYZER`] | `title` | word tokenizer, lowercase, English stopwords |
//! | [`NGRAM_ANALYZER`] | `content` | word tokenizer, lowercase, [`STOP_WORDS`], edge n-grams 3..=25 |
//!
//! The edge n-grams make every indexed content term a prefix of a word, so a
//! prefix query on `content` behaves as a substring-of-word search.

use anyhow::{anyhow, Result};
use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, StopWordFilter, TextAnalyzer, Token,
    TokenFilter, TokenStream, Tokenizer,
};
use tantivy::Index;

pub const STANDARD_ANALYZER: &str = "entity_standard";
pub const NGRAM_ANALYZER: &str = "entity_ngram";

pub const NGRAM_MIN: usize = 3;
pub const NGRAM_MAX: usize = 25;

/// Stopwords removed from `content` before n-gram expansion. Generic
/// institutional words sit alongside the language stopwords because nearly
/// every entity title contains them.
pub const STOP_WORDS: &[&str] = &[
    "a",
    "an",
    "of",
    "the",
    "die",
    "von",
    "av",
    "i",
    "identity",
    "provider",
    "university",
    "uni",
];

/// Registers the entity analyzers on a freshly opened or created index.
pub fn register_analyzers(index: &Index) -> Result<()> {
    let tokenizers = index.tokenizers();
    tokenizers.register(STANDARD_ANALYZER, standard_analyzer()?);
    tokenizers.register(NGRAM_ANALYZER, ngram_analyzer());
    Ok(())
}

pub fn standard_analyzer() -> Result<TextAnalyzer> {
    let stop_words = StopWordFilter::new(Language::English)
        .ok_or_else(|| anyhow!("English stopword list unavailable"))?;
    Ok(TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(stop_words)
        .build())
}

pub fn ngram_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(
            STOP_WORDS.iter().map(|word| word.to_string()),
        ))
        .filter(EdgeNgramFilter::new(NGRAM_MIN, NGRAM_MAX))
        .build()
}

/// Expands each token into its leading n-grams of `min..=max` characters.
///
/// Tokens shorter than `min` characters are dropped. Every n-gram keeps the
/// position and offsets of the token it came from.
#[derive(Clone, Debug)]
pub struct EdgeNgramFilter {
    min: usize,
    max: usize,
}

impl EdgeNgramFilter {
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min: min.max(1),
            max,
        }
    }
}

impl TokenFilter for EdgeNgramFilter {
    type Tokenizer<T: Tokenizer> = EdgeNgramFilterWrapper<T>;

    fn transform<T: Tokenizer>(self, tokenizer: T) -> EdgeNgramFilterWrapper<T> {
        EdgeNgramFilterWrapper {
            inner: tokenizer,
            min: self.min,
            max: self.max,
        }
    }
}

#[derive(Clone)]
pub struct EdgeNgramFilterWrapper<T> {
    inner: T,
    min: usize,
    max: usize,
}

impl<T: Tokenizer> Tokenizer for EdgeNgramFilterWrapper<T> {
    type TokenStream<'a> = EdgeNgramTokenStream<T::TokenStream<'a>>;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> Self::TokenStream<'a> {
        EdgeNgramTokenStream {
            tail: self.inner.token_stream(text),
            min: self.min,
            max: self.max,
            source: Token::default(),
            pending: Vec::new(),
            token: Token::default(),
        }
    }
}

pub struct EdgeNgramTokenStream<T> {
    tail: T,
    min: usize,
    max: usize,
    source: Token,
    /// Byte ends of the n-grams still to emit for `source`, longest first.
    pending: Vec<usize>,
    token: Token,
}

impl<T: TokenStream> TokenStream for EdgeNgramTokenStream<T> {
    fn advance(&mut self) -> bool {
        loop {
            if let Some(end) = self.pending.pop() {
                self.token.offset_from = self.source.offset_from;
                self.token.offset_to = self.source.offset_to;
                self.token.position = self.source.position;
                self.token.position_length = self.source.position_length;
                self.token.text.clear();
                self.token.text.push_str(&self.source.text[..end]);
                return true;
            }

            if !self.tail.advance() {
                return false;
            }
            self.source.clone_from(self.tail.token());
            self.pending = prefix_ends(&self.source.text, self.min, self.max);
            self.pending.reverse();
        }
    }

    fn token(&self) -> &Token {
        &self.token
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.token
    }
}

/// Byte offsets at which the prefixes of `min..=max` characters end.
fn prefix_ends(text: &str, min: usize, max: usize) -> Vec<usize> {
    text.char_indices()
        .map(|(start, c)| start + c.len_utf8())
        .enumerate()
        .filter(|(n, _)| (min..=max).contains(&(n + 1)))
        .map(|(_, end)| end)
        .collect()
}
