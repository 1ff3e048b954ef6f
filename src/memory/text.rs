//! Text utilities shared by the write and read paths.
//!
//! Mixed-script tokenization (ASCII identifier words plus contiguous CJK
//! runs), keyword extraction, summary truncation, CJK n-gram expansion, and
//! the word-level Jaccard similarity used by the dedup gate.

use std::collections::{HashMap, HashSet};

/// Maximum summary length in characters.
pub const SUMMARY_MAX_CHARS: usize = 100;

/// Number of keywords kept per record.
pub const KEYWORD_COUNT: usize = 10;

/// True for characters treated as CJK for tokenization purposes:
/// unified ideographs (plus extension A), kana, and hangul syllables.
pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{309F}'
        | '\u{30A0}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}'
    )
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenized view of a mixed-script text.
#[derive(Debug, Default)]
pub struct Tokens {
    /// Lowercased ASCII identifier-form words, in order of appearance.
    pub words: Vec<String>,
    /// Contiguous CJK runs, in order of appearance.
    pub cjk_runs: Vec<String>,
}

/// Split a text into ASCII words and CJK runs. Everything else is a separator.
pub fn tokenize(text: &str) -> Tokens {
    let mut tokens = Tokens::default();
    let mut word = String::new();
    let mut run = String::new();

    for c in text.chars() {
        if is_word_char(c) {
            if !run.is_empty() {
                tokens.cjk_runs.push(std::mem::take(&mut run));
            }
            word.extend(c.to_lowercase());
        } else if is_cjk(c) {
            if !word.is_empty() {
                tokens.words.push(std::mem::take(&mut word));
            }
            run.push(c);
        } else {
            if !word.is_empty() {
                tokens.words.push(std::mem::take(&mut word));
            }
            if !run.is_empty() {
                tokens.cjk_runs.push(std::mem::take(&mut run));
            }
        }
    }
    if !word.is_empty() {
        tokens.words.push(word);
    }
    if !run.is_empty() {
        tokens.cjk_runs.push(run);
    }

    tokens
}

/// Expand a CJK run into bigrams and trigrams, dropping any n-gram that is
/// itself a stopword.
pub fn cjk_ngrams(run: &str, stopwords: &HashSet<&str>) -> Vec<String> {
    let chars: Vec<char> = run.chars().collect();
    let mut ngrams = Vec::new();

    for n in [2usize, 3] {
        if chars.len() < n {
            continue;
        }
        for window in chars.windows(n) {
            let gram: String = window.iter().collect();
            if !stopwords.contains(gram.as_str()) {
                ngrams.push(gram);
            }
        }
    }

    ngrams
}

/// Top content tokens by frequency, comma-joined. Stopwords and tokens of
/// length <= 1 are excluded; ties resolve to earliest first appearance.
pub fn extract_keywords(content: &str, stopwords: &HashSet<&str>) -> String {
    let tokens = tokenize(content);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut first_seen: HashMap<&str, usize> = HashMap::new();

    let all: Vec<&String> = tokens.words.iter().chain(tokens.cjk_runs.iter()).collect();
    for (position, token) in all.iter().enumerate() {
        if token.chars().count() <= 1 || stopwords.contains(token.as_str()) {
            continue;
        }
        *counts.entry(token.as_str()).or_insert(0) += 1;
        first_seen.entry(token.as_str()).or_insert(position);
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by_key(|(token, count)| (std::cmp::Reverse(*count), first_seen[token]));

    ranked
        .into_iter()
        .take(KEYWORD_COUNT)
        .map(|(token, _)| token.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Leading prefix of `content`, at most [`SUMMARY_MAX_CHARS`] characters,
/// suffixed with `...` when truncated.
pub fn summarize(content: &str) -> String {
    if content.chars().count() <= SUMMARY_MAX_CHARS {
        return content.to_string();
    }
    let prefix: String = content.chars().take(SUMMARY_MAX_CHARS).collect();
    format!("{prefix}...")
}

/// Word-level Jaccard similarity over whitespace tokens.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();

    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / union as f64
}

/// Build a borrowed stopword set from a configured list.
pub fn stopword_set(words: &[String]) -> HashSet<&str> {
    words.iter().map(|s| s.as_str()).collect()
}
