//! Mixed CJK/Latin tokenization for the lexical index.
//!
//! The full-text tables are contentless and use the trivial `unicode61`
//! tokenizer, so all real segmentation happens here: document names and node
//! contents are pre-digested into space-joined token strings at write time,
//! and user keywords are turned into prefix-match FTS expressions at query
//! time. Chinese names additionally get two synthetic phonetic tokens (full
//! pinyin and initial-letter abbreviation) so `zhongguo` and `zg` both recall
//! `中国`.

use jieba_rs::Jieba;
use pinyin::ToPinyin;
use std::sync::{Mutex, OnceLock};

/// Hard cap on tokens emitted for a single node's content.
const MAX_CONTENT_TOKENS: usize = 10_000;

/// Pinyin expansion is skipped for names with more Han characters than this.
const MAX_PINYIN_CHARS: usize = 200;

/// Characters with FTS5 query semantics; stripped from match terms outright.
const FTS_RESERVED: &[char] = &['"', '\'', '*', '(', ')', ':', '^', '-'];

/// The segmenter loads its dictionary once and is shared process-wide.
fn segmenter() -> &'static Mutex<Jieba> {
    static SEGMENTER: OnceLock<Mutex<Jieba>> = OnceLock::new();
    SEGMENTER.get_or_init(|| Mutex::new(Jieba::new()))
}

fn segment(text: &str) -> Vec<String> {
    let jieba = segmenter().lock().expect("segmenter mutex poisoned");
    jieba
        .cut(text, true)
        .into_iter()
        .map(|t| t.to_string())
        .collect()
}

fn is_han(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}' | '\u{f900}'..='\u{faff}')
}

/// Lowercase a raw segment and keep it only if it carries a letter or digit.
fn clean_token(raw: &str) -> Option<String> {
    let token = raw.trim().to_lowercase();
    if token.chars().any(|c| c.is_alphanumeric()) {
        Some(token)
    } else {
        None
    }
}

/// Dedupe while preserving the first occurrence of each token.
fn dedupe(tokens: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokens.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

/// Full pinyin and initial-letter tokens for the Han characters of `text`.
///
/// Returns `None` when `text` has no Han characters or more than
/// [`MAX_PINYIN_CHARS`] of them.
fn pinyin_tokens(text: &str) -> Option<(String, String)> {
    let han_count = text.chars().filter(|c| is_han(*c)).count();
    if han_count == 0 || han_count > MAX_PINYIN_CHARS {
        return None;
    }

    let mut full = String::new();
    let mut initials = String::new();
    for syllable in text.to_pinyin().flatten() {
        full.push_str(syllable.plain());
        initials.push_str(syllable.first_letter());
    }
    if full.is_empty() {
        return None;
    }
    Some((full, initials))
}

/// Tokenize a document's display name for `doc_name_fts`.
///
/// Strips the extension, segments, lowercases, and dedupes; Chinese names get
/// the two phonetic tokens; the lowercased extension is appended last so a
/// search for `pdf` matches by type.
pub fn tokenize_name(name: &str) -> String {
    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    };

    let mut tokens = dedupe(segment(stem).iter().filter_map(|t| clean_token(t)).collect());

    if let Some((full, initials)) = pinyin_tokens(stem) {
        tokens.push(full);
        tokens.push(initials);
    }

    if !extension.is_empty() {
        tokens.push(extension.to_lowercase());
    }

    tokens.join(" ")
}

/// Tokenize node content for `doc_fts`, truncated at [`MAX_CONTENT_TOKENS`].
pub fn tokenize_content(text: &str) -> String {
    let mut tokens: Vec<String> = segment(text).iter().filter_map(|t| clean_token(t)).collect();
    tokens.truncate(MAX_CONTENT_TOKENS);
    tokens.join(" ")
}

/// Build a prefix-match FTS expression from user input.
///
/// Each surviving term has the reserved characters removed and a single `*`
/// appended; terms are joined with spaces (implicit AND). Chinese input adds
/// the phonetic variants as extra prefix terms. Returns the empty string when
/// nothing survives cleaning — the caller must then return no results instead
/// of issuing a malformed MATCH.
pub fn build_match_query(keyword: &str) -> String {
    let mut terms: Vec<String> = Vec::new();

    for raw in segment(keyword) {
        let Some(token) = clean_token(&raw) else {
            continue;
        };
        let stripped: String = token.chars().filter(|c| !FTS_RESERVED.contains(c)).collect();
        if stripped.chars().any(|c| c.is_alphanumeric()) {
            terms.push(stripped);
        }
    }

    if let Some((full, initials)) = pinyin_tokens(keyword) {
        terms.push(full);
        terms.push(initials);
    }

    dedupe(terms)
        .into_iter()
        .map(|t| format!("{}*", t))
        .collect::<Vec<_>>()
        .join(" ")
}
