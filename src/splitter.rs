//! Document splitting strategies.
//!
//! Three splitters cover the pipeline, selected in strict priority order:
//!
//! 1. **Markdown** for `.md`/`.markdown` — split on the heading hierarchy and
//!    carry the header path into chunk metadata.
//! 2. **Semantic** when an embedder is supplied — embed consecutive sentences
//!    and cut where similarity drops below a percentile threshold.
//! 3. **Recursive character** otherwise — separator-aware splitting with the
//!    configured size and overlap.
//!
//! The splitter never re-orders or dedupes; output order defines
//! `chunk_order` downstream. All sizes are measured in characters.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::embedding::{cosine_similarity, Embedder};
use crate::parser::Fragment;

/// Separators tried in order by the recursive splitter.
const SEPARATORS: &[&str] = &["\n\n", "\n", " "];

/// A splitter output: chunk text plus metadata (header path, fragment keys).
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    fn new(content: impl Into<String>) -> Self {
        Chunk {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Distance percentile above which the semantic splitter cuts.
    pub semantic_percentile: f64,
    /// Semantic chunks shorter than this absorb the next sentence group.
    pub semantic_min_chunk: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            chunk_overlap: 100,
            semantic_percentile: 0.6,
            semantic_min_chunk: 300,
        }
    }
}

/// Split parsed fragments into ordered chunks.
///
/// Selection: markdown by extension, then semantic if `semantic_embedder` is
/// given, then recursive character splitting.
pub async fn split_document(
    extension: &str,
    fragments: &[Fragment],
    config: &SplitConfig,
    semantic_embedder: Option<&dyn Embedder>,
) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();

    for fragment in fragments {
        let text = fragment.text.trim();
        if text.is_empty() {
            continue;
        }

        let fragment_chunks = match extension.to_lowercase().as_str() {
            "md" | "markdown" => split_markdown(text, config),
            _ => match semantic_embedder {
                Some(embedder) => split_semantic(text, config, embedder).await?,
                None => split_recursive(text, config)
                    .into_iter()
                    .map(Chunk::new)
                    .collect(),
            },
        };

        for mut chunk in fragment_chunks {
            for (k, v) in &fragment.metadata {
                chunk.metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
            chunks.push(chunk);
        }
    }

    Ok(chunks)
}

// ============ Markdown splitter ============

/// Split on ATX headings, keeping the header path as metadata. Sections
/// larger than `chunk_size` are sub-split with the recursive splitter.
fn split_markdown(text: &str, config: &SplitConfig) -> Vec<Chunk> {
    struct Section {
        path: Vec<(usize, String)>,
        body: String,
    }

    let mut sections: Vec<Section> = Vec::new();
    let mut path: Vec<(usize, String)> = Vec::new();
    let mut body = String::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        let heading = if in_fence { None } else { parse_heading(trimmed) };
        match heading {
            Some((depth, title)) => {
                if !body.trim().is_empty() {
                    sections.push(Section {
                        path: path.clone(),
                        body: std::mem::take(&mut body),
                    });
                } else {
                    body.clear();
                }
                path.retain(|(d, _)| *d < depth);
                path.push((depth, title));
            }
            None => {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    if !body.trim().is_empty() {
        sections.push(Section { path, body });
    }

    let mut chunks = Vec::new();
    for section in sections {
        let header_path = section
            .path
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join(" > ");
        for piece in split_recursive(section.body.trim(), config) {
            let mut chunk = Chunk::new(piece);
            if !header_path.is_empty() {
                chunk.metadata.insert("headers".to_string(), header_path.clone());
            }
            chunks.push(chunk);
        }
    }
    chunks
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') && !rest.is_empty() {
        return None;
    }
    Some((hashes, rest.trim().to_string()))
}

// ============ Semantic splitter ============

/// Embed consecutive sentences and cut where the inter-sentence cosine
/// distance exceeds the configured percentile, subject to the minimum chunk
/// size.
async fn split_semantic(
    text: &str,
    config: &SplitConfig,
    embedder: &dyn Embedder,
) -> Result<Vec<Chunk>> {
    let sentences = split_sentences(text);
    if sentences.len() < 2 {
        return Ok(vec![Chunk::new(text)]);
    }

    let vectors = embedder.embed(&sentences).await?;

    let distances: Vec<f64> = vectors
        .windows(2)
        .map(|w| 1.0 - cosine_similarity(&w[0], &w[1]) as f64)
        .collect();
    let threshold = percentile(&distances, config.semantic_percentile);

    let mut chunks = Vec::new();
    let mut current = String::new();
    for (i, sentence) in sentences.iter().enumerate() {
        current.push_str(sentence);
        let boundary = i < distances.len() && distances[i] > threshold;
        if boundary && current.chars().count() >= config.semantic_min_chunk {
            chunks.push(Chunk::new(current.trim()));
            current = String::new();
        }
    }
    if !current.trim().is_empty() {
        chunks.push(Chunk::new(current.trim()));
    }
    Ok(chunks)
}

/// Sentence boundaries: CJK and Latin terminators, keeping the terminator
/// attached to its sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '。' | '！' | '？' | '.' | '!' | '?' | '\n') {
            if current.trim().chars().count() > 0 {
                sentences.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }
    sentences
}

/// Value at the given percentile of `values` (nearest-rank on a sorted copy).
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::MAX;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[rank]
}

// ============ Recursive character splitter ============

/// Separator-aware splitting with overlap.
///
/// Pieces are produced by the first separator present, merged back up to
/// `chunk_size` with `chunk_overlap` characters carried between neighbors.
/// A piece with no usable separator is hard-split at `chunk_size` boundaries
/// without overlap.
pub fn split_recursive(text: &str, config: &SplitConfig) -> Vec<String> {
    split_with_separators(text, SEPARATORS, config.chunk_size, config.chunk_overlap)
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_with_separators(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    overlap: usize,
) -> Vec<String> {
    if char_len(text) <= chunk_size {
        return vec![text.to_string()];
    }

    let Some((sep_idx, sep)) = separators
        .iter()
        .enumerate()
        .find(|(_, s)| text.contains(**s))
        .map(|(i, s)| (i, *s))
    else {
        return hard_split(text, chunk_size);
    };

    let rest_seps = &separators[sep_idx + 1..];
    let sep_len = char_len(sep);

    let mut chunks: Vec<String> = Vec::new();
    // Pieces buffered for the current chunk, with their char lengths.
    let mut buffer: Vec<(String, usize)> = Vec::new();
    let mut buffer_len = 0usize;

    let flush = |buffer: &mut Vec<(String, usize)>, buffer_len: &mut usize, chunks: &mut Vec<String>| {
        if buffer.is_empty() {
            return;
        }
        let joined = buffer
            .iter()
            .map(|(p, _)| p.as_str())
            .collect::<Vec<_>>()
            .join(sep);
        if !joined.trim().is_empty() {
            chunks.push(joined);
        }
        // Keep a tail of pieces within the overlap budget for the next chunk.
        let mut kept: Vec<(String, usize)> = Vec::new();
        let mut kept_len = 0;
        for (piece, len) in buffer.drain(..).rev() {
            let added = if kept.is_empty() { len } else { len + sep_len };
            if kept_len + added > overlap {
                break;
            }
            kept_len += added;
            kept.push((piece, len));
        }
        kept.reverse();
        *buffer_len = kept_len;
        *buffer = kept;
    };

    for piece in text.split(sep) {
        let piece_len = char_len(piece);

        if piece_len > chunk_size {
            // Oversized piece: flush what we have, recurse, no overlap carry.
            flush(&mut buffer, &mut buffer_len, &mut chunks);
            buffer.clear();
            buffer_len = 0;
            chunks.extend(split_with_separators(piece, rest_seps, chunk_size, overlap));
            continue;
        }

        let added = if buffer.is_empty() {
            piece_len
        } else {
            piece_len + sep_len
        };
        if buffer_len + added > chunk_size && !buffer.is_empty() {
            flush(&mut buffer, &mut buffer_len, &mut chunks);
            // Drop carried overlap that would push the next chunk over size.
            while !buffer.is_empty() && buffer_len + piece_len + sep_len > chunk_size {
                let (_, removed_len) = buffer.remove(0);
                buffer_len -= removed_len;
                buffer_len -= if buffer.is_empty() { 0 } else { sep_len };
            }
        }
        buffer_len += if buffer.is_empty() { piece_len } else { piece_len + sep_len };
        buffer.push((piece.to_string(), piece_len));
    }
    flush(&mut buffer, &mut buffer_len, &mut chunks);

    chunks
}

/// Split a separator-free run at `chunk_size` character boundaries.
fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|c| c.iter().collect())
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn test_small_text_single_chunk() {
        let cfg = SplitConfig::default();
        let chunks = split_recursive("Hello, world!", &cfg);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_separator_free_text_hard_splits() {
        let cfg = SplitConfig {
            chunk_size: 1024,
            chunk_overlap: 100,
            ..Default::default()
        };
        let text = "abcdefghij".repeat(500); // 5000 chars, no separators
        let chunks = split_recursive(&text, &cfg);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1024));
        assert_eq!(chunks.last().unwrap().chars().count(), 5000 - 4 * 1024);
    }

    #[test]
    fn test_word_merge_respects_size_and_overlap() {
        let cfg = SplitConfig {
            chunk_size: 50,
            chunk_overlap: 10,
            ..Default::default()
        };
        let text = (0..100).map(|i| format!("w{:02}", i)).collect::<Vec<_>>().join(" ");
        let chunks = split_recursive(&text, &cfg);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 50, "oversized chunk: {:?}", c);
        }
        // Overlap carries the tail of one chunk into the head of the next.
        for pair in chunks.windows(2) {
            let head: String = pair[1].chars().take(7).collect();
            assert!(
                pair[0].ends_with(&head),
                "no overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_deterministic() {
        let cfg = SplitConfig {
            chunk_size: 40,
            chunk_overlap: 8,
            ..Default::default()
        };
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta eta theta.\n\nIota kappa lambda.";
        assert_eq!(split_recursive(text, &cfg), split_recursive(text, &cfg));
    }

    #[test]
    fn test_markdown_header_path() {
        let cfg = SplitConfig::default();
        let text = "# Guide\n\nIntro text.\n\n## Install\n\nRun the installer.\n\n## Use\n\nStart it.";
        let chunks = split_markdown(text, &cfg);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].metadata.get("headers").unwrap(), "Guide");
        assert_eq!(chunks[1].metadata.get("headers").unwrap(), "Guide > Install");
        assert_eq!(chunks[2].metadata.get("headers").unwrap(), "Guide > Use");
        assert!(chunks[1].content.contains("installer"));
    }

    #[test]
    fn test_markdown_ignores_fenced_hashes() {
        let cfg = SplitConfig::default();
        let text = "# Top\n\n```\n# not a heading\n```\n\ntail";
        let chunks = split_markdown(text, &cfg);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("# not a heading"));
    }

    #[test]
    fn test_sentence_split_cjk_and_latin() {
        let s = split_sentences("你好。第二句！Third sentence. Fourth?");
        assert_eq!(s.len(), 4);
        assert!(s[0].ends_with('。'));
        assert!(s[2].trim().ends_with('.'));
    }

    /// Embedder that alternates between two orthogonal directions so every
    /// sentence boundary has a deterministic distance.
    struct AlternatingEmbedder;

    #[async_trait]
    impl Embedder for AlternatingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, _)| if i < texts.len() / 2 { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
        fn model_name(&self) -> &str {
            "alternating"
        }
    }

    #[tokio::test]
    async fn test_semantic_split_cuts_at_distance_spike() {
        let cfg = SplitConfig {
            semantic_min_chunk: 10,
            ..Default::default()
        };
        let text = "aaaa aaaa aaaa. bbbb bbbb bbbb. cccc cccc cccc. dddd dddd dddd.";
        let chunks = split_semantic(text, &cfg, &AlternatingEmbedder).await.unwrap();
        // One spike in the middle of four sentences → two chunks.
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_strategy_selection_markdown_wins() {
        let cfg = SplitConfig::default();
        let fragments = vec![Fragment {
            text: "# T\n\nbody".to_string(),
            metadata: BTreeMap::new(),
        }];
        let chunks = split_document("md", &fragments, &cfg, Some(&AlternatingEmbedder as &dyn Embedder))
            .await
            .unwrap();
        assert_eq!(chunks[0].metadata.get("headers").unwrap(), "T");
    }

    #[tokio::test]
    async fn test_fragment_metadata_carried() {
        let cfg = SplitConfig::default();
        let mut meta = BTreeMap::new();
        meta.insert("page".to_string(), "3".to_string());
        let fragments = vec![Fragment {
            text: "plain body".to_string(),
            metadata: meta,
        }];
        let chunks = split_document("txt", &fragments, &cfg, None).await.unwrap();
        assert_eq!(chunks[0].metadata.get("page").unwrap(), "3");
    }
}
