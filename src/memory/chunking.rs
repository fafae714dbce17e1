//! Text normalization and sentence-aware chunking.
//!
//! Chunks target ~600 tokens (≈2400 characters) with ~75 tokens
//! (≈300 characters) of overlap. Fenced code blocks are atomic: a chunk
//! boundary never lands inside one.

use unicode_segmentation::UnicodeSegmentation;

/// Target chunk size in characters (~600 tokens at 4 chars/token).
pub const TARGET_CHUNK_CHARS: usize = 2_400;

/// Overlap between consecutive chunks in characters (~75 tokens).
pub const CHUNK_OVERLAP_CHARS: usize = 300;

/// A chunk of normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Chunk content.
    pub text: String,
    /// Sequential index within the document.
    pub index: usize,
}

/// Summary statistics for a chunking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ChunkStats {
    /// Characters after normalization.
    pub total_chars: usize,
    /// Number of chunks produced.
    pub total_chunks: usize,
    /// Mean chunk size in characters (0 for empty input).
    pub avg_chunk_size: usize,
}

/// Splits a document into chunks with the default size and overlap.
#[must_use]
pub fn chunk_text(text: &str) -> (Vec<TextChunk>, ChunkStats) {
    chunk_text_with(text, TARGET_CHUNK_CHARS, CHUNK_OVERLAP_CHARS)
}

/// Splits a document into chunks with explicit size and overlap.
#[must_use]
pub fn chunk_text_with(text: &str, target: usize, overlap: usize) -> (Vec<TextChunk>, ChunkStats) {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return (
            Vec::new(),
            ChunkStats {
                total_chars: 0,
                total_chunks: 0,
                avg_chunk_size: 0,
            },
        );
    }

    let target = target.max(1);
    let chunks = if normalized.len() <= target {
        vec![TextChunk {
            text: normalized.clone(),
            index: 0,
        }]
    } else {
        pack_segments(split_segments(&normalized), target, overlap.min(target / 2))
    };

    let total_chars = normalized.len();
    let total_chunks = chunks.len();
    let avg_chunk_size = if total_chunks == 0 {
        0
    } else {
        chunks.iter().map(|c| c.text.len()).sum::<usize>() / total_chunks
    };
    (
        chunks,
        ChunkStats {
            total_chars,
            total_chunks,
            avg_chunk_size,
        },
    )
}

/// Normalizes text: CRLF to LF, trailing-space trim, horizontal
/// whitespace runs collapsed, at most two consecutive blank lines.
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    let mut in_fence = false;

    for raw_line in text.replace("\r\n", "\n").split('\n') {
        if raw_line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        // Code blocks keep their whitespace verbatim
        let line = if in_fence || raw_line.trim_start().starts_with("```") {
            raw_line.trim_end().to_string()
        } else {
            collapse_horizontal(raw_line.trim_end())
        };

        if line.is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(&line);
        out.push('\n');
    }

    out.trim_end_matches('\n').trim_start_matches('\n').to_string()
}

/// Collapses runs of spaces and tabs to a single space.
fn collapse_horizontal(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_run = false;
    for ch in line.chars() {
        if ch == ' ' || ch == '\t' {
            if !in_run {
                out.push(' ');
                in_run = true;
            }
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out
}

/// Splits normalized text into atomic segments: fenced code blocks whole,
/// prose broken at sentence boundaries.
fn split_segments(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let (prose, tail) = rest.split_at(open);
        push_sentences(prose, &mut segments);

        // Find the closing fence; an unterminated fence runs to the end
        let close = tail[3..].find("```").map_or(tail.len(), |i| i + 6);
        let (fence, after) = tail.split_at(close.min(tail.len()));
        if !fence.is_empty() {
            segments.push(fence);
        }
        rest = after;
    }
    push_sentences(rest, &mut segments);
    segments
}

/// Appends prose sentence segments.
fn push_sentences<'a>(prose: &'a str, segments: &mut Vec<&'a str>) {
    for sentence in prose.split_sentence_bounds() {
        if !sentence.is_empty() {
            segments.push(sentence);
        }
    }
}

/// Greedily packs segments into chunks of at most `target` characters,
/// carrying `overlap` trailing characters (whole segments) forward.
fn pack_segments(segments: Vec<&str>, target: usize, overlap: usize) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut carry: Vec<&str> = Vec::new();

    let flush = |current: &mut String, chunks: &mut Vec<TextChunk>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            chunks.push(TextChunk {
                text: trimmed.to_string(),
                index: chunks.len(),
            });
        }
        current.clear();
    };

    for segment in segments {
        if !current.is_empty() && current.len() + segment.len() > target {
            flush(&mut current, &mut chunks);
            // Seed the next chunk with the overlap carried from the last
            let mut seeded = 0;
            for piece in carry.iter().rev().take_while(|p| {
                seeded += p.len();
                seeded <= overlap
            }) {
                current.insert_str(0, piece);
            }
            carry.clear();
        }
        current.push_str(segment);
        carry.push(segment);
        // Bound the carry buffer to the overlap window
        while carry.iter().map(|p| p.len()).sum::<usize>() > overlap && carry.len() > 1 {
            carry.remove(0);
        }
    }
    flush(&mut current, &mut chunks);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_empty_input() {
        let (chunks, stats) = chunk_text("");
        assert!(chunks.is_empty());
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.avg_chunk_size, 0);
    }

    #[test]
    fn test_whitespace_only_input() {
        let (chunks, stats) = chunk_text("  \n\n \t \n");
        assert!(chunks.is_empty());
        assert_eq!(stats.total_chars, 0);
    }

    #[test]
    fn test_short_input_single_chunk() {
        let (chunks, stats) = chunk_text("A short note about queue backoff.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_long_input_multiple_chunks_with_overlap() {
        let sentence = "The processor drains the queue with exponential backoff. ";
        let text = sentence.repeat(200); // ~11k chars
        let (chunks, stats) = chunk_text(&text);

        assert!(stats.total_chunks > 1);
        for chunk in &chunks {
            // Packed chunks respect the target plus one segment of slack
            assert!(chunk.text.len() <= TARGET_CHUNK_CHARS + sentence.len());
        }
        // Indices are sequential
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn test_fenced_code_is_atomic() {
        let code = format!("```rust\n{}```", "let x = 1;\n".repeat(400));
        let text = format!("Intro paragraph.\n\n{code}\n\nOutro paragraph.");
        let (chunks, _) = chunk_text(&text);

        // The whole fence must live inside exactly one chunk
        let holders: Vec<&TextChunk> = chunks
            .iter()
            .filter(|c| c.text.contains("```rust"))
            .collect();
        assert_eq!(holders.len(), 1);
        assert!(holders[0].text.matches("```").count() >= 2);
    }

    #[test]
    fn test_normalize_crlf_and_blank_lines() {
        let text = "a\r\nb\r\n\r\n\r\n\r\n\r\nc";
        assert_eq!(normalize(text), "a\nb\n\n\nc");
    }

    #[test]
    fn test_normalize_collapses_runs() {
        assert_eq!(normalize("a   b\t\tc"), "a b c");
    }

    #[test]
    fn test_normalize_preserves_code_whitespace() {
        let text = "```\n    indented   code\n```";
        assert_eq!(normalize(text), "```\n    indented   code\n```");
    }

    #[test_case("one sentence only."; "single sentence")]
    #[test_case("First. Second! Third?"; "multiple sentences")]
    fn test_roundtrip_content_preserved(text: &str) {
        let (chunks, _) = chunk_text(text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, normalize(text));
    }

    #[test]
    fn test_stats_consistency() {
        let text = "Sentence one is here. ".repeat(300);
        let (chunks, stats) = chunk_text(&text);
        assert_eq!(stats.total_chunks, chunks.len());
        assert!(stats.avg_chunk_size > 0);
        assert_eq!(stats.total_chars, normalize(&text).len());
    }
}
