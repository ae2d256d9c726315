//! Paragraph-aware text chunking.
//!
//! Input text splits on double-newline paragraph boundaries into chunks of
//! roughly `target_tokens`, never crossing a paragraph boundary unless a
//! single paragraph exceeds the target — in which case it splits at
//! sentence boundaries, then at whitespace. Token counts are the
//! `ceil(chars / 4)` approximation used throughout the index.

use crate::domain::models::Chunk;

/// Approximate token count for a piece of text.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Paragraph chunker with target and minimum sizes in tokens.
#[derive(Debug, Clone)]
pub struct Chunker {
    target_tokens: usize,
    min_tokens: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(500, 50)
    }
}

impl Chunker {
    pub fn new(target_tokens: usize, min_tokens: usize) -> Self {
        debug_assert!(min_tokens < target_tokens);
        Self {
            target_tokens,
            min_tokens,
        }
    }

    /// Split `text` into chunks tagged with `document_id` and a dense
    /// 0-based sequence. Zero-length chunks are never produced.
    pub fn chunk(&self, text: &str, document_id: &str) -> Vec<Chunk> {
        let mut pieces: Vec<(String, usize)> = Vec::new(); // (content, start offset)

        let mut cursor = 0usize;
        let mut current = String::new();
        let mut current_start = 0usize;

        for paragraph in text.split("\n\n") {
            let para_start = cursor;
            cursor += paragraph.len() + 2; // separator included

            let trimmed = paragraph.trim();
            if trimmed.is_empty() {
                continue;
            }

            if approx_tokens(trimmed) > self.target_tokens {
                // Flush whatever accumulated, then split the oversized
                // paragraph on its own.
                if !current.is_empty() {
                    pieces.push((std::mem::take(&mut current), current_start));
                }
                for part in self.split_oversized(trimmed) {
                    pieces.push((part, para_start));
                }
                continue;
            }

            if current.is_empty() {
                current_start = para_start;
                current = trimmed.to_string();
            } else if approx_tokens(&current) + approx_tokens(trimmed) > self.target_tokens
                && approx_tokens(&current) >= self.min_tokens
            {
                pieces.push((std::mem::take(&mut current), current_start));
                current_start = para_start;
                current = trimmed.to_string();
            } else {
                current.push_str("\n\n");
                current.push_str(trimmed);
            }
        }
        if !current.is_empty() {
            pieces.push((current, current_start));
        }

        pieces
            .into_iter()
            .filter(|(content, _)| !content.is_empty())
            .enumerate()
            .map(|(sequence, (content, start))| {
                let end = start + content.len();
                let tokens = approx_tokens(&content);
                Chunk::new(document_id, sequence, content, tokens).with_offsets(start, end)
            })
            .collect()
    }

    /// Split a paragraph exceeding the target at sentence boundaries, then
    /// at whitespace for sentences that are themselves too large.
    fn split_oversized(&self, paragraph: &str) -> Vec<String> {
        let mut parts = Vec::new();
        let mut current = String::new();

        for sentence in split_sentences(paragraph) {
            if approx_tokens(sentence) > self.target_tokens {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
                parts.extend(self.split_at_whitespace(sentence));
                continue;
            }

            if current.is_empty() {
                current = sentence.to_string();
            } else if approx_tokens(&current) + approx_tokens(sentence) > self.target_tokens {
                parts.push(std::mem::take(&mut current));
                current = sentence.to_string();
            } else {
                current.push(' ');
                current.push_str(sentence);
            }
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }

    fn split_at_whitespace(&self, text: &str) -> Vec<String> {
        let mut parts = Vec::new();
        let mut current = String::new();

        for word in text.split_whitespace() {
            if !current.is_empty()
                && approx_tokens(&current) + approx_tokens(word) > self.target_tokens
            {
                parts.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }
}

/// Split on sentence-ending punctuation, keeping the terminator with the
/// sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.char_indices().collect::<Vec<_>>();

    for (i, &(pos, c)) in bytes.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            // Sentence ends here if followed by whitespace or end of text.
            let next_is_space = bytes
                .get(i + 1)
                .is_none_or(|(_, next)| next.is_whitespace());
            if next_is_space {
                let end = pos + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunker = Chunker::default();
        assert!(chunker.chunk("", "d").is_empty());
        assert!(chunker.chunk("   \n\n  \n\n", "d").is_empty());
    }

    #[test]
    fn test_small_text_is_one_chunk() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk("First paragraph.\n\nSecond paragraph.", "d");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence, 0);
        assert!(chunks[0].content.contains("First"));
        assert!(chunks[0].content.contains("Second"));
    }

    #[test]
    fn test_paragraphs_group_up_to_target() {
        // ~30 tokens per paragraph, target 50: two paragraphs per chunk at
        // most, and sequences stay dense.
        let paragraph = "word ".repeat(24); // 120 chars -> 30 tokens
        let text = vec![paragraph.trim().to_string(); 6].join("\n\n");

        let chunker = Chunker::new(50, 10);
        let chunks = chunker.chunk(&text, "d");
        assert!(chunks.len() >= 3, "got {} chunks", chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
            assert!(chunk.token_count > 0);
        }
    }

    #[test]
    fn test_oversized_paragraph_splits_at_sentences() {
        // One paragraph, many sentences, far over target.
        let sentence = format!("{}.", "x".repeat(39)); // 10 tokens
        let text = vec![sentence; 20].join(" ");

        let chunker = Chunker::new(50, 10);
        let chunks = chunker.chunk(&text, "d");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 60, "chunk too large: {}", chunk.token_count);
        }
    }

    #[test]
    fn test_giant_sentence_splits_at_whitespace() {
        let text = "word ".repeat(600); // no sentence punctuation, ~750 tokens
        let chunker = Chunker::new(100, 10);
        let chunks = chunker.chunk(text.trim(), "d");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 110);
        }
    }

    #[test]
    fn test_chunk_ids_derive_from_document() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk("hello world", "doc-9");
        assert_eq!(chunks[0].id, "doc-9:chunk:0");
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("One. Two! Three? Four");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?", "Four"]);
    }
}
