//! Boundary-preserving content splitter.
//!
//! Content longer than the effective limit is split into overlapping
//! chunks. Split points are chosen by priority — paragraph break, line
//! break, sentence end, word gap — falling back to a hard cut only when
//! a window contains none of those. The overlap keeps local context
//! intact for retrieval across chunk seams.

/// Default overlap between consecutive chunks, characters.
pub const DEFAULT_OVERLAP: usize = 50;

/// Boundary-preserving splitter.
#[derive(Debug, Clone)]
pub struct ContentSplitter {
    max_len: usize,
    overlap: usize,
    preserve_boundaries: bool,
}

impl ContentSplitter {
    /// Creates a splitter for the given chunk size and overlap.
    ///
    /// The overlap is clamped below `max_len` so every step makes
    /// forward progress.
    #[must_use]
    pub fn new(max_len: usize, overlap: usize, preserve_boundaries: bool) -> Self {
        let max_len = max_len.max(2);
        Self {
            max_len,
            overlap: overlap.min(max_len / 2),
            preserve_boundaries,
        }
    }

    /// Whether `content` fits in a single chunk.
    #[must_use]
    pub fn fits(&self, content: &str) -> bool {
        content.chars().count() <= self.max_len
    }

    /// Splits `content` into chunks of at most `max_len` characters.
    ///
    /// Content that fits comes back as a single element. Consecutive
    /// chunks share `overlap` characters of context.
    #[must_use]
    pub fn split(&self, content: &str) -> Vec<String> {
        let chars: Vec<char> = content.chars().collect();
        if chars.len() <= self.max_len {
            return vec![content.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let window_end = (start + self.max_len).min(chars.len());
            let end = if window_end == chars.len() {
                window_end
            } else if self.preserve_boundaries {
                self.pick_boundary(&chars, start, window_end)
            } else {
                window_end
            };

            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            // Step back by the overlap, but always past the previous start.
            start = end.saturating_sub(self.overlap).max(start + 1);
        }
        chunks
    }

    /// Finds the best split point in `(start, window_end]`, searching
    /// backwards by boundary priority. Boundaries in the first half of
    /// the window are ignored so chunks stay reasonably full.
    fn pick_boundary(&self, chars: &[char], start: usize, window_end: usize) -> usize {
        let floor = start + self.max_len / 2;

        // Paragraph break: split after the blank line
        for i in (floor..window_end.saturating_sub(1)).rev() {
            if chars[i] == '\n' && chars[i + 1] == '\n' {
                return i + 2;
            }
        }
        // Line break
        for i in (floor..window_end).rev() {
            if chars[i] == '\n' {
                return i + 1;
            }
        }
        // Sentence end followed by a space
        for i in (floor..window_end.saturating_sub(1)).rev() {
            if matches!(chars[i], '.' | '!' | '?') && chars[i + 1] == ' ' {
                return i + 2;
            }
        }
        // Word gap
        for i in (floor..window_end).rev() {
            if chars[i] == ' ' {
                return i + 1;
            }
        }
        // Hard cut
        window_end
    }
}

impl Default for ContentSplitter {
    fn default() -> Self {
        Self::new(800, DEFAULT_OVERLAP, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_content_is_single_chunk() {
        let splitter = ContentSplitter::new(100, 10, true);
        let chunks = splitter.split("short text");
        assert_eq!(chunks, vec!["short text"]);
    }

    #[test]
    fn test_content_exactly_at_limit_is_single_chunk() {
        let splitter = ContentSplitter::new(100, 10, true);
        let content = "y".repeat(100);
        assert!(splitter.fits(&content));
        assert_eq!(splitter.split(&content).len(), 1);
    }

    #[test]
    fn test_one_char_over_limit_splits_in_two() {
        let splitter = ContentSplitter::new(100, 10, true);
        let content = "y".repeat(101);
        assert!(!splitter.fits(&content));
        assert_eq!(splitter.split(&content).len(), 2);
    }

    #[test]
    fn test_uniform_text_chunk_count() {
        // 2000 chars, window 800, overlap 50: steps of 750 give 3 chunks
        let splitter = ContentSplitter::new(800, 50, true);
        let content = "z".repeat(2_000);
        let chunks = splitter.split(&content);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 800);
        }
    }

    #[test]
    fn test_chunks_overlap() {
        let splitter = ContentSplitter::new(100, 20, false);
        let content: String = (0..250).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = splitter.split(&content);
        assert!(chunks.len() >= 3);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(20).collect::<Vec<_>>().iter().rev().collect();
            assert!(pair[1].starts_with(&tail));
        }
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let mut content = "a".repeat(70);
        content.push_str("\n\n");
        content.push_str(&"b".repeat(70));
        let splitter = ContentSplitter::new(100, 0, true);
        let chunks = splitter.split(&content);
        assert_eq!(chunks[0], format!("{}\n\n", "a".repeat(70)));
    }

    #[test]
    fn test_prefers_sentence_over_word_boundary() {
        let mut content = String::from("First part of the sentence ends here. ");
        content.push_str("then more words follow without punctuation ");
        content.push_str(&"trailing words ".repeat(10));
        let splitter = ContentSplitter::new(60, 0, true);
        let chunks = splitter.split(&content);
        assert!(chunks[0].ends_with(". "));
    }

    #[test]
    fn test_reconstruction_with_overlap_removed() {
        let splitter = ContentSplitter::new(80, 15, false);
        let content: String = "0123456789".repeat(40);
        let chunks = splitter.split(&content);

        let mut rebuilt = chunks[0].clone();
        for chunk in &chunks[1..] {
            let chars: Vec<char> = chunk.chars().collect();
            rebuilt.extend(chars[15.min(chars.len())..].iter());
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_unicode_content_splits_on_char_boundaries() {
        let splitter = ContentSplitter::new(50, 5, true);
        let content = "héllo wörld ".repeat(20);
        let chunks = splitter.split(&content);
        assert!(chunks.len() > 1);
        // Round-tripping through chars would panic on broken boundaries
        for chunk in chunks {
            assert!(chunk.chars().count() <= 50);
        }
    }

    #[test]
    fn test_always_makes_progress() {
        // Degenerate window/overlap ratios must still terminate
        let splitter = ContentSplitter::new(2, 10, true);
        let chunks = splitter.split(&"abcdef".repeat(10));
        assert!(!chunks.is_empty());
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(total >= 60);
    }
}
