//! Recursive-character text splitter.
//!
//! Splits text on a descending ladder of separators (paragraph, line,
//! sentence, word, character) so that each emitted chunk stays within
//! `chunk_size` where possible and consecutive chunks share
//! `chunk_overlap` characters at their boundary.
//!
//! All sizes are counted in Unicode scalar values, never bytes, so chunks
//! are always valid UTF-8 slices.

/// Recursive character splitter with configurable size and overlap.
pub struct RecursiveCharacterSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<&'static str>,
}

impl RecursiveCharacterSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
            separators: vec!["\n\n", "\n", ". ", " ", ""],
        }
    }

    /// Split `text` into chunks.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[&'static str]) -> Vec<String> {
        // First separator that actually occurs in the text wins; the empty
        // separator always matches and splits into single characters.
        let mut separator = *separators.last().unwrap_or(&"");
        let mut remaining: &[&'static str] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let splits: Vec<String> = if separator.is_empty() {
            text.chars().map(|c| c.to_string()).collect()
        } else {
            text.split(separator).map(|s| s.to_string()).collect()
        };

        let mut chunks = Vec::new();
        let mut good: Vec<String> = Vec::new();

        for split in splits {
            if char_len(&split) <= self.chunk_size {
                good.push(split);
                continue;
            }

            if !good.is_empty() {
                chunks.extend(self.merge_splits(std::mem::take(&mut good), separator));
            }

            if remaining.is_empty() {
                chunks.push(split);
            } else {
                chunks.extend(self.split_recursive(&split, remaining));
            }
        }

        if !good.is_empty() {
            chunks.extend(self.merge_splits(good, separator));
        }

        chunks
    }

    /// Greedily pack splits into chunks, carrying `chunk_overlap` characters
    /// of trailing splits into the next chunk.
    fn merge_splits(&self, splits: Vec<String>, separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut total = 0usize;

        for split in splits {
            let len = char_len(&split);
            let sep_cost = if current.is_empty() { 0 } else { sep_len };

            if total + len + sep_cost > self.chunk_size && !current.is_empty() {
                let joined = current.join(separator);
                if !joined.trim().is_empty() {
                    chunks.push(joined);
                }

                // Drop leading splits until the carried tail fits the
                // overlap budget and leaves room for the incoming split.
                while total > self.chunk_overlap
                    || (total + len + if current.is_empty() { 0 } else { sep_len }
                        > self.chunk_size
                        && total > 0)
                {
                    let removed = current.remove(0);
                    total -= char_len(&removed) + if current.is_empty() { 0 } else { sep_len };
                    if current.is_empty() {
                        break;
                    }
                }
            }

            total += len + if current.is_empty() { 0 } else { sep_len };
            current.push(split);
        }

        let joined = current.join(separator);
        if !joined.trim().is_empty() {
            chunks.push(joined);
        }

        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        let splitter = RecursiveCharacterSplitter::new(1000, 200);
        let chunks = splitter.split_text("Hello, world!");
        assert_eq!(chunks, vec!["Hello, world!"]);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let splitter = RecursiveCharacterSplitter::new(1000, 200);
        assert!(splitter.split_text("").is_empty());
    }

    #[test]
    fn test_splits_on_paragraphs_first() {
        let splitter = RecursiveCharacterSplitter::new(25, 0);
        let chunks = splitter.split_text("First paragraph here.\n\nSecond paragraph here.");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "First paragraph here.");
        assert_eq!(chunks[1], "Second paragraph here.");
    }

    #[test]
    fn test_chunks_respect_size_where_possible() {
        let splitter = RecursiveCharacterSplitter::new(15, 0);
        let text = "one two three four five six seven eight nine ten";
        for chunk in splitter.split_text(text) {
            assert!(chunk.chars().count() <= 15, "oversized chunk: {chunk:?}");
        }
    }

    #[test]
    fn test_overlap_carries_trailing_split() {
        let splitter = RecursiveCharacterSplitter::new(10, 5);
        let chunks = splitter.split_text("aaaa bbbb cccc dddd");
        assert_eq!(chunks[0], "aaaa bbbb");
        assert!(chunks[1].starts_with("bbbb"), "chunks: {chunks:?}");
    }

    #[test]
    fn test_zero_overlap_partitions() {
        let splitter = RecursiveCharacterSplitter::new(10, 0);
        let chunks = splitter.split_text("aaaa bbbb cccc dddd");
        assert_eq!(chunks, vec!["aaaa bbbb", "cccc dddd"]);
    }

    #[test]
    fn test_multibyte_never_panics() {
        // Each 'é' is two bytes; any byte-based slicing would panic here.
        let splitter = RecursiveCharacterSplitter::new(7, 2);
        let text = "ééééééééééééééééééééééééé";
        let chunks = splitter.split_text(text);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.chars().all(|c| c == 'é'));
        }
    }

    #[test]
    fn test_long_word_falls_through_to_characters() {
        let splitter = RecursiveCharacterSplitter::new(4, 0);
        let chunks = splitter.split_text("abcdefghij");
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
        assert_eq!(chunks.concat(), "abcdefghij");
    }

    #[test]
    fn test_deterministic() {
        let splitter = RecursiveCharacterSplitter::new(12, 4);
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta.\n\nEta theta iota.";
        assert_eq!(splitter.split_text(text), splitter.split_text(text));
    }
}
