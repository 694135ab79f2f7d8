//! Incremental sentence splitting over streamed tokens.

/// Accumulates streamed text and hands out complete sentences.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace. Text after the
/// last boundary stays buffered until more arrives.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `token` and return every sentence it completed.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        let mut start = 0;
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if !matches!(c, '.' | '!' | '?') {
                continue;
            }
            let Some(&(next_idx, next)) = chars.peek() else {
                break;
            };
            if next.is_whitespace() {
                let sentence = self.buffer[start..next_idx].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = next_idx;
            }
        }

        self.buffer.replace_range(..start, "");
        sentences
    }

    /// Text received since the last boundary.
    pub fn pending(&self) -> &str {
        self.buffer.trim()
    }

    /// Take whatever is left as a final sentence.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Drop the unfinished sentence.
    pub fn discard(&mut self) {
        self.buffer.clear();
    }
}
