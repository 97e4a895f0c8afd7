/// Regroups streamed text fragments into whole words.
///
/// Each emitted chunk is one whitespace-delimited word followed by a single
/// space. A word is held back until the whitespace that ends it arrives, so
/// tokens that split a word in the middle never reach the client half-done.
#[derive(Debug, Default)]
pub struct WordChunker {
    partial: String,
}

impl WordChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a fragment and returns the words it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        let mut words = Vec::new();
        for ch in fragment.chars() {
            if ch.is_whitespace() {
                if !self.partial.is_empty() {
                    words.push(self.take_word());
                }
            } else {
                self.partial.push(ch);
            }
        }
        words
    }

    /// Flushes the trailing word, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take_word())
        }
    }

    fn take_word(&mut self) -> String {
        let mut word = std::mem::take(&mut self.partial);
        word.push(' ');
        word
    }
}
