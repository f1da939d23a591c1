//! Token counting with the `cl100k_base` BPE.
//!
//! The generation service uses its own tokenizer, so these counts are an
//! approximation used for chunk budgets and cost estimates. If the BPE
//! cannot be loaded the counter falls back to the four-characters-per-token
//! heuristic.

use tiktoken_rs::CoreBPE;

use restyle_core::chunk::estimate_tokens;

pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Self {
        let bpe = match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                tracing::warn!(error = %err, "cl100k_base unavailable, estimating tokens from length");
                None
            }
        };
        Self { bpe }
    }

    /// A counter that always uses the length heuristic.
    pub fn heuristic() -> Self {
        Self { bpe: None }
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => estimate_tokens(text),
        }
    }

    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpe_counts_words() {
        let counter = TokenCounter::new();
        assert!(counter.is_exact());
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("hello world"), 2);
    }

    #[test]
    fn heuristic_rounds_up() {
        let counter = TokenCounter::heuristic();
        assert_eq!(counter.count("abcde"), 2);
    }
}
