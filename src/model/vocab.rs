use std::ops::Range;

/// Token table stored as one owned blob. Emitted [`Token`](crate::Token)
/// records borrow their text straight from here, so the strings stay valid
/// for the model's lifetime.
pub struct Vocabulary {
    blob: String,
    spans: Vec<Range<u32>>,
}

impl Vocabulary {
    pub fn from_tokens<I, S>(tokens: I) -> Vocabulary
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blob = String::new();
        let mut spans = Vec::new();

        for token in tokens {
            let start = blob.len() as u32;
            blob.push_str(token.as_ref());
            spans.push(start..blob.len() as u32);
        }

        Vocabulary { blob, spans }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Text of token `id`; empty for out-of-range ids.
    pub fn token(&self, id: usize) -> &str {
        match self.spans.get(id) {
            Some(span) => &self.blob[span.start as usize..span.end as usize],
            None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_original_text() {
        let vocab = Vocabulary::from_tokens(["<blk>", " hello", " world", "."]);
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.token(0), "<blk>");
        assert_eq!(vocab.token(1), " hello");
        assert_eq!(vocab.token(3), ".");
    }

    #[test]
    fn out_of_range_is_empty() {
        let vocab = Vocabulary::from_tokens([" hi"]);
        assert_eq!(vocab.token(7), "");
    }

    #[test]
    fn handles_multibyte_tokens() {
        let vocab = Vocabulary::from_tokens([" héllo", "日本"]);
        assert_eq!(vocab.token(0), " héllo");
        assert_eq!(vocab.token(1), "日本");
    }
}
