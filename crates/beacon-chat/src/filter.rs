use std::collections::HashSet;

/// Decides whether a chat body may be posted.
pub trait MessageFilter: Send + Sync + 'static {
    fn allow(&self, body: &str) -> bool;
}

/// Rejects bodies containing any listed word, compared case-insensitively
/// on whole words.
#[derive(Debug, Default, Clone)]
pub struct WordListFilter {
    words: HashSet<String>,
}

impl WordListFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    /// Comma or newline separated list, as stored in config or a file.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split([',', '\n']))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl MessageFilter for WordListFilter {
    fn allow(&self, body: &str) -> bool {
        if self.words.is_empty() {
            return true;
        }
        !body
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .any(|w| self.words.contains(&w.to_lowercase()))
    }
}
