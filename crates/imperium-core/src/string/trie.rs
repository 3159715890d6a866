use std::collections::HashMap;

/// A match reported by [`TrieMap::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<V> {
    /// The matched slice of the scanned text.
    pub word: String,
    /// Character (not byte) index of the first matched character.
    pub index: usize,
    pub value: V,
}

/// Prefix tree mapping words to values, one `char` per edge.
#[derive(Debug, Clone)]
pub struct TrieMap<V> {
    children: HashMap<char, TrieMap<V>>,
    value: Option<V>,
}

impl<V> Default for TrieMap<V> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            value: None,
        }
    }
}

struct Partial<'a, V> {
    node: &'a TrieMap<V>,
    index: usize,
    offset: usize,
}

impl<V> TrieMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Insert `word`, returning the value it previously held.
    pub fn insert(&mut self, word: &str, value: V) -> Option<V> {
        let mut node = self;
        for c in word.chars() {
            node = node.children.entry(c).or_default();
        }
        node.value.replace(value)
    }

    pub fn get(&self, word: &str) -> Option<&V> {
        self.node(word).and_then(|node| node.value.as_ref())
    }

    /// Whether `word` is stored, or with `partial`, whether it is a prefix
    /// of a stored word.
    pub fn contains(&self, word: &str, partial: bool) -> bool {
        self.node(word)
            .is_some_and(|node| partial || node.value.is_some())
    }

    /// Scan `text` once, left to right, reporting every stored word found
    /// anywhere in it.
    ///
    /// A partial match is started at every position, so overlapping words
    /// (`cat` and `catch` at the same index, `cat` inside `concat`) are all
    /// reported. Tokens come out ordered by end position, then by start.
    pub fn search<'a>(&'a self, text: &str) -> Vec<Token<&'a V>> {
        let mut tokens = Vec::new();
        let mut partials: Vec<Partial<'a, V>> = Vec::new();

        for (index, (offset, c)) in text.char_indices().enumerate() {
            if !self.children.is_empty() {
                partials.push(Partial {
                    node: self,
                    index,
                    offset,
                });
            }

            let end = offset + c.len_utf8();
            partials.retain_mut(|partial| {
                let node = partial.node;
                let Some(child) = node.children.get(&c) else {
                    return false;
                };
                partial.node = child;
                if let Some(value) = &child.value {
                    tokens.push(Token {
                        word: text[partial.offset..end].to_string(),
                        index: partial.index,
                        value,
                    });
                }
                true
            });
        }

        tokens
    }

    fn node(&self, word: &str) -> Option<&Self> {
        let mut node = self;
        for c in word.chars() {
            node = node.children.get(&c)?;
        }
        Some(node)
    }
}

impl<S: AsRef<str>, V> FromIterator<(S, V)> for TrieMap<V> {
    fn from_iter<I: IntoIterator<Item = (S, V)>>(iter: I) -> Self {
        let mut trie = Self::new();
        for (word, value) in iter {
            trie.insert(word.as_ref(), value);
        }
        trie
    }
}
