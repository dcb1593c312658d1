//! Topic trie for subscription matching
//!
//! A prefix tree keyed by `/`-separated topic levels. Supports the MQTT
//! wildcards `+` (single level) and `#` (multi level, last position only).
//!
//! Uses iterator-based traversal to avoid per-operation Vec allocations and
//! compact_str for level keys.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value stored at this node
    value: Option<V>,
    /// Children indexed by topic level
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Multi-level wildcard (#) value
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie mapping filters to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Insert a topic filter with associated value
    pub fn insert(&mut self, filter: &str, value: V) {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                node.multi_wildcard = Some(value);
                return;
            } else if level == "+" {
                if node.single_wildcard.is_none() {
                    node.single_wildcard = Some(Box::new(TrieNode::new()));
                }
                node = node.single_wildcard.as_mut().unwrap();
            } else {
                node = node.children.entry(CompactString::new(level)).or_default();
            }

            if is_last {
                node.value = Some(value);
                return;
            }
        }
    }

    /// Get a mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                return node.multi_wildcard.as_mut();
            } else if level == "+" {
                node = node.single_wildcard.as_mut()?;
            } else {
                node = node.children.get_mut(level)?;
            }

            if is_last {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a filter from the trie
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels, 0)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str], index: usize) -> Option<V> {
        if index >= levels.len() {
            return node.value.take();
        }

        let level = levels[index];

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                if let Some(ref mut child) = node.single_wildcard {
                    if index + 1 >= levels.len() {
                        child.value.take()
                    } else {
                        Self::remove_recursive(child, levels, index + 1)
                    }
                } else {
                    None
                }
            }
            _ => {
                if let Some(child) = node.children.get_mut(level) {
                    if index + 1 >= levels.len() {
                        child.value.take()
                    } else {
                        Self::remove_recursive(child, levels, index + 1)
                    }
                } else {
                    None
                }
            }
        }
    }

    /// Remove entries by predicate (returns true if the entry should go)
    pub fn remove_by_predicate<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::remove_by_predicate_recursive(&mut self.root, &mut pred);
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, pred: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if let Some(ref mut v) = node.value {
            if pred(v) {
                node.value = None;
            }
        }

        if let Some(ref mut v) = node.multi_wildcard {
            if pred(v) {
                node.multi_wildcard = None;
            }
        }

        if let Some(ref mut child) = node.single_wildcard {
            Self::remove_by_predicate_recursive(child, pred);
        }

        for child in node.children.values_mut() {
            Self::remove_by_predicate_recursive(child, pred);
        }
    }

    /// Visit the value of every filter present in the trie
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut callback);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            callback(v);
        }
        if let Some(ref v) = node.multi_wildcard {
            callback(v);
        }
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_recursive(child, callback);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, callback);
        }
    }

    /// Invoke the callback for every filter value matching the topic name
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // $-topics must not match wildcards at the first level
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        if !(is_system_topic && index == 0) {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        if index >= levels.len() {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        }

        let level = levels[index];

        if !(is_system_topic && index == 0) {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(level) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
