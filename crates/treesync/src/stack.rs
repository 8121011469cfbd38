//! Ancestor stack: directories held back until a descendant is emitted.
//!
//! The stack always holds the ancestor chain of the last entry considered,
//! shallowest at the bottom. Before looking at a new entry the caller trims
//! it back to the entry's parent with `truncate_while`.

#[derive(Debug, Clone)]
pub struct AncestorStack<T> {
    items: Vec<T>,
}

impl<T> Default for AncestorStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AncestorStack<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    /// Pop from the top while `pred` holds for the top item.
    pub fn truncate_while(&mut self, mut pred: impl FnMut(&T) -> bool) {
        while self.items.last().is_some_and(&mut pred) {
            self.items.pop();
        }
    }

    /// Remove every item, oldest first.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}
