//! Key-addressed map with an intrusive recency list.
//!
//! Entries live in a slab (`Vec<Option<Slot>>`) and are linked by index, so
//! touching, inserting at the front and popping the tail are all O(1).

use std::collections::HashMap;

#[derive(Debug)]
struct Slot<V> {
    key: String,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct LruMap<V> {
    index: HashMap<String, usize>,
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<V> Default for LruMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> LruMap<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Look up `key` and move it to the front of the recency list.
    pub fn get_mut_touch(&mut self, key: &str) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.unlink(idx);
        self.push_front_link(idx);
        self.slots[idx].as_mut().map(|slot| &mut slot.value)
    }

    /// Look up `key` without changing its recency.
    pub fn peek_mut(&mut self, key: &str) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_mut().map(|slot| &mut slot.value)
    }

    /// Insert a new entry at the front. The caller guarantees `key` is absent.
    pub fn push_front(&mut self, key: String, value: V) {
        let slot = Slot {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        };
        self.index.insert(key, idx);
        self.push_front_link(idx);
    }

    /// Least recently used entry.
    #[must_use]
    pub fn peek_tail(&self) -> Option<(&str, &V)> {
        let idx = self.tail?;
        self.slots[idx]
            .as_ref()
            .map(|slot| (slot.key.as_str(), &slot.value))
    }

    pub fn pop_tail(&mut self) -> Option<(String, V)> {
        let idx = self.tail?;
        self.remove_index(idx)
    }

    #[cfg(test)]
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.remove_index(idx).map(|(_, value)| value)
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let slot = self.slots[idx].as_ref()?;
            cursor = slot.next;
            Some(slot.key.as_str())
        })
    }

    fn remove_index(&mut self, idx: usize) -> Option<(String, V)> {
        self.unlink(idx);
        let slot = self.slots[idx].take()?;
        self.index.remove(&slot.key);
        self.free.push(idx);
        Some((slot.key, slot.value))
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(slot) = self.slots[p].as_mut() {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(n) => {
                if let Some(slot) = self.slots[n].as_mut() {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }

    fn push_front_link(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head
            && let Some(slot) = self.slots[h].as_mut()
        {
            slot.prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(map: &LruMap<u32>) -> Vec<String> {
        map.keys().map(str::to_string).collect()
    }

    #[test]
    fn push_front_orders_most_recent_first() {
        let mut map = LruMap::new();
        map.push_front("a".into(), 1);
        map.push_front("b".into(), 2);
        map.push_front("c".into(), 3);
        assert_eq!(keys(&map), ["c", "b", "a"]);
        assert_eq!(map.peek_tail().map(|(k, _)| k), Some("a"));
    }

    #[test]
    fn touch_moves_entry_to_front() {
        let mut map = LruMap::new();
        map.push_front("a".into(), 1);
        map.push_front("b".into(), 2);
        map.push_front("c".into(), 3);

        *map.get_mut_touch("a").unwrap() += 10;
        assert_eq!(keys(&map), ["a", "c", "b"]);
        assert_eq!(map.peek_tail().map(|(k, v)| (k, *v)), Some(("b", 2)));
        assert_eq!(*map.peek_mut("a").unwrap(), 11);
    }

    #[test]
    fn peek_does_not_change_order() {
        let mut map = LruMap::new();
        map.push_front("a".into(), 1);
        map.push_front("b".into(), 2);
        map.peek_mut("a");
        assert_eq!(keys(&map), ["b", "a"]);
    }

    #[test]
    fn pop_tail_and_slot_reuse() {
        let mut map = LruMap::new();
        map.push_front("a".into(), 1);
        map.push_front("b".into(), 2);

        assert_eq!(map.pop_tail(), Some(("a".to_string(), 1)));
        assert_eq!(map.len(), 1);

        map.push_front("c".into(), 3);
        assert_eq!(keys(&map), ["c", "b"]);
        assert_eq!(map.remove("b"), Some(2));
        assert_eq!(keys(&map), ["c"]);
        assert_eq!(map.pop_tail(), Some(("c".to_string(), 3)));
        assert!(map.is_empty());
        assert!(map.pop_tail().is_none());
    }
}
