use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use crate::shared::Tuple;

/// Pending tuples grouped by key, in the order the keys first appeared.
#[derive(Debug, Clone)]
pub(crate) struct Batches<K> {
    order: VecDeque<K>,
    groups: HashMap<K, Vec<Tuple>>,
}

impl<K> Default for Batches<K> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            groups: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Clone> Batches<K> {
    pub(crate) fn push(&mut self, key: K, tup: Tuple) {
        match self.groups.get_mut(&key) {
            Some(tuples) => tuples.push(tup),
            None => {
                self.order.push_back(key.clone());
                self.groups.insert(key, vec![tup]);
            }
        }
    }

    /// Removes the oldest batch.
    pub(crate) fn pop_front(&mut self) -> Option<(K, Vec<Tuple>)> {
        let key = self.order.pop_front()?;
        let tuples = self.groups.remove(&key).unwrap_or_default();
        Some((key, tuples))
    }

    /// Removes every batch and returns all their tuples in order.
    pub(crate) fn drain_tuples(&mut self) -> Vec<Tuple> {
        let mut groups = std::mem::take(&mut self.groups);
        self.order
            .drain(..)
            .filter_map(|key| groups.remove(&key))
            .flatten()
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
