use std::path::Path;

use crate::types::ItemId;

/// One input file in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    pub enabled: bool,
    pub completed: bool,
}

impl Item {
    fn new(id: ItemId) -> Self {
        Self {
            id,
            enabled: true,
            completed: false,
        }
    }
}

/// Ordered set of input items keyed by identity.
///
/// Every operation saturates: unknown identities are ignored rather than
/// reported. The registry is meant to be mutated from a single thread; task
/// completion events reach it by being drained on that thread.
#[derive(Debug, Clone, Default)]
pub struct ItemRegistry {
    items: Vec<Item>,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` enabled and not completed. Returns false if it was
    /// already present.
    pub fn add(&mut self, id: impl Into<ItemId>) -> bool {
        let id = id.into();
        if self.position(&id).is_some() {
            return false;
        }
        self.items.push(Item::new(id));
        true
    }

    /// Bulk insert, returning how many identities were new.
    pub fn add_all<I, T>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = T>,
        T: Into<ItemId>,
    {
        let mut inserted = 0;
        for id in ids {
            if self.add(id) {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn remove(&mut self, id: impl AsRef<Path>) -> bool {
        match self.position(id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn set_enabled(&mut self, id: impl AsRef<Path>, enabled: bool) {
        if let Some(item) = self.get_mut(id) {
            item.enabled = enabled;
        }
    }

    /// Record that `id` finished. A completed item is also disabled so the
    /// next run does not resubmit it unless the caller re-enables it.
    pub fn mark_completed(&mut self, id: impl AsRef<Path>) {
        if let Some(item) = self.get_mut(id) {
            item.completed = true;
            item.enabled = false;
        }
    }

    /// Clear every completion flag and re-enable all items.
    pub fn reset_completed(&mut self) {
        for item in &mut self.items {
            item.completed = false;
            item.enabled = true;
        }
    }

    /// Enabled identities in insertion order.
    pub fn enabled_identities(&self) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|item| item.enabled)
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn get(&self, id: impl AsRef<Path>) -> Option<&Item> {
        self.position(id).map(|index| &self.items[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.items.iter().filter(|item| item.completed).count()
    }

    fn get_mut(&mut self, id: impl AsRef<Path>) -> Option<&mut Item> {
        let index = self.position(id)?;
        Some(&mut self.items[index])
    }

    fn position(&self, id: impl AsRef<Path>) -> Option<usize> {
        let id = id.as_ref();
        self.items.iter().position(|item| item.id.path() == id)
    }
}
