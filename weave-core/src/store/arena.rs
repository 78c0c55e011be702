//! Generational node arena.
//!
//! Nodes live in a [`Slab`], so the slot of a collected node is reused by
//! the next allocation. Every allocation gets a fresh generation and an id
//! only resolves while its generation matches.

use slab::Slab;

use super::value::NodeId;

struct Entry<T> {
    generation: u32,
    data: T,
}

pub(crate) struct Arena<T> {
    slots: Slab<Entry<T>>,
    next_generation: u32,
}

impl<T> Arena<T> {
    /// An arena holding `root` at [`NodeId::ROOT`].
    pub fn with_root(root: T) -> Self {
        let mut slots = Slab::new();
        slots.insert(Entry {
            generation: NodeId::ROOT.generation(),
            data: root,
        });
        Self {
            slots,
            next_generation: NodeId::ROOT.generation() + 1,
        }
    }

    pub fn alloc(&mut self, data: T) -> NodeId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let entry = self.slots.vacant_entry();
        let id = NodeId::new(entry.key(), generation);
        entry.insert(Entry { generation, data });
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.slots
            .get(id.index())
            .filter(|entry| entry.generation == id.generation())
            .map(|entry| &entry.data)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .filter(|entry| entry.generation == id.generation())
            .map(|entry| &mut entry.data)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a node. The root is never freed.
    pub fn free(&mut self, id: NodeId) -> Option<T> {
        if id == NodeId::ROOT || !self.contains(id) {
            return None;
        }
        Some(self.slots.remove(id.index()).data)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .map(|(index, entry)| NodeId::new(index, entry.generation))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
