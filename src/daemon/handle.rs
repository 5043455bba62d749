//! Generation-checked connection handles
//!
//! Connections are referenced by slot index plus generation. Removing an
//! entry bumps the slot generation, so any handle still floating around in a
//! task or a queue resolves to `None` instead of to whoever reuses the slot.

use std::fmt;

/// Opaque connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    /// Slot index, only meaningful together with the generation
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Bounded slot table issuing [`ConnId`] handles
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> HandleTable<T> {
    /// Create a table holding at most `capacity` live entries
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    /// Insert a value; gives it back when the table is full
    pub fn insert(&mut self, value: T) -> Result<ConnId, T> {
        if self.len >= self.capacity {
            return Err(value);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, value: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        Ok(ConnId { index, generation: slot.generation })
    }

    fn slot(&self, id: ConnId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub fn get(&self, id: ConnId) -> Option<&T> {
        self.slot(id).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Remove the entry and retire its handle
    pub fn remove(&mut self, id: ConnId) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Handles of every live entry
    pub fn ids(&self) -> Vec<ConnId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (ConnId { index: index as u32, generation: slot.generation }, value)
            })
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_is_not_found() {
        let mut table = HandleTable::new(4);
        let a = table.insert("app-a").unwrap();
        assert_eq!(table.remove(a), Some("app-a"));

        // Slot is reused, old handle must not see the new occupant
        let b = table.insert("app-b").unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.get(b), Some(&"app-b"));
    }

    #[test]
    fn test_capacity_limit() {
        let mut table = HandleTable::new(2);
        table.insert(1).unwrap();
        let second = table.insert(2).unwrap();
        assert_eq!(table.insert(3), Err(3));
        table.remove(second);
        assert!(table.insert(3).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_iter_yields_live_entries() {
        let mut table = HandleTable::new(8);
        let ids: Vec<_> = (0..4).map(|i| table.insert(i).unwrap()).collect();
        table.remove(ids[1]);
        let live: Vec<_> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![0, 2, 3]);
        assert_eq!(table.ids().len(), 3);
    }
}
