//! Memory spaces backing the data path
//!
//! Creating and mapping RDMA memory spaces belongs to the fabric service;
//! the broker only needs to pick one that is not in use when a connection is
//! established and hand it back when the connection is torn down.

use crate::daemon::error::RsktError;

/// A memory space (plus the sub-space used by one connection)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySpace {
    /// Fabric-wide name of the memory space
    pub name: String,
    /// Owner handle of the memory space
    pub owner: u64,
    /// Total size in bytes
    pub size: u32,
    /// Sub-space placement inside the memory space
    pub sub_offset: u32,
    pub sub_size: u32,
}

/// Source of memory spaces for new connections
pub trait MemorySpaceProvider: Send {
    /// Reserve a memory space not currently in use
    fn acquire(&mut self) -> Result<MemorySpace, RsktError>;

    /// Return a memory space obtained from [`MemorySpaceProvider::acquire`]
    fn release(&mut self, ms: &MemorySpace);

    /// Number of memory spaces currently handed out
    fn in_use(&self) -> usize;
}

/// Fixed set of pre-created memory spaces
pub struct MemorySpacePool {
    spaces: Vec<(MemorySpace, bool)>,
}

impl MemorySpacePool {
    /// `count` spaces of `size` bytes named after the owning node
    pub fn new(ct: u32, count: usize, size: u32) -> Self {
        let spaces = (0..count)
            .map(|i| {
                let ms = MemorySpace {
                    name: format!("RSKT{:08x}.{:04}", ct, i),
                    owner: ((ct as u64) << 32) | i as u64,
                    size,
                    sub_offset: 0,
                    sub_size: size,
                };
                (ms, false)
            })
            .collect();
        Self { spaces }
    }

    /// Total number of memory spaces in the pool
    pub fn capacity(&self) -> usize {
        self.spaces.len()
    }
}

impl MemorySpaceProvider for MemorySpacePool {
    fn acquire(&mut self) -> Result<MemorySpace, RsktError> {
        let (ms, in_use) = self
            .spaces
            .iter_mut()
            .find(|(_, in_use)| !*in_use)
            .ok_or(RsktError::NoMemorySpace)?;
        *in_use = true;
        Ok(ms.clone())
    }

    fn release(&mut self, ms: &MemorySpace) {
        match self.spaces.iter_mut().find(|(space, _)| space.name == ms.name) {
            Some((_, in_use)) => *in_use = false,
            None => tracing::warn!(ms = %ms.name, "release of unknown memory space"),
        }
    }

    fn in_use(&self) -> usize {
        self.spaces.iter().filter(|(_, in_use)| *in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let mut pool = MemorySpacePool::new(0x20, 2, 4096);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.name, b.name);
        assert_eq!(pool.acquire(), Err(RsktError::NoMemorySpace));
        assert_eq!(pool.in_use(), 2);

        pool.release(&a);
        assert_eq!(pool.acquire().unwrap().name, a.name);
    }

    #[test]
    fn test_names_carry_component_tag() {
        let mut pool = MemorySpacePool::new(0xab, 1, 1024);
        let ms = pool.acquire().unwrap();
        assert_eq!(ms.name, "RSKT000000ab.0000");
        assert_eq!(ms.sub_size, 1024);
        assert_eq!(pool.capacity(), 1);
    }
}
