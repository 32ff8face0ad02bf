//! Size-classed page-backed allocator.
//!
//! Blocks are address-stable, optionally executable, and reused through
//! power-of-two size classes (64 B .. 1 MiB). Freed blocks go onto their
//! class free list and are never returned to the OS eagerly; mapped
//! regions are only released when the allocator is dropped.

use std::collections::{BTreeMap, HashMap};
use std::ptr;

use thiserror::Error;

use crate::page::{HostPages, PageBackend, ProtectionProfile};

/// Smallest size class in bytes.
const MIN_SIZE_CLASS: usize = 64;
/// Number of power-of-two size classes (64 B .. 1 MiB).
const SIZE_CLASS_COUNT: usize = 15;

/// Allocation failures.
///
/// All variants are fatal to the failing call; nothing is retried
/// internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    /// Requested size is zero or exceeds the largest size class
    #[error("invalid allocation size: {0} bytes")]
    InvalidSize(usize),
    /// Address is not a live allocation
    #[error("invalid memory address: {0:#x}")]
    InvalidAddress(usize),
    /// OS mapping or unmapping failed
    #[error("memory mapping failed: {0}")]
    Map(String),
    /// OS protection change failed
    #[error("memory protection change failed: {0}")]
    Protect(String),
}

/// A single allocated memory block.
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    /// Start address of the mapped region
    pub address: usize,
    /// Mapped size in bytes (page-aligned)
    pub size: usize,
    /// Size class this block is filed under when free
    pub size_class: usize,
    /// Whether the pages are currently executable
    pub executable: bool,
    /// Shared-ownership count; the block is live while this is above zero
    pub refcount: u32,
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageStats {
    /// Bytes currently held by live blocks
    pub total_allocated: usize,
    /// Number of live blocks
    pub active_blocks: usize,
    /// Number of blocks parked on free lists
    pub free_blocks: usize,
    /// Free-list length per size class
    pub class_free_counts: BTreeMap<usize, usize>,
}

/// Page-backed allocator with size-class reuse and refcounted blocks.
///
/// # Examples
///
/// ```
/// use memory_manager::MemoryAllocator;
///
/// let mut allocator = MemoryAllocator::new();
/// let address = allocator.allocate(128, false).unwrap();
/// allocator.free(address).unwrap();
/// assert_eq!(allocator.usage_stats().total_allocated, 0);
/// ```
#[derive(Debug)]
pub struct MemoryAllocator {
    live: HashMap<usize, MemoryBlock>,
    free_blocks: BTreeMap<usize, Vec<MemoryBlock>>,
    size_classes: Vec<usize>,
    page_size: usize,
    total_allocated: usize,
    profile: ProtectionProfile,
    pages: HostPages,
}

impl MemoryAllocator {
    /// Create an allocator configured for the host platform.
    pub fn new() -> Self {
        Self::with_profile(ProtectionProfile::host())
    }

    /// Create an allocator with an explicit protection profile.
    pub fn with_profile(profile: ProtectionProfile) -> Self {
        let pages = HostPages;
        let size_classes: Vec<usize> = (0..SIZE_CLASS_COUNT)
            .map(|i| MIN_SIZE_CLASS << i)
            .collect();
        let free_blocks = size_classes.iter().map(|&class| (class, Vec::new())).collect();

        Self {
            live: HashMap::new(),
            free_blocks,
            page_size: pages.page_size(),
            size_classes,
            total_allocated: 0,
            profile,
            pages,
        }
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The size is rounded up to the nearest power-of-two class; a free
    /// block of that class is reused when available (its protection reset
    /// to match `executable`), otherwise a fresh page-aligned region is
    /// mapped.
    ///
    /// # Arguments
    ///
    /// * `size` - Requested size in bytes; must be non-zero and at most
    ///   the largest size class
    /// * `executable` - Whether the pages must be executable
    ///
    /// # Returns
    ///
    /// The address of the block, stable until freed.
    pub fn allocate(&mut self, size: usize, executable: bool) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize(0));
        }
        let size_class = self.size_class_for(size)?;

        if let Some(mut block) = self
            .free_blocks
            .get_mut(&size_class)
            .and_then(|list| list.pop())
        {
            let flags = self.profile.flags_for(executable);
            if let Err(err) = self.pages.protect(block.address, block.size, flags) {
                // The block stays reusable; only this call fails.
                if let Some(list) = self.free_blocks.get_mut(&size_class) {
                    list.push(block);
                }
                return Err(err);
            }
            block.executable = executable;
            block.refcount = 1;
            let address = block.address;
            self.total_allocated += block.size;
            self.live.insert(address, block);
            return Ok(address);
        }

        let aligned = self.page_align(size);
        let address = self.pages.map(aligned, self.profile.flags_for(executable))?;
        self.live.insert(
            address,
            MemoryBlock {
                address,
                size: aligned,
                size_class,
                executable,
                refcount: 1,
            },
        );
        self.total_allocated += aligned;
        Ok(address)
    }

    /// Allocate an executable block (JIT code pages).
    pub fn allocate_executable(&mut self, size: usize) -> Result<usize, AllocError> {
        self.allocate(size, true)
    }

    /// Resize a block, moving it if it must grow.
    ///
    /// Shrinking returns the same address; growing allocates a new block,
    /// copies the old contents, and frees the original.
    pub fn reallocate(&mut self, address: usize, new_size: usize) -> Result<usize, AllocError> {
        if new_size == 0 {
            return Err(AllocError::InvalidSize(0));
        }
        let (old_size, executable) = match self.live.get(&address) {
            Some(block) => (block.size, block.executable),
            None => return Err(AllocError::InvalidAddress(address)),
        };

        if new_size <= old_size {
            return Ok(address);
        }

        let new_address = self.allocate(new_size, executable)?;
        // SAFETY: both regions are live mappings we own; they cannot
        // overlap because new_address was just mapped or taken from the
        // free list while `address` is still in the live table
        unsafe {
            ptr::copy_nonoverlapping(
                address as *const u8,
                new_address as *mut u8,
                old_size.min(new_size),
            );
        }
        self.free(address)?;
        Ok(new_address)
    }

    /// Release one reference to a block.
    ///
    /// When the refcount reaches zero the block leaves the live table and
    /// is parked on its size class's free list for reuse.
    pub fn free(&mut self, address: usize) -> Result<(), AllocError> {
        let block = self
            .live
            .get_mut(&address)
            .ok_or(AllocError::InvalidAddress(address))?;

        block.refcount -= 1;
        if block.refcount == 0 {
            let block = self
                .live
                .remove(&address)
                .ok_or(AllocError::InvalidAddress(address))?;
            self.total_allocated -= block.size;
            self.free_blocks
                .entry(block.size_class)
                .or_default()
                .push(block);
        }
        Ok(())
    }

    /// Add a reference to a block for shared-ownership aliasing.
    pub fn reference(&mut self, address: usize) -> Result<(), AllocError> {
        let block = self
            .live
            .get_mut(&address)
            .ok_or(AllocError::InvalidAddress(address))?;
        block.refcount += 1;
        Ok(())
    }

    /// Toggle a live block between data and executable protection.
    pub fn set_executable(&mut self, address: usize, executable: bool) -> Result<(), AllocError> {
        let (size, current) = match self.live.get(&address) {
            Some(block) => (block.size, block.executable),
            None => return Err(AllocError::InvalidAddress(address)),
        };
        if current == executable {
            return Ok(());
        }
        self.pages
            .protect(address, size, self.profile.flags_for(executable))?;
        if let Some(block) = self.live.get_mut(&address) {
            block.executable = executable;
        }
        Ok(())
    }

    /// Current usage statistics.
    pub fn usage_stats(&self) -> UsageStats {
        UsageStats {
            total_allocated: self.total_allocated,
            active_blocks: self.live.len(),
            free_blocks: self.free_blocks.values().map(Vec::len).sum(),
            class_free_counts: self
                .free_blocks
                .iter()
                .map(|(&class, list)| (class, list.len()))
                .collect(),
        }
    }

    /// Refcount of a live block, if the address is live.
    pub fn refcount(&self, address: usize) -> Option<u32> {
        self.live.get(&address).map(|block| block.refcount)
    }

    /// Whether a live block is currently executable.
    pub fn is_executable(&self, address: usize) -> Option<bool> {
        self.live.get(&address).map(|block| block.executable)
    }

    /// Whether an address refers to a live block.
    pub fn is_live(&self, address: usize) -> bool {
        self.live.contains_key(&address)
    }

    /// Release every live block to the free lists (shutdown path).
    ///
    /// Refcounts are ignored: after cleanup nothing is live. Mapped
    /// regions remain reserved for reuse until the allocator is dropped.
    pub fn cleanup(&mut self) {
        let addresses: Vec<usize> = self.live.keys().copied().collect();
        for address in addresses {
            if let Some(mut block) = self.live.remove(&address) {
                block.refcount = 0;
                self.free_blocks
                    .entry(block.size_class)
                    .or_default()
                    .push(block);
            }
        }
        self.total_allocated = 0;
    }

    fn size_class_for(&self, size: usize) -> Result<usize, AllocError> {
        self.size_classes
            .iter()
            .find(|&&class| class >= size)
            .copied()
            .ok_or(AllocError::InvalidSize(size))
    }

    fn page_align(&self, size: usize) -> usize {
        (size + self.page_size - 1) & !(self.page_size - 1)
    }
}

impl Default for MemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        for block in self.live.values() {
            let _ = self.pages.unmap(block.address, block.size);
        }
        for list in self.free_blocks.values() {
            for block in list {
                let _ = self.pages.unmap(block.address, block.size);
            }
        }
    }
}
