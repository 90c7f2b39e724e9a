use super::allocator::{
    system_alloc_fn, system_dealloc_fn, AllocFn, Allocator, AllocatorState, DeallocFn,
};
use crate::sync::{Arc, RwLock};
use crate::util;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Node states of the per-block binary tree.
///
/// - `Used`: the node is a live allocation; descendants are irrelevant.
/// - `Split`: at least one descendant is occupied.
/// - `Full`: both subtrees are completely occupied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Unused,
    Used,
    Split,
    Full,
}

// ---------------------------------------------------------------------------
// binary-tree index math (root at 0, children at 2i+1 / 2i+2)
// ---------------------------------------------------------------------------

#[inline]
fn parent(index: usize) -> usize {
    if index > 0 {
        (index + 1) / 2 - 1
    } else {
        0
    }
}

#[inline]
fn left(index: usize) -> usize {
    2 * index + 1
}

#[inline]
fn right(index: usize) -> usize {
    2 * index + 2
}

/// Sibling of `index`, 0 for the root (which has none).
#[inline]
fn buddy_of(index: usize) -> usize {
    if index > 0 {
        index - 1 + (index & 1) * 2
    } else {
        0
    }
}

/// Leaf offset served by node `index` at `level`, in min-block units.
#[inline]
fn index_offset(index: usize, level: u32, max_level: u32) -> usize {
    ((index + 1) - (1usize << level)) << (max_level - level)
}

// ---------------------------------------------------------------------------
// tree operations, all iterative
// ---------------------------------------------------------------------------

/// Mark ancestors `Full` while the sibling subtree is completely occupied.
fn mark_parent(tree: &mut [NodeState], mut index: usize) {
    loop {
        let buddy = buddy_of(index);
        if buddy != 0 && (tree[buddy] == NodeState::Used || tree[buddy] == NodeState::Full) {
            index = parent(index);
            tree[index] = NodeState::Full;
        } else {
            return;
        }
    }
}

/// Allocate `size` leaves (rounded up to a power of two) inside one block.
/// Returns the leaf offset, or `None` if the block has no matching space.
fn buddy_alloc(tree: &mut [NodeState], height: u32, size: usize) -> Option<usize> {
    let size = if size == 0 { 1 } else { util::next_pow_2(size) };

    // start with the maximum number of leaves in the tree
    let mut length = 1usize << height;
    if size > length {
        return None;
    }

    let mut index = 0usize;
    let mut level = 0u32;

    loop {
        if size == length {
            // found a matching node
            if tree[index] == NodeState::Unused {
                tree[index] = NodeState::Used;
                mark_parent(tree, index);
                return Some(index_offset(index, level, height));
            }
        } else {
            match tree[index] {
                NodeState::Used | NodeState::Full => {}
                NodeState::Unused => {
                    // split first, then descend left
                    tree[index] = NodeState::Split;
                    tree[left(index)] = NodeState::Unused;
                    tree[right(index)] = NodeState::Unused;
                    index = left(index);
                    length /= 2;
                    level += 1;
                    continue;
                }
                NodeState::Split => {
                    index = left(index);
                    length /= 2;
                    level += 1;
                    continue;
                }
            }
        }

        // left children are odd; try the right sibling next
        if index & 1 == 1 {
            index += 1;
            continue;
        }

        // backtrack to the first ancestor with an untried right sibling
        loop {
            if index == 0 {
                return None;
            }
            level -= 1;
            length *= 2;
            index = parent(index);
            if index & 1 == 1 {
                index += 1;
                break;
            }
        }
    }
}

/// Collapse the freed node with `Unused` buddies and demote `Full`
/// ancestors back to `Split`.
fn buddy_combine(tree: &mut [NodeState], mut index: usize) {
    loop {
        let buddy = buddy_of(index);

        if buddy == 0 || tree[buddy] != NodeState::Unused {
            tree[index] = NodeState::Unused;
            if index == 0 {
                return;
            }
            index = parent(index);
            loop {
                if tree[index] == NodeState::Full {
                    tree[index] = NodeState::Split;
                }
                if index == 0 {
                    break;
                }
                index = parent(index);
            }
            return;
        }
        index = parent(index);
    }
}

/// Free the allocation starting at leaf `offset`. Returns false if `offset`
/// does not name the start of a live allocation.
fn buddy_free(tree: &mut [NodeState], height: u32, offset: usize) -> bool {
    debug_assert!(offset < (1usize << height));

    let mut left_bound = 0usize;
    let mut length = 1usize << height;
    let mut index = 0usize;

    loop {
        match tree[index] {
            NodeState::Used => {
                // offset must name the start of this allocation
                debug_assert_eq!(offset, left_bound, "free of an interior address");
                if offset != left_bound {
                    return false;
                }
                buddy_combine(tree, index);
                return true;
            }
            NodeState::Unused => {
                debug_assert!(false, "free of an address that is not allocated");
                return false;
            }
            NodeState::Split | NodeState::Full => {
                length /= 2;
                if offset < left_bound + length {
                    index = left(index);
                } else {
                    left_bound += length;
                    index = right(index);
                }
            }
        }
    }
}

/// Accumulate live allocation sizes (in bytes) into `allocations`.
fn collect_allocations(
    tree: &[NodeState],
    height: u32,
    min_block_size: usize,
    allocations: &mut BTreeMap<usize, usize>,
) {
    let mut stack = vec![(0usize, 0u32)];
    while let Some((index, level)) = stack.pop() {
        match tree[index] {
            NodeState::Used => {
                let size = min_block_size << (height - level);
                *allocations.entry(size).or_insert(0) += 1;
            }
            NodeState::Unused => {}
            NodeState::Split | NodeState::Full => {
                stack.push((left(index), level + 1));
                stack.push((right(index), level + 1));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// pool
// ---------------------------------------------------------------------------

/// Parameters for creating a [`BuddyPool`]. All sizes are rounded up to
/// powers of two on construction.
#[derive(Clone)]
pub struct BuddyPoolCreateInfo {
    /// blocksize of toplevel blocks in bytes
    pub block_size: usize,

    /// minimum blocksize in bytes
    pub min_block_size: usize,

    /// minimum number of preallocated blocks
    pub min_num_blocks: usize,

    /// maximum number of blocks (0: unlimited)
    pub max_num_blocks: usize,

    /// enable automatic deallocation of unused blocks
    pub dealloc_unused_blocks: bool,

    /// callable to perform backing allocations with
    pub alloc_fn: AllocFn,

    /// callable to perform backing de-allocations with
    pub dealloc_fn: DeallocFn,
}

impl BuddyPoolCreateInfo {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            min_block_size: 512,
            min_num_blocks: 0,
            max_num_blocks: 0,
            dealloc_unused_blocks: true,
            alloc_fn: system_alloc_fn(),
            dealloc_fn: system_dealloc_fn(),
        }
    }
}

/// Snapshot of a [`BuddyPool`]'s internals, extending [`AllocatorState`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuddyPoolState {
    /// count of toplevel blocks currently allocated
    pub num_blocks: usize,

    /// blocksize of toplevel blocks in bytes
    pub block_size: usize,

    /// maximum height of the internal binary trees
    pub max_level: u32,

    /// maps allocation sizes to counts
    pub allocations: BTreeMap<usize, usize>,
}

/// One toplevel block: a backing buffer plus the binary tree managing it.
struct Block {
    data: NonNull<u8>,
    tree: Box<[NodeState]>,
}

// Safety: Block owns its buffer; all access is serialized by the pool lock.
unsafe impl Send for Block {}
// Safety: shared references never touch the buffer, only the tree, and only
// under the pool lock.
unsafe impl Sync for Block {}

/// Buddy-allocation pool managing pow-2 sub-allocations of fixed-size
/// toplevel blocks obtained from a pluggable backing allocator.
///
/// All mutation happens under a pool-wide lock; state queries take shared
/// locks. Concurrent `allocate`/`free` through a shared handle is fine.
pub struct BuddyPool {
    format: BuddyPoolCreateInfo,
    height: u32,
    blocks: RwLock<Vec<Block>>,
}

impl BuddyPool {
    /// Create a pool. Block sizes are rounded up to powers of two and
    /// `min_num_blocks` toplevel blocks are pre-allocated.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is smaller than `min_block_size` after
    /// rounding.
    #[must_use]
    pub fn new(create_info: BuddyPoolCreateInfo) -> Self {
        let mut format = create_info;
        format.block_size = util::next_pow_2(format.block_size);
        format.min_block_size = util::next_pow_2(format.min_block_size);
        assert!(
            format.block_size >= format.min_block_size,
            "block_size ({}) must not be smaller than min_block_size ({})",
            format.block_size,
            format.min_block_size,
        );
        let height = (format.block_size / format.min_block_size).trailing_zeros();

        let pool = Self {
            format,
            height,
            blocks: RwLock::new(Vec::new()),
        };

        {
            let mut blocks = pool.blocks.write().unwrap();
            for _ in 0..pool.format.min_num_blocks {
                if let Some(block) = pool.create_block() {
                    blocks.push(block);
                }
            }
        }
        pool
    }

    /// Create a shared pool handle.
    #[must_use]
    pub fn create(create_info: BuddyPoolCreateInfo) -> Arc<Self> {
        Arc::new(Self::new(create_info))
    }

    fn create_block(&self) -> Option<Block> {
        let num_leaves = 1usize << self.height;
        let data = (self.format.alloc_fn)(self.format.block_size);
        let data = NonNull::new(data)?;
        let tree = vec![NodeState::Unused; num_leaves * 2 - 1].into_boxed_slice();
        Some(Block { data, tree })
    }

    fn release_block(&self, block: Block) {
        (self.format.dealloc_fn)(block.data.as_ptr());
    }

    /// Query the current state of the pool, including a size histogram of
    /// live allocations.
    #[must_use]
    pub fn pool_state(&self) -> BuddyPoolState {
        let blocks = self.blocks.read().unwrap();

        let mut ret = BuddyPoolState {
            num_blocks: blocks.len(),
            block_size: self.format.block_size,
            max_level: self.height,
            allocations: BTreeMap::new(),
        };
        for block in blocks.iter() {
            collect_allocations(
                &block.tree,
                self.height,
                self.format.min_block_size,
                &mut ret.allocations,
            );
        }
        ret
    }
}

impl Allocator for BuddyPool {
    fn allocate(&self, num_bytes: usize) -> Option<NonNull<u8>> {
        // requested size is zero or too large
        if num_bytes == 0 || num_bytes > self.format.block_size {
            return None;
        }

        let mut blocks = self.blocks.write().unwrap();

        // number of minimum blocks required
        let size = num_bytes.div_ceil(self.format.min_block_size);

        // iterate toplevel blocks
        for block in blocks.iter_mut() {
            if let Some(offset) = buddy_alloc(&mut block.tree, self.height, size) {
                // Safety: offset * min_block_size < block_size by
                // construction of the tree.
                let ptr = unsafe {
                    block
                        .data
                        .as_ptr()
                        .add(offset * self.format.min_block_size)
                };
                return NonNull::new(ptr);
            }
        }

        // add a new toplevel block, if max_num_blocks permits it
        if self.format.max_num_blocks == 0 || blocks.len() < self.format.max_num_blocks {
            let mut block = self.create_block()?;

            // cannot fail on a fresh block, size was bounds-checked above
            let Some(offset) = buddy_alloc(&mut block.tree, self.height, size) else {
                self.release_block(block);
                return None;
            };
            // Safety: same bound as above, block was just created.
            let ptr = unsafe {
                block
                    .data
                    .as_ptr()
                    .add(offset * self.format.min_block_size)
            };
            blocks.push(block);
            return NonNull::new(ptr);
        }

        // no free region of sufficient size could be found or created
        None
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let mut blocks = self.blocks.write().unwrap();

        // find the owning toplevel block by address range
        for i in 0..blocks.len() {
            let base = blocks[i].data.as_ptr() as usize;
            let addr = ptr.as_ptr() as usize;

            if addr >= base && addr < base + self.format.block_size {
                let byte_offset = addr - base;

                // invalid address
                if !byte_offset.is_multiple_of(self.format.min_block_size) {
                    return;
                }
                let offset = byte_offset / self.format.min_block_size;
                buddy_free(&mut blocks[i].tree, self.height, offset);

                // de-allocate unused blocks above min_num_blocks
                if self.format.dealloc_unused_blocks
                    && blocks[i].tree[0] == NodeState::Unused
                    && blocks.len() > self.format.min_num_blocks
                {
                    let block = blocks.remove(i);
                    self.release_block(block);
                }
                return;
            }
        }
        // foreign pointer: ignored
    }

    fn shrink(&self) {
        let mut blocks = self.blocks.write().unwrap();

        let mut i = 0;
        while i < blocks.len() {
            if blocks[i].tree[0] == NodeState::Unused && blocks.len() > self.format.min_num_blocks {
                let block = blocks.remove(i);
                self.release_block(block);
            } else {
                i += 1;
            }
        }
    }

    fn state(&self) -> AllocatorState {
        let blocks = self.blocks.read().unwrap();

        let mut allocations = BTreeMap::new();
        for block in blocks.iter() {
            collect_allocations(
                &block.tree,
                self.height,
                self.format.min_block_size,
                &mut allocations,
            );
        }

        AllocatorState {
            num_allocations: allocations.values().sum(),
            num_bytes_allocated: blocks.len() * self.format.block_size,
            num_bytes_used: allocations.iter().map(|(size, count)| size * count).sum(),
        }
    }
}

impl Drop for BuddyPool {
    fn drop(&mut self) {
        let mut blocks = self.blocks.write().unwrap();
        for block in blocks.drain(..) {
            self.release_block(block);
        }
    }
}
