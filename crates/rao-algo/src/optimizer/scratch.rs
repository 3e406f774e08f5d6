//! Iteration-scoped scratch allocations.
//!
//! Rounding builds many small per-tap and per-group maps that only live
//! until the rounded set-points are known. They are bump-allocated and
//! freed in bulk when the optimizer moves to the next iteration.

use std::hash::Hash;

use bumpalo::Bump;

/// Hash map allocated in a [`ScratchArena`].
pub type ScratchMap<'s, K, V> = hashbrown::HashMap<K, V, hashbrown::DefaultHashBuilder, &'s Bump>;

/// Vector allocated in a [`ScratchArena`].
pub type ScratchVec<'s, T> = bumpalo::collections::Vec<'s, T>;

/// Bump arena owned by one optimization call, reset between iterations.
///
/// # Example
///
/// ```
/// use rao_algo::optimizer::ScratchArena;
///
/// let mut scratch = ScratchArena::new();
/// {
///     let mut margins = scratch.alloc_map::<i32, f64>();
///     margins.insert(3, -12.5);
///     assert_eq!(margins.get(&3), Some(&-12.5));
/// }
/// scratch.reset();
/// ```
pub struct ScratchArena {
    bump: Bump,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self { bump: Bump::new() }
    }

    /// Frees every allocation at once. Scratch values are plain data, no
    /// destructor needs to run.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    pub fn alloc_vec<T>(&self) -> ScratchVec<'_, T> {
        bumpalo::collections::Vec::new_in(&self.bump)
    }

    pub fn alloc_map<K: Eq + Hash, V>(&self) -> ScratchMap<'_, K, V> {
        hashbrown::HashMap::new_in(&self.bump)
    }
}

impl Default for ScratchArena {
    fn default() -> Self {
        Self::new()
    }
}
