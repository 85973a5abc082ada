//! Collection aliases used across the engine.
//!
//! Hash containers use `foldhash` instead of SipHash; the keys hashed here are handles and
//! descriptors produced by the engine itself.

pub use smallvec::{smallvec, SmallVec};

pub type DefaultHashBuilder = foldhash::fast::RandomState;

pub mod hashmap {
    pub use hashbrown::hash_map::{Entry, Iter, IterMut, Keys, Values};

    pub type HashMap<K, V> = hashbrown::HashMap<K, V, super::DefaultHashBuilder>;
}

pub mod hashset {
    pub use hashbrown::hash_set::{Iter, IntoIter};

    pub type HashSet<T> = hashbrown::HashSet<T, super::DefaultHashBuilder>;
}

/// Hash a value with a fixed seed so the result is stable for the lifetime of the process.
pub fn stable_hash<T: std::hash::Hash + ?Sized>(value: &T) -> u64 {
    use std::hash::BuildHasher;

    const SEED: u64 = 0x5eed_e4b3_2d1c_9a7f;
    foldhash::quality::FixedState::with_seed(SEED).hash_one(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("textures/albedo.png"), stable_hash("textures/albedo.png"));
        assert_ne!(stable_hash("textures/albedo.png"), stable_hash("textures/normal.png"));
    }

    #[test]
    fn default_constructs_with_fast_hasher() {
        let mut map: hashmap::HashMap<u32, &str> = hashmap::HashMap::default();
        map.insert(1, "one");
        let set: hashset::HashSet<u32> = [1, 2, 2].into_iter().collect();
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(set.len(), 2);
    }
}
