use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;

use crate::error::{NannyError, Result};

const UID_BASE: u32 = 10_000;
const UID_COUNT: u32 = 1_000;

/// Unprivileged uids handed out to containers, one per live sandbox.
#[derive(Clone, Debug, Default)]
pub struct UidPool {
    in_use: Arc<Mutex<HashSet<u32>>>,
}

impl UidPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a random free uid in `10000..11000`.
    pub fn allocate(&self) -> Result<u32> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        if in_use.len() >= UID_COUNT as usize {
            return Err(NannyError::UidsExhausted(UID_COUNT as usize));
        }
        let mut rng = rand::thread_rng();
        loop {
            let uid = rng.gen_range(UID_BASE..UID_BASE + UID_COUNT);
            if in_use.insert(uid) {
                return Ok(uid);
            }
        }
    }

    pub fn release(&self, uid: u32) {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&uid);
    }

    pub fn in_use(&self) -> usize {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_release() {
        let pool = UidPool::new();
        let mut uids: Vec<u32> = (0..UID_COUNT).map(|_| pool.allocate().unwrap()).collect();
        assert!(uids.iter().all(|uid| (10_000..11_000).contains(uid)));
        assert!(matches!(
            pool.allocate(),
            Err(NannyError::UidsExhausted(1000))
        ));

        let freed = uids.pop().unwrap();
        pool.release(freed);
        assert_eq!(pool.allocate().unwrap(), freed);
    }
}
