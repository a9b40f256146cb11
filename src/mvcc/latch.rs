use crate::error::Result;

use itertools::Itertools as _;
use std::sync::{Mutex, MutexGuard};

/// Serializes transaction commands that touch the same keys. Keys are hashed
/// onto a fixed set of striped latches. A command acquires the latches of all
/// its keys, in ascending stripe order to avoid deadlocks, and holds them
/// until the returned guard is dropped.
///
/// Commands on unrelated keys may share a stripe and thus wait on each other,
/// which is harmless beyond the lost concurrency.
pub struct LatchManager {
    stripes: Vec<Mutex<()>>,
}

/// Holds a set of latches. Released on drop.
pub struct LatchGuard<'a> {
    stripes: Vec<usize>,
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl LatchGuard<'_> {
    /// Returns the held stripe indexes, in acquisition order.
    pub fn stripes(&self) -> &[usize] {
        &self.stripes
    }
}

impl LatchManager {
    /// Creates a latch manager with the given number of stripes (at least 1).
    pub fn new(stripes: usize) -> Self {
        Self { stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect() }
    }

    /// Returns the stripe of a key.
    fn stripe(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.stripes.len()
    }

    /// Acquires the latches for the given keys, blocking until all are held.
    pub fn acquire<'k>(&self, keys: impl IntoIterator<Item = &'k [u8]>) -> Result<LatchGuard<'_>> {
        let stripes: Vec<usize> = keys.into_iter().map(|key| self.stripe(key)).sorted_unstable().dedup().collect();
        let mut guards = Vec::with_capacity(stripes.len());
        for &stripe in &stripes {
            guards.push(self.stripes[stripe].lock()?);
        }
        Ok(LatchGuard { stripes, _guards: guards })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn stripes_sorted_and_deduplicated() -> Result<()> {
        let latches = LatchManager::new(8);
        let keys: Vec<&[u8]> = vec![b"c", b"a", b"b", b"a", b"c"];
        let guard = latches.acquire(keys.iter().copied())?;
        let stripes = guard.stripes().to_vec();
        assert!(stripes.windows(2).all(|w| w[0] < w[1]), "{stripes:?}");
        assert!(stripes.len() <= 3);
        drop(guard);

        // Reacquiring after release doesn't block.
        latches.acquire(keys.iter().copied())?;
        Ok(())
    }

    #[test]
    fn conflicting_commands_serialize() -> Result<()> {
        let latches = Arc::new(LatchManager::new(16));
        let active = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let (latches, active) = (latches.clone(), active.clone());
                std::thread::spawn(move || -> Result<()> {
                    let other = format!("key{i}");
                    let _guard = latches.acquire([b"shared".as_slice(), other.as_bytes()])?;
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("thread panicked")?;
        }
        Ok(())
    }
}
