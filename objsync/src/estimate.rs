//! Running totals produced by the estimate pass

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Concurrently updated object/byte totals, used only for progress reporting.
///
/// No per-object identity is tracked, so duplicate identifiers inflate the
/// estimate; that is an accepted approximation.
#[derive(Debug, Default)]
pub struct SyncEstimate {
    objects: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time view of an estimate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EstimateSnapshot {
    pub objects: u64,
    pub bytes: u64,
}

impl SyncEstimate {
    /// Create an empty estimate
    pub fn new() -> Self {
        Self::default()
    }

    /// Add discovered objects and bytes to the totals
    pub fn add(&self, objects: u64, bytes: u64) {
        self.objects.fetch_add(objects, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total objects discovered so far
    pub fn objects(&self) -> u64 {
        self.objects.load(Ordering::Relaxed)
    }

    /// Total bytes discovered so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of both counters
    pub fn snapshot(&self) -> EstimateSnapshot {
        EstimateSnapshot {
            objects: self.objects(),
            bytes: self.bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_adds() {
        let estimate = Arc::new(SyncEstimate::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let e = estimate.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    e.add(1, 100);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(estimate.objects(), 4000);
        assert_eq!(estimate.bytes(), 400_000);

        let snapshot = estimate.snapshot();
        assert_eq!(snapshot.objects, 4000);
        assert_eq!(snapshot.bytes, 400_000);
    }
}
