//! Device memory accounting for quantized layer state.
//!
//! Models a caching allocator: released bytes stay reserved in a cache until
//! `empty_cache` hands them back to the device. Scheme finalization uses this
//! to make the cost of materializing a dequantized weight visible.

use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone)]
struct Usage {
    current: usize,
    peak: usize,
    cached: usize,
}

impl Usage {
    fn add(&mut self, bytes: usize) {
        // Reuse cached blocks before growing the reservation.
        self.cached = self.cached.saturating_sub(bytes);
        self.current += bytes;
        if self.current > self.peak {
            self.peak = self.current;
        }
    }

    fn sub(&mut self, bytes: usize) {
        let freed = bytes.min(self.current);
        self.current -= freed;
        self.cached += freed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub current: usize,
    pub peak: usize,
    pub cached: usize,
}

impl MemoryStats {
    pub fn reserved(&self) -> usize {
        self.current + self.cached
    }
}

#[derive(Debug, Default)]
pub struct MemoryManager {
    usage: Mutex<Usage>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_usage<T>(&self, f: impl FnOnce(&mut Usage) -> T) -> T {
        let mut guard = match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory accounting lock poisoned; continuing with last state");
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }

    pub fn record_allocation(&self, label: &str, bytes: usize) {
        debug!("alloc {label}: {bytes} bytes");
        self.with_usage(|u| u.add(bytes));
    }

    pub fn record_release(&self, label: &str, bytes: usize) {
        debug!("release {label}: {bytes} bytes");
        self.with_usage(|u| u.sub(bytes));
    }

    /// Return cached blocks to the device. Returns the number of bytes freed.
    pub fn empty_cache(&self) -> usize {
        let freed = self.with_usage(|u| std::mem::take(&mut u.cached));
        if freed > 0 {
            debug!("empty_cache released {:.2} MB", freed as f64 / 1e6);
        }
        freed
    }

    pub fn stats(&self) -> MemoryStats {
        self.with_usage(|u| MemoryStats {
            current: u.current,
            peak: u.peak,
            cached: u.cached,
        })
    }

    pub fn print_memory_summary(&self) {
        let stats = self.stats();
        println!("Memory usage summary:");
        println!("  Current: {:.3} MB", stats.current as f64 / 1e6);
        println!("  Peak: {:.3} MB", stats.peak as f64 / 1e6);
        println!("  Cached: {:.3} MB", stats.cached as f64 / 1e6);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_moves_bytes_to_cache_until_emptied() {
        let mem = MemoryManager::new();
        mem.record_allocation("weight", 1000);
        mem.record_allocation("scale", 100);
        mem.record_release("scale", 100);

        let stats = mem.stats();
        assert_eq!(stats.current, 1000);
        assert_eq!(stats.peak, 1100);
        assert_eq!(stats.cached, 100);
        assert_eq!(stats.reserved(), 1100);

        assert_eq!(mem.empty_cache(), 100);
        assert_eq!(mem.stats().cached, 0);
        assert_eq!(mem.empty_cache(), 0);
    }

    #[test]
    fn allocations_reuse_cached_bytes() {
        let mem = MemoryManager::new();
        mem.record_allocation("a", 64);
        mem.record_release("a", 64);
        mem.record_allocation("b", 32);
        let stats = mem.stats();
        assert_eq!(stats.current, 32);
        assert_eq!(stats.cached, 32);
        assert_eq!(stats.peak, 64);
    }
}
