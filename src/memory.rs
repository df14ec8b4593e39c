//! Scratch memory for one convolution call.
//!
//! Every host or device buffer a call needs is handed out as a [`Lease`].
//! Dropping the lease releases the buffer, either back to a [`BufferPool`]
//! or to the allocator, so an early return through `?` can never leak.
//!
//! Host allocations use `Vec::try_reserve_exact`, so running out of memory
//! is reported as [`ConvError::OutOfMemory`] instead of aborting the process.
//!
//! [`MemoryStats`] counts acquisitions and releases per domain and a
//! [`FaultInjector`] can force any single allocation site to fail, which is
//! how leak freedom is tested.

use crate::error::{ConvError, Result};
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::Mutex;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    Host,
    Device,
}

impl fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Device => f.write_str("device"),
        }
    }
}

/// Snapshot of [`MemoryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounts {
    pub host_acquired: usize,
    pub host_released: usize,
    pub device_acquired: usize,
    pub device_released: usize,
    pub pool_hits: usize,
}

impl MemoryCounts {
    /// Every acquired lease has been released.
    #[must_use]
    pub const fn balanced(&self) -> bool {
        self.host_acquired == self.host_released && self.device_acquired == self.device_released
    }
}

/// Lease counters, shared by every call on one layer.
#[derive(Debug, Default)]
pub struct MemoryStats {
    host_acquired: AtomicUsize,
    host_released: AtomicUsize,
    device_acquired: AtomicUsize,
    device_released: AtomicUsize,
    pool_hits: AtomicUsize,
}

impl MemoryStats {
    fn acquired(&self, domain: MemoryDomain) {
        match domain {
            MemoryDomain::Host => self.host_acquired.fetch_add(1, Ordering::Relaxed),
            MemoryDomain::Device => self.device_acquired.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn released(&self, domain: MemoryDomain) {
        match domain {
            MemoryDomain::Host => self.host_released.fetch_add(1, Ordering::Relaxed),
            MemoryDomain::Device => self.device_released.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[must_use]
    pub fn snapshot(&self) -> MemoryCounts {
        MemoryCounts {
            host_acquired: self.host_acquired.load(Ordering::Relaxed),
            host_released: self.host_released.load(Ordering::Relaxed),
            device_acquired: self.device_acquired.load(Ordering::Relaxed),
            device_released: self.device_released.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
        }
    }
}

const DISARMED: usize = usize::MAX;

/// Forces the n-th allocation after [`arm`](Self::arm) to fail.
///
/// Host and device allocations share one site counter.
#[derive(Debug)]
pub struct FaultInjector {
    fail_at: AtomicUsize,
    sites: AtomicUsize,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self {
            fail_at: AtomicUsize::new(DISARMED),
            sites: AtomicUsize::new(0),
        }
    }
}

impl FaultInjector {
    /// Fail the allocation at zero-based site `n`, counting from now.
    pub fn arm(&self, n: usize) {
        self.sites.store(0, Ordering::SeqCst);
        self.fail_at.store(n, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.fail_at.store(DISARMED, Ordering::SeqCst);
    }

    /// Allocation sites visited since the last [`arm`](Self::arm).
    #[must_use]
    pub fn sites_seen(&self) -> usize {
        self.sites.load(Ordering::SeqCst)
    }

    fn check(&self, domain: MemoryDomain, elements: usize) -> Result<()> {
        let site = self.sites.fetch_add(1, Ordering::SeqCst);
        if site == self.fail_at.load(Ordering::SeqCst) {
            return Err(ConvError::OutOfMemory { domain, elements });
        }
        Ok(())
    }
}

/// Idle buffers keyed by exact element count.
///
/// A buffer handed out by the pool always has exactly the requested size;
/// its contents are whatever the previous lease left behind.
#[derive(Debug)]
pub struct BufferPool<B> {
    domain: MemoryDomain,
    max_idle_per_len: usize,
    idle: Mutex<HashMap<usize, Vec<B>>>,
}

impl<B> BufferPool<B> {
    pub const DEFAULT_MAX_IDLE: usize = 4;

    #[must_use]
    pub fn new(domain: MemoryDomain) -> Self {
        Self {
            domain,
            max_idle_per_len: Self::DEFAULT_MAX_IDLE,
            idle: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn domain(&self) -> MemoryDomain {
        self.domain
    }

    fn take(&self, len: usize) -> Option<B> {
        self.idle
            .lock()
            .expect("buffer pool mutex poisoned")
            .get_mut(&len)
            .and_then(Vec::pop)
    }

    fn give(&self, len: usize, buf: B) {
        let mut idle = self.idle.lock().expect("buffer pool mutex poisoned");
        let slot = idle.entry(len).or_default();
        if slot.len() < self.max_idle_per_len {
            slot.push(buf);
        }
    }

    /// Number of idle buffers held.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle
            .lock()
            .expect("buffer pool mutex poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Frees every idle buffer.
    pub fn clear(&self) {
        self.idle.lock().expect("buffer pool mutex poisoned").clear();
    }
}

/// A scratch buffer owned for the duration of one call.
pub struct Lease<'a, B> {
    buf: Option<B>,
    len: usize,
    domain: MemoryDomain,
    pool: Option<&'a BufferPool<B>>,
    stats: &'a MemoryStats,
}

impl<B> Lease<'_, B> {
    /// Element count the buffer was sized for.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn get(&self) -> &B {
        self.buf.as_ref().expect("lease holds its buffer until dropped")
    }

    pub fn get_mut(&mut self) -> &mut B {
        self.buf.as_mut().expect("lease holds its buffer until dropped")
    }
}

impl<B> Drop for Lease<'_, B> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.stats.released(self.domain);
            if let Some(pool) = self.pool {
                pool.give(self.len, buf);
            }
        }
    }
}

impl Deref for Lease<'_, Vec<f32>> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.get()
    }
}

impl DerefMut for Lease<'_, Vec<f32>> {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.get_mut()
    }
}

/// Hands out leases and keeps the per-layer accounting.
#[derive(Debug, Default)]
pub struct MemoryManager {
    stats: MemoryStats,
    faults: FaultInjector,
    host_pool: Option<BufferPool<Vec<f32>>>,
}

impl MemoryManager {
    /// A manager that allocates fresh buffers for every call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager that recycles host buffers through a pool.
    #[must_use]
    pub fn pooled() -> Self {
        Self {
            host_pool: Some(BufferPool::new(MemoryDomain::Host)),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    #[must_use]
    pub const fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    #[must_use]
    pub const fn host_pool(&self) -> Option<&BufferPool<Vec<f32>>> {
        self.host_pool.as_ref()
    }

    /// Leases a host buffer of exactly `len` elements.
    ///
    /// Fresh buffers are zeroed; pooled ones are not.
    ///
    /// # Errors
    /// [`ConvError::OutOfMemory`] if the allocation fails.
    pub fn alloc_host(&self, len: usize) -> Result<Lease<'_, Vec<f32>>> {
        let pool = self.host_pool.as_ref();
        self.lease(MemoryDomain::Host, len, pool, |len| {
            let mut v = Vec::new();
            v.try_reserve_exact(len).map_err(|_| ConvError::OutOfMemory {
                domain: MemoryDomain::Host,
                elements: len,
            })?;
            v.resize(len, 0.0);
            Ok(v)
        })
    }

    /// Leases a device buffer of exactly `len` elements, creating it with
    /// `alloc` unless `pool` has an idle one.
    ///
    /// # Errors
    /// Whatever `alloc` returns, or an injected [`ConvError::OutOfMemory`].
    pub fn alloc_device<'a, B>(
        &'a self,
        len: usize,
        pool: Option<&'a BufferPool<B>>,
        alloc: impl FnOnce(usize) -> Result<B>,
    ) -> Result<Lease<'a, B>> {
        self.lease(MemoryDomain::Device, len, pool, alloc)
    }

    fn lease<'a, B>(
        &'a self,
        domain: MemoryDomain,
        len: usize,
        pool: Option<&'a BufferPool<B>>,
        alloc: impl FnOnce(usize) -> Result<B>,
    ) -> Result<Lease<'a, B>> {
        self.faults.check(domain, len)?;
        let buf = match pool.and_then(|p| p.take(len)) {
            Some(buf) => {
                self.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => alloc(len)?,
        };
        self.stats.acquired(domain);
        Ok(Lease {
            buf: Some(buf),
            len,
            domain,
            pool,
            stats: &self.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_release_on_drop() {
        let mm = MemoryManager::new();
        {
            let a = mm.alloc_host(8).unwrap();
            let b = mm.alloc_host(3).unwrap();
            assert_eq!((a.len(), b.len()), (8, 3));
            assert!(a.iter().all(|&x| x == 0.0));
            assert!(!mm.stats().snapshot().balanced());
        }
        let counts = mm.stats().snapshot();
        assert_eq!(counts.host_acquired, 2);
        assert!(counts.balanced());
    }

    #[test]
    fn pool_reuses_exact_sizes_only() {
        let mm = MemoryManager::pooled();
        drop(mm.alloc_host(16).unwrap());
        assert_eq!(mm.host_pool().unwrap().idle(), 1);

        let other = mm.alloc_host(15).unwrap();
        assert_eq!(other.len(), 15);
        assert_eq!(mm.stats().snapshot().pool_hits, 0);
        drop(other);

        let again = mm.alloc_host(16).unwrap();
        assert_eq!(again.len(), 16);
        assert_eq!(mm.stats().snapshot().pool_hits, 1);
    }

    #[test]
    fn injected_fault_hits_the_armed_site() {
        let mm = MemoryManager::new();
        mm.faults().arm(1);
        let first = mm.alloc_host(4);
        assert!(first.is_ok());
        let second = mm.alloc_device(4, None::<&BufferPool<Vec<f32>>>, |n| Ok(vec![0.0; n]));
        assert!(matches!(
            second,
            Err(ConvError::OutOfMemory {
                domain: MemoryDomain::Device,
                elements: 4
            })
        ));
        drop(first);
        assert_eq!(mm.faults().sites_seen(), 2);
        assert!(mm.stats().snapshot().balanced());
    }

    #[test]
    fn failing_allocator_does_not_count_an_acquisition() {
        let mm = MemoryManager::new();
        let res = mm.alloc_device(4, None::<&BufferPool<u8>>, |_| {
            Err(ConvError::Device("boom".into()))
        });
        assert!(res.is_err());
        assert_eq!(mm.stats().snapshot(), MemoryCounts::default());
    }

    #[test]
    fn huge_host_request_reports_oom() {
        let mm = MemoryManager::new();
        let res = mm.alloc_host(usize::MAX / 2);
        assert!(matches!(res, Err(ConvError::OutOfMemory { .. })));
    }
}
