// Copyright 2025 Irreducible Inc.

use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

/// Accounts for the device memory held by live buffers.
///
/// Every buffer holds a [`MemoryLease`] for its size in bytes; the lease is returned to the
/// tracker when the buffer is dropped. The tracker records the high-water mark so that callers
/// can compare the working set of different execution strategies.
#[derive(Debug, Default)]
pub struct MemoryTracker {
	limit: Option<usize>,
	live: AtomicUsize,
	peak: AtomicUsize,
}

impl MemoryTracker {
	/// Creates a tracker that refuses leases once `limit` bytes are live.
	pub fn with_limit(limit: usize) -> Self {
		Self {
			limit: Some(limit),
			..Default::default()
		}
	}

	/// Reserves `bytes` of device memory.
	///
	/// ## Throws
	///
	/// * [`Error::OutOfMemory`] if the reservation would exceed the limit
	pub fn acquire(self: &Arc<Self>, bytes: usize) -> Result<MemoryLease, Error> {
		let limit = self.limit.unwrap_or(usize::MAX);
		let live = self
			.live
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
				live.checked_add(bytes).filter(|&total| total <= limit)
			})
			.map_err(|live| Error::OutOfMemory {
				requested: bytes,
				live,
			})?;
		self.peak.fetch_max(live + bytes, Ordering::AcqRel);

		Ok(MemoryLease {
			tracker: self.clone(),
			bytes,
		})
	}

	pub fn limit(&self) -> Option<usize> {
		self.limit
	}

	/// Bytes currently held by live buffers.
	pub fn live_bytes(&self) -> usize {
		self.live.load(Ordering::Acquire)
	}

	/// Largest number of bytes that were live at the same time.
	pub fn peak_bytes(&self) -> usize {
		self.peak.load(Ordering::Acquire)
	}

	/// Restarts peak tracking from the current live size.
	pub fn reset_peak(&self) {
		self.peak.store(self.live_bytes(), Ordering::Release);
	}
}

/// A reservation on a [`MemoryTracker`], released on drop.
#[derive(Debug)]
pub struct MemoryLease {
	tracker: Arc<MemoryTracker>,
	bytes: usize,
}

impl MemoryLease {
	pub fn bytes(&self) -> usize {
		self.bytes
	}
}

impl Drop for MemoryLease {
	fn drop(&mut self) {
		self.tracker.live.fetch_sub(self.bytes, Ordering::AcqRel);
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("allocator is out of memory: requested {requested} bytes with {live} bytes live")]
	OutOfMemory { requested: usize, live: usize },
}
