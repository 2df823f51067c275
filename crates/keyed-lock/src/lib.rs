#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Per-key mutual exclusion for async tasks.
//!
//! Every key owns a FIFO queue of waiters: callers are granted the key in the order they asked
//! for it, and distinct keys never wait on each other. Keys without holders or waiters are
//! dropped from the registry, so the set of keys can be unbounded over time.

use std::{
	collections::HashMap,
	fmt,
	hash::Hash,
	sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type Slot = Arc<AsyncMutex<()>>;

pub struct KeyedLock<K> {
	slots: Mutex<HashMap<K, Slot>>,
}

impl<K> Default for KeyedLock<K> {
	fn default() -> Self {
		Self {
			slots: Mutex::new(HashMap::new()),
		}
	}
}

impl<K> fmt::Debug for KeyedLock<K> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyedLock")
			.field("active_keys", &self.slots().len())
			.finish()
	}
}

impl<K> KeyedLock<K> {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of keys currently held or waited on.
	#[must_use]
	pub fn active_keys(&self) -> usize {
		self.slots().len()
	}

	fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<K, Slot>> {
		// The map is never left half-updated, so a poisoned lock is still usable
		self.slots.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl<K: Hash + Eq + Clone + fmt::Debug> KeyedLock<K> {
	/// Waits until it's this caller's turn for `key`.
	///
	/// The returned guard releases the key when dropped or when [`KeyedLockGuard::release`] is
	/// called, so the critical section ends on every exit path, including `?` returns and panics.
	pub async fn lock(&self, key: K) -> KeyedLockGuard<'_, K> {
		let slot = Arc::clone(self.slots().entry(key.clone()).or_default());

		trace!(?key, "Waiting for keyed lock");

		let guard = Arc::clone(&slot).lock_owned().await;

		trace!(?key, "Acquired keyed lock");

		KeyedLockGuard {
			lock: self,
			key,
			slot,
			guard: Some(guard),
		}
	}

	/// Checks whether some task currently holds `key`.
	#[must_use]
	pub fn is_locked(&self, key: &K) -> bool {
		self.slots()
			.get(key)
			.is_some_and(|slot| slot.try_lock().is_err())
	}
}

#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyedLockGuard<'lock, K: Hash + Eq + Clone + fmt::Debug> {
	lock: &'lock KeyedLock<K>,
	key: K,
	slot: Slot,
	guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Hash + Eq + Clone + fmt::Debug> KeyedLockGuard<'_, K> {
	#[must_use]
	pub const fn key(&self) -> &K {
		&self.key
	}

	/// Releases the key, handing it to the next waiter in line.
	pub fn release(self) {
		drop(self);
	}
}

impl<K: Hash + Eq + Clone + fmt::Debug> fmt::Debug for KeyedLockGuard<'_, K> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyedLockGuard")
			.field("key", &self.key)
			.finish_non_exhaustive()
	}
}

impl<K: Hash + Eq + Clone + fmt::Debug> Drop for KeyedLockGuard<'_, K> {
	fn drop(&mut self) {
		drop(self.guard.take());

		let mut slots = self.lock.slots();

		// Waiters clone the slot while holding the map lock, so two references (the map's and
		// ours) means nobody else is queued on this key
		if slots
			.get(&self.key)
			.is_some_and(|slot| Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2)
		{
			slots.remove(&self.key);
		}

		trace!(key = ?self.key, "Released keyed lock");
	}
}
