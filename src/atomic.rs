//! Atomic slots that own one strong count of an `Arc`.
//!
//! Nodes in the trie are immutable and shared between generations, so
//! their lifetime is managed with `Arc`. The only mutable memory is a
//! handful of pointer-sized slots. A slot keeps the strong count of
//! whatever it currently points at, and a reader bumps that count while
//! holding an epoch [`Guard`]. A replaced pointer is handed to
//! `Guard::defer_drop` rather than released directly, so a straggler that
//! loaded it before the swap can still take its own reference.

use std::marker::PhantomData;
use std::ptr;
use std::sync::{
    atomic::{AtomicPtr, Ordering},
    Arc,
};

use crate::node::{Main, Prev, Root};

/// Garbage whose release must wait until every pinned thread has moved on.
// never read, only dropped
#[allow(dead_code)]
pub(crate) enum Deferred<K, V> {
    Main(Arc<Main<K, V>>),
    Prev(Arc<Prev<K, V>>),
    Root(Arc<Root<K, V>>),
}

impl<K, V> From<Arc<Main<K, V>>> for Deferred<K, V> {
    fn from(main: Arc<Main<K, V>>) -> Deferred<K, V> {
        Deferred::Main(main)
    }
}

impl<K, V> From<Arc<Prev<K, V>>> for Deferred<K, V> {
    fn from(prev: Arc<Prev<K, V>>) -> Deferred<K, V> {
        Deferred::Prev(prev)
    }
}

impl<K, V> From<Arc<Root<K, V>>> for Deferred<K, V> {
    fn from(root: Arc<Root<K, V>>) -> Deferred<K, V> {
        Deferred::Root(root)
    }
}

pub(crate) type Guard<'a, K, V, const LOCAL_GC_BUFFER_SIZE: usize> =
    ebr::Guard<'a, Deferred<K, V>, LOCAL_GC_BUFFER_SIZE>;

fn into_raw<T>(arc: Option<Arc<T>>) -> *mut T {
    arc.map_or(ptr::null_mut(), |arc| Arc::into_raw(arc).cast_mut())
}

fn as_raw<T>(arc: Option<&Arc<T>>) -> *mut T {
    arc.map_or(ptr::null_mut(), |arc| Arc::as_ptr(arc).cast_mut())
}

/// # Safety
///
/// `ptr` must be non-null and own a strong count that cannot be released
/// before this call returns.
unsafe fn clone_raw<T>(ptr: *mut T) -> Arc<T> {
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

fn compare_exchange<K, V, T, const LOCAL_GC_BUFFER_SIZE: usize>(
    slot: &AtomicPtr<T>,
    current: *mut T,
    new: *mut T,
    guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
) -> bool
where
    K: 'static + Send + Sync,
    V: 'static + Send + Sync,
    Deferred<K, V>: From<Arc<T>>,
{
    match slot.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(replaced) => {
            if !replaced.is_null() {
                // the slot's count is ours now
                let replaced: Arc<T> = unsafe { Arc::from_raw(replaced) };
                guard.defer_drop(Deferred::from(replaced));
            }
            true
        }
        Err(_) => {
            if !new.is_null() {
                // never published
                let failed: Arc<T> = unsafe { Arc::from_raw(new) };
                drop(failed);
            }
            false
        }
    }
}

fn release<T>(slot: &mut AtomicPtr<T>) {
    let ptr = *slot.get_mut();
    if !ptr.is_null() {
        let reclaimed: Arc<T> = unsafe { Arc::from_raw(ptr) };
        drop(reclaimed);
    }
}

/// A slot that always points at something.
pub(crate) struct AtomicArc<T> {
    ptr: AtomicPtr<T>,
    _owns: PhantomData<Arc<T>>,
}

impl<T> AtomicArc<T> {
    pub(crate) fn new(initial: Arc<T>) -> AtomicArc<T> {
        AtomicArc {
            ptr: AtomicPtr::new(into_raw(Some(initial))),
            _owns: PhantomData,
        }
    }

    pub(crate) fn load<K, V, const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        _guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Arc<T>
    where
        K: 'static + Send + Sync,
        V: 'static + Send + Sync,
    {
        let ptr = self.ptr.load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        // pinned: the count behind ptr is only released via defer_drop
        unsafe { clone_raw(ptr) }
    }

    /// Installs `new` if the slot still holds `current`. On failure `new`
    /// is dropped.
    pub(crate) fn compare_exchange<K, V, const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        current: &Arc<T>,
        new: Arc<T>,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> bool
    where
        K: 'static + Send + Sync,
        V: 'static + Send + Sync,
        Deferred<K, V>: From<Arc<T>>,
    {
        compare_exchange(
            &self.ptr,
            as_raw(Some(current)),
            into_raw(Some(new)),
            guard,
        )
    }
}

impl<T> Drop for AtomicArc<T> {
    fn drop(&mut self) {
        release(&mut self.ptr);
    }
}

/// A slot that may be empty.
pub(crate) struct AtomicOptionArc<T> {
    ptr: AtomicPtr<T>,
    _owns: PhantomData<Arc<T>>,
}

impl<T> AtomicOptionArc<T> {
    pub(crate) fn new(initial: Option<Arc<T>>) -> AtomicOptionArc<T> {
        AtomicOptionArc {
            ptr: AtomicPtr::new(into_raw(initial)),
            _owns: PhantomData,
        }
    }

    pub(crate) fn is_none(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn load<K, V, const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        _guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> Option<Arc<T>>
    where
        K: 'static + Send + Sync,
        V: 'static + Send + Sync,
    {
        let ptr = self.ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { clone_raw(ptr) })
        }
    }

    pub(crate) fn compare_exchange<K, V, const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        current: Option<&Arc<T>>,
        new: Option<Arc<T>>,
        guard: &mut Guard<'_, K, V, LOCAL_GC_BUFFER_SIZE>,
    ) -> bool
    where
        K: 'static + Send + Sync,
        V: 'static + Send + Sync,
        Deferred<K, V>: From<Arc<T>>,
    {
        compare_exchange(&self.ptr, as_raw(current), into_raw(new), guard)
    }
}

impl<T> Drop for AtomicOptionArc<T> {
    fn drop(&mut self) {
        release(&mut self.ptr);
    }
}
