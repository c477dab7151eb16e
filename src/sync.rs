use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquires a mutex, recovering the guard when a previous holder panicked.
///
/// Lifecycle locks only guard short, non-panicking critical sections; a
/// poisoned lock can only come from a panicking user callback, which must not
/// wedge the rest of the component.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
