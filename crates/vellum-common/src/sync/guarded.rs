//! Typed mutex wrappers with a static lock-ordering discipline.
//!
//! Every piece of shared mutable state lives inside a [`Guarded`] whose
//! type names the lock protecting it. Each lock tag carries a level; a
//! thread may only acquire a lock whose level is strictly greater than the
//! level of every lock it already holds. Debug builds check this on every
//! acquisition and panic on violation, which turns latent deadlocks into
//! deterministic test failures.

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Names a lock and places it in the global acquisition order.
pub trait LockTag: 'static {
    /// Human-readable lock name, used in diagnostics.
    const NAME: &'static str;
    /// Acquisition level; locks are taken in increasing level order.
    const LEVEL: u32;
}

/// Declares zero-sized lock tags.
///
/// ```rust
/// use vellum_common::lock_tag;
/// use vellum_common::sync::{Guarded, LockTag};
///
/// lock_tag!(StateLock, "state", 10);
///
/// let g: Guarded<u32, StateLock> = Guarded::new(5);
/// *g.lock() += 1;
/// assert_eq!(*g.lock(), 6);
/// assert_eq!(StateLock::NAME, "state");
/// ```
#[macro_export]
macro_rules! lock_tag {
    ($(#[$meta:meta])* $vis:vis $name:ident, $label:expr, $level:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name;

        impl $crate::sync::LockTag for $name {
            const NAME: &'static str = $label;
            const LEVEL: u32 = $level;
        }
    };
}

thread_local! {
    static HELD: RefCell<Vec<(u32, &'static str)>> = RefCell::new(Vec::new());
}

#[cfg(debug_assertions)]
fn on_acquire<Tag: LockTag>() {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&(level, name)) = held.iter().max_by_key(|(level, _)| *level) {
            assert!(
                Tag::LEVEL > level,
                "lock order violation: acquiring '{}' (level {}) while holding '{}' (level {})",
                Tag::NAME,
                Tag::LEVEL,
                name,
                level
            );
        }
        held.push((Tag::LEVEL, Tag::NAME));
    });
}

#[cfg(debug_assertions)]
fn on_release<Tag: LockTag>() {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|(level, _)| *level == Tag::LEVEL) {
            held.remove(pos);
        }
    });
}

#[cfg(not(debug_assertions))]
#[inline(always)]
fn on_acquire<Tag: LockTag>() {}

#[cfg(not(debug_assertions))]
#[inline(always)]
fn on_release<Tag: LockTag>() {}

/// Returns the names of the locks held by the current thread, in
/// acquisition order. Always empty in release builds.
#[must_use]
pub fn held_locks() -> Vec<&'static str> {
    HELD.with(|held| held.borrow().iter().map(|(_, name)| *name).collect())
}

/// A value guarded by the lock named by `Tag`.
pub struct Guarded<T, Tag: LockTag> {
    inner: Mutex<T>,
    _tag: PhantomData<fn() -> Tag>,
}

impl<T, Tag: LockTag> Guarded<T, Tag> {
    /// Wraps a value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            _tag: PhantomData,
        }
    }

    /// Acquires the lock, blocking the current thread.
    pub fn lock(&self) -> GuardedRef<'_, T, Tag> {
        on_acquire::<Tag>();
        GuardedRef {
            guard: self.inner.lock(),
            _tag: PhantomData,
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<GuardedRef<'_, T, Tag>> {
        let guard = self.inner.try_lock()?;
        on_acquire::<Tag>();
        Some(GuardedRef {
            guard,
            _tag: PhantomData,
        })
    }

    /// Returns a mutable reference without locking; requires exclusive
    /// access to the wrapper.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consumes the wrapper and returns the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Name of the guarding lock.
    #[must_use]
    pub fn lock_name(&self) -> &'static str {
        Tag::NAME
    }
}

impl<T: Default, Tag: LockTag> Default for Guarded<T, Tag> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, Tag: LockTag> fmt::Debug for Guarded<T, Tag> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded").field("lock", &Tag::NAME).finish()
    }
}

/// Proof that the lock named by `Tag` is held.
pub struct GuardedRef<'a, T, Tag: LockTag> {
    guard: MutexGuard<'a, T>,
    _tag: PhantomData<fn() -> Tag>,
}

impl<'a, T, Tag: LockTag> GuardedRef<'a, T, Tag> {
    /// Blocks on `cv`, releasing the lock while waiting.
    pub fn wait(&mut self, cv: &Condvar) {
        cv.wait(&mut self.guard);
    }

    /// Blocks on `cv` for at most `timeout`.
    pub fn wait_for(&mut self, cv: &Condvar, timeout: Duration) -> WaitTimeoutResult {
        cv.wait_for(&mut self.guard, timeout)
    }

    /// Blocks on `cv` until `condition` returns false.
    pub fn wait_while(&mut self, cv: &Condvar, mut condition: impl FnMut(&mut T) -> bool) {
        while condition(&mut self.guard) {
            cv.wait(&mut self.guard);
        }
    }

    /// Temporarily releases the lock while running `f`.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        on_release::<Tag>();
        let result = MutexGuard::unlocked(&mut self.guard, f);
        on_acquire::<Tag>();
        result
    }
}

impl<T, Tag: LockTag> Deref for GuardedRef<'_, T, Tag> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, Tag: LockTag> DerefMut for GuardedRef<'_, T, Tag> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, Tag: LockTag> Drop for GuardedRef<'_, T, Tag> {
    fn drop(&mut self) {
        on_release::<Tag>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    lock_tag!(Outer, "outer", 10);
    lock_tag!(Inner, "inner", 20);

    #[test]
    fn test_lock_in_order() {
        let outer: Guarded<i32, Outer> = Guarded::new(1);
        let inner: Guarded<i32, Inner> = Guarded::new(2);
        let a = outer.lock();
        let b = inner.lock();
        assert_eq!(*a + *b, 3);
        if cfg!(debug_assertions) {
            assert_eq!(held_locks(), vec!["outer", "inner"]);
        }
        drop(b);
        drop(a);
        assert!(held_locks().is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_lock_order_violation_panics() {
        let outer: Guarded<i32, Outer> = Guarded::new(1);
        let inner: Guarded<i32, Inner> = Guarded::new(2);
        let _b = inner.lock();
        let _a = outer.lock();
    }

    #[test]
    fn test_wait_while() {
        let state: Arc<(Guarded<bool, Outer>, Condvar)> =
            Arc::new((Guarded::new(false), Condvar::new()));
        let remote = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            *remote.0.lock() = true;
            remote.1.notify_all();
        });
        let mut guard = state.0.lock();
        guard.wait_while(&state.1, |ready| !*ready);
        assert!(*guard);
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_unlocked_allows_reacquire() {
        let g: Guarded<i32, Outer> = Guarded::new(0);
        let mut guard = g.lock();
        guard.unlocked(|| {
            *g.lock() += 1;
        });
        assert_eq!(*guard, 1);
    }
}
