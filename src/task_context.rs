//! TaskContext (C4): a key→value map scoped to the currently executing tokio task.
//!
//! Built directly on a thread-local with task-aware wrappers: `tokio::task_local!` itself,
//! generalized here to hold more than one value type behind a single scope so `Transaction`
//! and `Query` can each keep their own task-local slot without every caller having to enter a
//! separate scope per component.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

tokio::task_local! {
    static CONTEXT: RefCell<HashMap<(TypeId, u64), Box<dyn Any + Send>>>;
}

/// Source of the per-instance ids that disambiguate two [`TaskContext`] handles of the same
/// `T` (e.g. two `Query`s over different tables) so they never alias the same storage slot.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Runs `fut` with a fresh, empty [`TaskContext`] scope active for its duration.
///
/// Nested calls get their own independent scope (shadowing, per `tokio::task_local!`
/// semantics) — values set in an outer scope are not visible to an inner one. Most callers
/// only need one scope per task and should call this once near the top of the task.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    CONTEXT.scope(RefCell::new(HashMap::new()), fut).await
}

/// Handle for reading/writing task-local state of a specific type `T`.
///
/// Each distinct `T` gets its own family of slots in the underlying map, keyed by `TypeId`, so
/// `Transaction`'s state and `Query`'s builder state never collide even though both live in the
/// same scope. Within one `T` (e.g. two separate `Query<M>` façades over different tables, both
/// using the same `QueryState`), a per-instance id assigned at construction further
/// disambiguates: without it every `Query`, regardless of which table it faces, would alias the
/// same storage slot the moment two of them were used from the same task.
pub struct TaskContext<T> {
    id: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Clone for TaskContext<T> {
    /// Preserves the id: a clone is the same logical façade, just another handle to it, so it
    /// must keep observing the same task-local storage the original would in that task.
    fn clone(&self) -> Self {
        TaskContext {
            id: self.id,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Default + Send + 'static> TaskContext<T> {
    /// A fresh handle for type `T`, with a new instance id distinct from every other
    /// `TaskContext<T>` (use [`Clone`] instead of calling this again for a second handle onto
    /// the same logical state).
    pub fn new() -> Self {
        TaskContext {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            _marker: std::marker::PhantomData,
        }
    }

    fn key(&self) -> (TypeId, u64) {
        (TypeId::of::<T>(), self.id)
    }

    /// Run `f` with mutable access to this task's `T`, initializing it with `T::default()` on
    /// first access.
    ///
    /// # Panics
    ///
    /// Panics if called outside a [`scope`] — matching `tokio::task_local!`'s own behavior for
    /// un-scoped access, since there is no sensible fallback storage to use instead.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        CONTEXT.with(|cell| {
            let mut map = cell.borrow_mut();
            let entry = map.entry(self.key()).or_insert_with(|| Box::new(T::default()));
            let value = entry.downcast_mut::<T>().expect("TaskContext type mismatch");
            f(value)
        })
    }

    /// Run `f` with shared access to this task's `T`, initializing it with `T::default()` on
    /// first access.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.with_mut(|v| f(v))
    }

    /// Like [`Self::with`], but returns `None` instead of panicking when called outside a
    /// [`scope`]. Used by best-effort cleanup paths (e.g. a `Drop` impl) that may run after the
    /// owning task's scope has already been torn down.
    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        CONTEXT
            .try_with(|cell| {
                let mut map = cell.borrow_mut();
                let entry = map.entry(self.key()).or_insert_with(|| Box::new(T::default()));
                let value = entry.downcast_ref::<T>().expect("TaskContext type mismatch");
                f(value)
            })
            .ok()
    }

    /// Like [`Self::with_mut`], but returns `None` instead of panicking when called outside a
    /// [`scope`].
    pub fn try_with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        CONTEXT
            .try_with(|cell| {
                let mut map = cell.borrow_mut();
                let entry = map.entry(self.key()).or_insert_with(|| Box::new(T::default()));
                let value = entry.downcast_mut::<T>().expect("TaskContext type mismatch");
                f(value)
            })
            .ok()
    }
}

impl<T: Default + Send + 'static> Default for TaskContext<T> {
    fn default() -> Self {
        Self::new()
    }
}
