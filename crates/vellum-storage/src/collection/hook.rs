//! Change-tracking seam for collections.

use vellum_common::types::Mixed;

/// Observes every mutation a collection core performs.
///
/// Indices are physical positions in the underlying tree. Dictionary
/// callbacks forward to the positional ones unless overridden.
pub trait CollectionHook {
    /// An element was inserted at `ndx`.
    fn on_insert(&mut self, _ndx: usize, _value: &Mixed) {}

    /// Element `ndx` was overwritten.
    fn on_set(&mut self, _ndx: usize, _value: &Mixed) {}

    /// Element `ndx` was removed.
    fn on_erase(&mut self, _ndx: usize) {}

    /// The element at `from` now lives at `to`.
    fn on_move(&mut self, _from: usize, _to: usize) {}

    /// Elements `a` and `b` traded places.
    fn on_swap(&mut self, _a: usize, _b: usize) {}

    /// All `old_size` elements were removed.
    fn on_clear(&mut self, _old_size: usize) {}

    /// A new key was inserted at `ndx`.
    fn on_dictionary_insert(&mut self, ndx: usize, _key: &str, value: &Mixed) {
        self.on_insert(ndx, value);
    }

    /// The value of an existing key at `ndx` was replaced.
    fn on_dictionary_set(&mut self, ndx: usize, _key: &str, value: &Mixed) {
        self.on_set(ndx, value);
    }

    /// The key at `ndx` was removed.
    fn on_dictionary_erase(&mut self, ndx: usize, _key: &str) {
        self.on_erase(ndx);
    }
}

/// A hook that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHook;

impl CollectionHook for NoHook {}

/// A hook that records every callback, for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecordingHook {
    /// Callbacks in the order received.
    pub events: Vec<HookEvent>,
}

/// One recorded hook callback.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    /// See [`CollectionHook::on_insert`].
    Insert(usize, Mixed),
    /// See [`CollectionHook::on_set`].
    Set(usize, Mixed),
    /// See [`CollectionHook::on_erase`].
    Erase(usize),
    /// See [`CollectionHook::on_move`].
    Move(usize, usize),
    /// See [`CollectionHook::on_swap`].
    Swap(usize, usize),
    /// See [`CollectionHook::on_clear`].
    Clear(usize),
}

impl CollectionHook for RecordingHook {
    fn on_insert(&mut self, ndx: usize, value: &Mixed) {
        self.events.push(HookEvent::Insert(ndx, value.clone()));
    }
    fn on_set(&mut self, ndx: usize, value: &Mixed) {
        self.events.push(HookEvent::Set(ndx, value.clone()));
    }
    fn on_erase(&mut self, ndx: usize) {
        self.events.push(HookEvent::Erase(ndx));
    }
    fn on_move(&mut self, from: usize, to: usize) {
        self.events.push(HookEvent::Move(from, to));
    }
    fn on_swap(&mut self, a: usize, b: usize) {
        self.events.push(HookEvent::Swap(a, b));
    }
    fn on_clear(&mut self, old_size: usize) {
        self.events.push(HookEvent::Clear(old_size));
    }
}
