//! Typed collection cores.
//!
//! Each core wraps one or two B+Trees and adds null handling, ordering or
//! tombstone filtering. Cores never touch replication directly: every
//! mutation is reported to a [`CollectionHook`] supplied by the caller.

pub mod dictionary;
pub mod hook;
pub mod link_list;
pub mod list;
pub mod set;

pub use dictionary::DictionaryCore;
pub use hook::{CollectionHook, HookEvent, NoHook, RecordingHook};
pub use link_list::LnkLst;
pub use list::LstCore;
pub use set::SetCore;
