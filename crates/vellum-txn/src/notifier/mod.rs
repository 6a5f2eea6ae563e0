//! Change notifications.
//!
//! [`TransactionChangeInfo`] observes the instructions a read transaction
//! replays while advancing and groups them per table and per collection.
//! [`NotifierCoordinator`] runs those advances, on demand or on a worker
//! thread, and delivers the results to registered callbacks.

mod change_builder;
mod change_info;
mod coordinator;
mod index_set;

pub use change_builder::{CollectionChangeBuilder, CollectionChangeSet, Move};
pub use change_info::{CollectionPath, ObjectChangeSet, TransactionChangeInfo};
pub use coordinator::{
    ChangeKind, ChangeNotification, NotificationCallback, NotificationToken, NotifierCoordinator,
    NotifierStats, ObserveTarget,
};
pub use index_set::IndexSet;
