//! # Composable Architecture Shared State
//!
//! State that lives outside a single feature's state tree:
//!
//! - [`Shared`]: a reference type. Every clone sees and makes the same
//!   changes, and observers are told about each one.
//! - [`PersistenceKey`]: where a shared value is persisted. Shared values
//!   created with equal keys are the same reference while any is alive.
//!   [`InMemoryKey`] lasts for the process. [`FileStorageKey`] writes to a
//!   file and follows edits made to it by other processes.
//! - [`SharedChangeTracker`]: lets tests assert on shared changes the same
//!   way they assert on plain state.
//!
//! Storage backends are dependencies, so tests get in-memory storage
//! without asking for it.
//!
//! ## Example
//!
//! ```
//! use composable_arch_core::DependencyValues;
//! use composable_arch_shared::{InMemoryKey, Shared};
//!
//! DependencyValues::test().enter(|| {
//!     let signed_in = Shared::with_key(false, InMemoryKey::new("signed-in"));
//!     let elsewhere = Shared::with_key(false, InMemoryKey::new("signed-in"));
//!
//!     elsewhere.set(true);
//!     assert!(signed_in.get());
//! });
//! ```

mod change_tracking;
mod error;
mod file_storage;
mod in_memory;
mod persistence;
mod reference;

pub use change_tracking::{SharedChangeTracker, with_shared_change_tracking};
pub use error::PersistenceError;
pub use file_storage::{
    BincodeCodec, Codec, DefaultFileStorageKey, FileStorage, FileStorageConfig, FileStorageKey,
    InMemoryFileStorage, JsonCodec, LiveFileStorage, OnChange, Work,
};
pub use in_memory::{InMemoryKey, InMemoryStorage, InMemoryStorageKey};
pub use persistence::{
    CacheId, DidSet, PersistenceKey, PersistentReferences, PersistentReferencesKey, Subscription,
};
pub use reference::{Shared, SharedChange, SharedReader};
