//! # MeshKV Storage
//!
//! The storage contract consumed by the MeshKV sync core.
//!
//! The real storage engine lives outside this workspace. The sync core
//! only ever talks to it through the narrow [`KvStorage`] trait:
//! raw bytes by key, a max-timestamp register, opaque metadata pairs and
//! transaction brackets. Stores are **opaque byte stores** - they do not
//! interpret the keys or values they hold.
//!
//! ## Available Stores
//!
//! - [`MemoryStorage`] - For testing and ephemeral databases
//! - [`FileStorage`] - Snapshot file that survives process restarts
//!
//! ## Example
//!
//! ```rust
//! use meshkv_storage::{DataKind, KvStorage, MemoryStorage};
//!
//! let storage = MemoryStorage::new();
//! storage.put_kv_data(DataKind::Local, b"key", b"value").unwrap();
//! let value = storage.get_kv_data(DataKind::Local, b"key").unwrap();
//! assert_eq!(value.as_deref(), Some(&b"value"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{DataKind, KvStorage, Timestamp};
pub use error::{StorageError, StorageResult};
pub use file::FileStorage;
pub use memory::MemoryStorage;
