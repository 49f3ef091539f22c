#![warn(missing_docs)]

//! Stowage content-addressable storage
//!
//! [`CasStorage`] presents the [`stowage_storage::Storage`] contract over a
//! snapshot repository from `stowage_reduce`: each push becomes a
//! deduplicated, compressed and sealed version, and a sidecar of small
//! metadata records maps logical paths to their live versions. The
//! [`StackBuilder`] composes a full stack from environment configuration and
//! [`run_maintenance`] reaches the repository through any number of wrappers.

pub mod cas;
pub mod config;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod record;
pub mod stack;

pub use cas::{CasStorage, ListReport, PushReport, ReclaimReport, RemoveReport};
pub use config::{CasConfig, EncryptionConfig, StackConfig};
pub use error::{SoftError, SoftOp};
pub use maintenance::{find_cas, run_maintenance, MaintenanceReport};
pub use record::{MetaRecord, META_SUFFIX, SHADOW_SUFFIX};
pub use stack::{Stack, StackBuilder};
pub use stowage_reduce::SafetyLevel;
