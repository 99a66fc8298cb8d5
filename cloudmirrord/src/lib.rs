pub mod activity;
pub mod config;
pub mod core;
pub mod error;
pub mod query;
pub mod sync;

pub use activity::{ActionOutput, Activity, ActivityId, ActivityResult, Progress};
pub use config::CoreConfig;
pub use core::{CopyOptions, Core, CoreDelegate, UploadOptions};
pub use error::{ActionError, CoreError, ErrorKind};
pub use query::{
    ChangeSet, FilterCondition, MovedItem, Query, QueryFilter, QueryHandle, QueryId, QueryScope,
    QueryUpdate,
};
pub use sync::ReconcileReport;
pub use sync::item_store::Item;
pub use sync::paths::PathCase;
pub use sync::record::{ActionKind, RecordState, SyncRecord};
pub use sync::vault::{Vault, VaultStatus};
