pub mod action_queue;
pub mod backoff;
pub mod item_store;
pub mod paths;
mod reconcile;
pub mod record;
pub mod scheduler;
pub mod vault;

pub use reconcile::ReconcileReport;
pub(crate) use reconcile::reconcile;

/// Wall-clock time in unix milliseconds, the unit of `retry_at` and the
/// record timestamps.
pub(crate) fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
