//! Error taxonomy for the pool: setup-fatal, teardown-accumulated, and
//! prerequisite-unavailable, matching the three policies the pool applies
//! to failure.

/// Failures surfaced by the network pool.
///
/// `Setup` and `Unavailable` are returned before any guest is ever leased a
/// network; `Teardown` can only come out of [`crate::Pool::dispose`] and
/// always carries the joined text of every per-entry error encountered,
/// since dispose does not abort partway through.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool setup failed: {0}")]
    Setup(String),

    #[error("pool teardown reported one or more errors: {0}")]
    Teardown(String),

    #[error("pool prerequisites not met: {0}")]
    Unavailable(String),
}
