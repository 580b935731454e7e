#[macro_use]
pub mod macros;

pub mod builder;
pub mod canonical;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod guard;
pub mod inject;
pub mod layout;
pub mod link;
pub mod path_map;
pub mod piece_size;
pub mod resume;
pub mod retry;
pub mod search;

pub use error::{Error, Result};

/// Runs filesystem-heavy work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("blocking task failed: {e}")))?
}
