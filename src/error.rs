//! Error taxonomy shared by provider, indexing and job code.
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Upstream asked us to slow down. Converted into a deferred redelivery,
    /// never surfaced as a job failure.
    #[error("rate limited; retry after {0:?}")]
    RateLimited(Duration),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream record not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited(after) => Some(*after),
            _ => None,
        }
    }

    /// Find a rate-limit signal anywhere in an `anyhow` chain.
    pub fn rate_limit_in(err: &anyhow::Error) -> Option<Duration> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<SyncError>())
            .and_then(SyncError::retry_after)
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn rate_limit_survives_context() {
        let res: Result<(), SyncError> = Err(SyncError::RateLimited(Duration::from_secs(7)));
        let err = res.context("search page").unwrap_err();
        assert_eq!(SyncError::rate_limit_in(&err), Some(Duration::from_secs(7)));
    }

    #[test]
    fn other_errors_have_no_retry_after() {
        let err = anyhow::Error::new(SyncError::Timeout);
        assert_eq!(SyncError::rate_limit_in(&err), None);
    }
}
