use crate::model::ErrorKind;

/// Malformed task data. Raised before any external call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("invalid k: {0} (must be a positive integer)")]
    InvalidK(i64),
    #[error("task requests no metrics")]
    NoMetrics,
    #[error("unknown metric '{0}' (supported: ndcg, precision, recall)")]
    UnknownMetric(String),
    #[error("invalid strategy '{id}': {reason}")]
    InvalidStrategy { id: String, reason: String },
    #[error("rating {rating} is outside the workspace rating scale [{min}, {max}]")]
    RatingOutOfScale { rating: i64, min: i64, max: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request timed out after {0} ms")]
    Timeout(u64),
    #[error("store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("scoring operation reported failures for {count} request(s): {detail}")]
    ScoringFailures { count: usize, detail: String },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Classifies an error for the persisted evaluation record.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    if err.downcast_ref::<TaskError>().is_some() {
        ErrorKind::Validation
    } else if err.downcast_ref::<StoreError>().is_some()
        || err.downcast_ref::<reqwest::Error>().is_some()
        || err.downcast_ref::<rusqlite::Error>().is_some()
    {
        ErrorKind::Store
    } else {
        ErrorKind::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let e: anyhow::Error = TaskError::InvalidK(0).into();
        assert_eq!(classify(&e), ErrorKind::Validation);

        let e: anyhow::Error = StoreError::Timeout(10).into();
        assert_eq!(classify(&e), ErrorKind::Store);

        let e = anyhow::anyhow!("boom").context("while folding");
        assert_eq!(classify(&e), ErrorKind::Internal);
    }

    #[test]
    fn test_classify_sees_through_context() {
        let e = anyhow::Error::from(TaskError::NoMetrics).context("validating task");
        assert_eq!(classify(&e), ErrorKind::Validation);
    }
}
