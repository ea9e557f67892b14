use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    /// HTTP 429 from the data service. Not retried here; callers decide.
    #[error("rate limited fetching {dataset}{}", retry_hint(.retry_after))]
    RateLimited {
        dataset: String,
        retry_after: Option<Duration>,
    },

    #[error("remote error {status}: {body}")]
    Remote { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FetchError;
    use std::time::Duration;

    #[test]
    fn rate_limit_helpers() {
        let err = FetchError::RateLimited {
            dataset: "fireIncidents".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(
            err.to_string(),
            "rate limited fetching fireIncidents (retry after 30s)"
        );

        let err = FetchError::Remote {
            status: 500,
            body: "boom".into(),
        };
        assert!(!err.is_rate_limited());
        assert_eq!(err.retry_after(), None);
    }
}
