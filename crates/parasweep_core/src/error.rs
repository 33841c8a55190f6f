use crate::protocol::ProtocolError;
use crate::valuation::ValuationError;
use thiserror::Error;

/// Failures that stop the process before any request is read.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("unrecognized model description kind `{0}`")]
    UnknownModelKind(String),
    #[error("partially observable models are not supported")]
    PartiallyObservable,
    #[error("continuous-time nondeterministic models are not supported")]
    ContinuousNondeterministic,
    #[error(transparent)]
    Load(#[from] anyhow::Error),
}

impl StartupError {
    /// Process exit code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::UnknownModelKind(_) => -1,
            StartupError::PartiallyObservable => -2,
            StartupError::ContinuousNondeterministic => -3,
            StartupError::Load(_) => 1,
        }
    }
}

/// Failure of a single evaluation request; never fatal to the loop.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Valuation(#[from] ValuationError),
    #[error("instantiation failed: {0:#}")]
    Instantiation(anyhow::Error),
    #[error("model checking failed: {0:#}")]
    Check(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            StartupError::UnknownModelKind("pepa".into()).exit_code(),
            StartupError::PartiallyObservable.exit_code(),
            StartupError::ContinuousNondeterministic.exit_code(),
            StartupError::Load(anyhow::anyhow!("boom")).exit_code(),
        ];
        assert_eq!(codes, [-1, -2, -3, 1]);
    }

    #[test]
    fn request_errors_render_causes() {
        let err = RequestError::Check(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "model checking failed: outer: inner");
    }
}
