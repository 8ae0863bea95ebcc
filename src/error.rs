use thiserror::Error;

/// Failures inside the analyzer. None of these reach the result sink; a
/// failed frame simply produces no result.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("session creation failed: {0:#}")]
    SessionCreation(anyhow::Error),
    #[error("preprocessing failed: {0}")]
    Preprocess(String),
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("transient buffer release failed: {0}")]
    ResourceRelease(String),
    #[error("analyzer is not available")]
    Unavailable,
    #[error("analyzer is busy with another frame")]
    Busy,
}
