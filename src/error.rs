use thiserror::Error;

/// Everything that can sink a generation once the pipeline is involved.
///
/// Session-level rejections (bad framing, unparseable JSON) never reach this
/// enum; the session logs them and closes the connection before any stage
/// runs.
#[derive(Debug, Error)]
pub enum Error {
    /// The request could not be decoded or failed validation.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The request named a model that is not in the models directory.
    #[error("unknown model: {name}")]
    UnknownModel {
        name: String,
        suggestion: Option<String>,
    },

    /// The model (or its adapters) could not be loaded onto the accelerator.
    /// Resident state is left cleared, so the next request retries the load.
    #[error("failed to load {model}")]
    ModelLoad {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    /// The region-detection worker is gone. There is no automatic restart;
    /// the request fails instead of hanging on a dead channel.
    #[error("detection worker is unavailable")]
    DetectorUnavailable,

    /// Region detection ran but failed.
    #[error("region detection failed")]
    Detection(#[source] anyhow::Error),

    /// The caller hung up mid-generation. Not a failure: the pipeline
    /// unwinds at the next step boundary and nothing is delivered.
    #[error("caller disconnected")]
    Interrupted,

    /// A synthesis stage blew up on the accelerator.
    #[error("{stage} stage failed")]
    Synthesis {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wraps a stage failure, letting an `Interrupted` raised by the per-step
/// callback pass through untouched.
pub fn stage(stage: &'static str, error: anyhow::Error) -> Error {
    match error.downcast::<Error>() {
        Ok(error) => error,
        Err(error) => Error::Synthesis {
            stage,
            source: error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_keeps_interruptions() {
        let wrapped = stage("base", anyhow::Error::new(Error::Interrupted));
        assert!(matches!(wrapped, Error::Interrupted));
    }

    #[test]
    fn test_stage_wraps_backend_errors() {
        let wrapped = stage("base", anyhow::anyhow!("out of memory"));
        assert!(matches!(wrapped, Error::Synthesis { stage: "base", .. }));
    }
}
