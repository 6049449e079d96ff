use std::fmt;

use canonical_error::CanonicalError;
use thiserror::Error;

use crate::abstract_camera::StreamRole;

/// Stage of the session in which a failure happened. Used in the diagnostic
/// printed when a capture session has to be abandoned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetupStage {
    Configure,
    Allocate,
    CreateRequest,
    Queue,
    Pipeline,
    Control,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SetupStage::Configure => "configure",
            SetupStage::Allocate => "allocate",
            SetupStage::CreateRequest => "create-request",
            SetupStage::Queue => "queue",
            SetupStage::Pipeline => "pipeline",
            SetupStage::Control => "control",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The device rejected the requested role set or stream parameters.
    #[error("camera rejected configuration: {cause}")]
    ConfigurationError { cause: CanonicalError },

    /// The device could not switch to a validated configuration.
    #[error("failed to apply configuration: {cause}")]
    ConfigurationFailure { cause: CanonicalError },

    #[error("buffer allocation for {role} stream failed: {cause}")]
    AllocationFailure { role: StreamRole, cause: CanonicalError },

    #[error("could not create request {index} for {role} stream")]
    RequestCreationFailure { role: StreamRole, index: usize },

    #[error("could not bind buffer {index} to {role} request: {cause}")]
    BufferBindingFailure { role: StreamRole, index: usize, cause: CanonicalError },

    #[error("camera refused request {request}: {cause}")]
    QueueFailure { request: u64, cause: CanonicalError },

    #[error("pipeline {action} failed: {cause}")]
    PipelineFailure { action: &'static str, cause: CanonicalError },

    #[error("{operation} is not allowed in state {state}")]
    InvalidState { operation: &'static str, state: String },
}

impl SessionError {
    pub fn stage(&self) -> SetupStage {
        match self {
            SessionError::ConfigurationError { .. } |
            SessionError::ConfigurationFailure { .. } => SetupStage::Configure,
            SessionError::AllocationFailure { .. } => SetupStage::Allocate,
            SessionError::RequestCreationFailure { .. } |
            SessionError::BufferBindingFailure { .. } => SetupStage::CreateRequest,
            SessionError::QueueFailure { .. } => SetupStage::Queue,
            SessionError::PipelineFailure { .. } => SetupStage::Pipeline,
            SessionError::InvalidState { .. } => SetupStage::Control,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonical_error::invalid_argument_error;

    #[test]
    fn test_stage_names() {
        let err = SessionError::AllocationFailure{
            role: StreamRole::StillCapture,
            cause: invalid_argument_error("no memory")};
        assert_eq!(err.stage(), SetupStage::Allocate);
        assert_eq!(err.stage().to_string(), "allocate");
        assert!(err.to_string().contains("StillCapture"));

        let err = SessionError::RequestCreationFailure{
            role: StreamRole::Viewfinder, index: 2};
        assert_eq!(err.stage().to_string(), "create-request");
    }
}
