use thiserror::Error;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// The flow engine could not be brought up; tracking is disabled.
    #[error("object tracking unavailable: {0}")]
    Unavailable(String),

    #[error("tried to create a new object tracker before releasing the old one")]
    AlreadyActive,

    #[error("object tracker has been released")]
    Released,

    #[error("no tracked object with key {0:?}")]
    NotFound(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}
