use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum SoilError {
    #[error("Moisture probe read failed: {0}")]
    ProbeRead(String),

    #[error("App event queue full")]
    EventQueueFull,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SoilError>;
