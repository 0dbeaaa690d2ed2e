use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Failed to initialize audio output: {0}")]
    AudioInitFailed(String),

    #[error("Media handle has no audio track")]
    NoAudioTrack,

    #[error("Invalid audio configuration: {0}")]
    InvalidConfig(String),
}
