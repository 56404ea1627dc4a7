use playback_common::CommonError;
use player::PlayerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Common(#[from] CommonError),

    #[error("Playback failed: {0}")]
    Player(#[from] PlayerError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
