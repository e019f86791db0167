//! Centralized error type for the vstbridge umbrella crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Host(#[from] vstbridge_host::HostError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<vstbridge_host::LoadError> for Error {
    fn from(e: vstbridge_host::LoadError) -> Self {
        Error::Host(e.into())
    }
}

impl From<vstbridge_host::StateFormatError> for Error {
    fn from(e: vstbridge_host::StateFormatError) -> Self {
        Error::Host(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
