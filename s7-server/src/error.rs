use std::{error::Error, fmt::Display, io};

use s7_protocol::{error::S7Error, types::Area};

/// Errors raised by the server's management API.
#[derive(Debug)]
pub enum ServerError {
    /// The listening socket could not be created.
    Bind(io::Error),
    Io(io::Error),
    AreaAlreadyExists { area: Area, index: u16 },
    UnknownArea { area: Area, index: u16 },
    InvalidParams(String),
    InvalidParamNumber(u8),
    /// The parameter is fixed while the server runs.
    CannotChangeParam(u8),
    Protocol(S7Error),
}

impl From<io::Error> for ServerError {
    fn from(value: io::Error) -> Self {
        ServerError::Io(value)
    }
}

impl From<S7Error> for ServerError {
    fn from(value: S7Error) -> Self {
        ServerError::Protocol(value)
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(error) => write!(f, "Cannot start listener: {}", error),
            ServerError::Io(error) => write!(f, "{}", error),
            ServerError::AreaAlreadyExists { area, index } => {
                write!(f, "Area {}{} is already registered", area, index)
            }
            ServerError::UnknownArea { area, index } => {
                write!(f, "Area {}{} is not registered", area, index)
            }
            ServerError::InvalidParams(detail) => write!(f, "Invalid parameters: {}", detail),
            ServerError::InvalidParamNumber(number) => {
                write!(f, "Invalid parameter number {}", number)
            }
            ServerError::CannotChangeParam(number) => {
                write!(f, "Parameter {} cannot be changed while running", number)
            }
            ServerError::Protocol(error) => write!(f, "{}", error),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::Bind(error) | ServerError::Io(error) => Some(error),
            ServerError::Protocol(error) => Some(error),
            _ => None,
        }
    }
}
