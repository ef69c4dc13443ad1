//! Error types for the gattlink library
//!
//! This module defines the error types used throughout the library.

use std::io;
use thiserror::Error;

/// Faults reported by the radio transport underneath a session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable: {0}")]
    Unavailable(String),

    #[error("Transport operation timed out")]
    Timeout,

    #[error("Request rejected by peer: {0}")]
    Rejected(String),

    #[error("Link to peer lost")]
    LinkLost,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(String),
}

/// Errors surfaced to consumers of sessions, streams and clients
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("Service discovery failed: {0}")]
    Discovery(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Session busy with another operation")]
    Busy,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::ReadTimeout => io::ErrorKind::TimedOut,
            Error::Busy => io::ErrorKind::WouldBlock,
            Error::Configuration(_) => io::ErrorKind::InvalidInput,
            Error::Transport(TransportError::Timeout) => io::ErrorKind::TimedOut,
            Error::Connection(_) | Error::Transport(TransportError::LinkLost) => {
                io::ErrorKind::ConnectionAborted
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
