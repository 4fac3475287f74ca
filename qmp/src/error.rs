//! Errors returned by the QMP client.

use snafu::Snafu;
use std::{io, time::Duration};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Failed to connect to QMP socket {}: {}", address, source))]
    Socket {
        source: io::Error,
        address: String,
    },
    #[snafu(display("QMP socket I/O error: {}", source))]
    Io {
        source: io::Error,
    },
    #[snafu(display("Unexpected QMP greeting: {}", greeting))]
    UnexpectedGreeting {
        greeting: String,
    },
    #[snafu(display(
        "QMP command {} failed ({}): {}",
        command,
        class,
        desc
    ))]
    Request {
        command: String,
        class: String,
        desc: String,
    },
    #[snafu(display("Timed out after {:?} waiting for {}", timeout, what))]
    Timeout {
        what: String,
        timeout: Duration,
    },
    #[snafu(display("Failed to encode QMP command {}: {}", command, source))]
    Encode {
        source: serde_json::Error,
        command: String,
    },
    #[snafu(display("Failed to decode QMP message: {}", source))]
    Decode {
        source: serde_json::Error,
    },
    #[snafu(display("QMP connection closed by peer"))]
    ConnectionClosed {},
}

impl Error {
    /// Error class reported by QEMU for a failed command.
    pub fn class(&self) -> Option<&str> {
        match self {
            Error::Request {
                class, ..
            } => Some(class),
            _ => None,
        }
    }
}
