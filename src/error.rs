use std::io;

use crate::bpf::FilterError;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("{0}")]
    InsufficientPermission(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid capture filter: {0}")]
    FilterCompile(#[from] FilterError),
    #[error("could not create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("could not attach filter: {0}")]
    AttachFilter(#[source] io::Error),
    #[error("could not set packet version: {0}")]
    PacketVersion(#[source] io::Error),
    #[error("could not set ring buffer: {0}")]
    RingGeometry(#[source] io::Error),
    #[error("could not set memory mapping: {0}")]
    Mmap(#[source] io::Error),
    #[error("could not bind to interface {interface}: {source}")]
    Bind {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("session is {0}, block operations need an active session")]
    NotActive(crate::capture::SessionState),
    #[error("waiting for a ring block failed: {0}")]
    Wait(#[source] io::Error),
    #[error("could not read socket statistics: {0}")]
    Stats(#[source] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[source] io::Error),
}
