//! # Hypervisor boundary
//!
//! Everything vmpilot asks of the hypervisor goes through [Hypervisor]: look
//! up a domain, define one from its XML, start it and open one of its
//! character devices as a byte stream. One implementation is shared by the
//! provisioner and the console relay, it is injected into both.
//!
//! [virsh::Virsh] drives a local libvirt daemon through the `virsh` binary.
use std::{fmt, str::FromStr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::command::CommandError;

pub mod virsh;

/// Alias libvirt gives the first serial port of a domain
pub const CONSOLE_DEVICE: &str = "serial0";

#[derive(thiserror::Error, Debug)]
pub enum HypervisorError {
    #[error("could not {operation} domain {domain}, reason: {source}")]
    Command {
        operation: &'static str,
        domain: String,
        #[source]
        source: CommandError,
    },
    #[error("domain {0} does not exist")]
    NotFound(String),
    #[error("unknown state {1:?} reported for domain {0}")]
    UnknownState(String, String),
    #[error("could not read description of domain {0}, reason: {1}")]
    Description(String, String),
    #[error("domain {domain} has no console device {device}")]
    ConsoleUnavailable { domain: String, device: String },
    #[error("could not open console {path}, reason: {source}")]
    ConsoleOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle state of a domain as far as vmpilot cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// Known to the hypervisor but shut off
    Defined,
    Running,
    /// Paused, crashed, suspended or on its way down
    Stopped,
}

impl FromStr for DomainState {
    type Err = String;

    /// Parse the state names printed by `virsh domstate`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "running" | "idle" | "blocked" => Ok(DomainState::Running),
            "shut off" => Ok(DomainState::Defined),
            "paused" | "in shutdown" | "crashed" | "pmsuspended" | "dying" => {
                Ok(DomainState::Stopped)
            }
            other => Err(other.to_string()),
        }
    }
}

/// Duplex byte stream attached to a domain character device
pub struct ConsoleStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ConsoleStream {
    pub fn new<R, W>(reader: R, writer: W) -> ConsoleStream
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        ConsoleStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Separate the halves so each pump direction owns one
    pub fn split(
        self,
    ) -> (
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    ) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for ConsoleStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleStream").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// State of domain `name`, `None` when no such domain exists
    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainState>, HypervisorError>;
    /// Register a persistent domain from its XML description
    async fn define_domain(&self, xml: &str) -> Result<(), HypervisorError>;
    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;
    /// Attach to the character device of `name` aliased `device`
    async fn open_console(&self, name: &str, device: &str)
        -> Result<ConsoleStream, HypervisorError>;
}
