//! Builders for the host tools vmpilot drives: `qemu-img` and `virsh`
use std::{path::PathBuf, time::Duration};

use crate::{
    builder::{Builder, BuilderError},
    command::{Tool, DEFAULT_COMMAND_TIMEOUT},
    hypervisor::virsh::Virsh,
    image::QemuImg,
};

use super::{determine_binary_location, required};

/// Environment variable pointing at the `qemu-img` binary
pub const QEMU_IMG_LOCATION: &str = "VMPILOT_QEMU_IMG";
/// Environment variable pointing at the `virsh` binary
pub const VIRSH_LOCATION: &str = "VMPILOT_VIRSH";
/// Connection used when none is provided
pub const DEFAULT_CONNECT_URI: &str = "qemu:///system";

#[derive(Debug)]
pub struct QemuImgBuilder {
    exec_binary: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Default for QemuImgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QemuImgBuilder {
    pub fn new() -> QemuImgBuilder {
        QemuImgBuilder {
            exec_binary: None,
            timeout: None,
        }
    }

    /// Locate `qemu-img` from `VMPILOT_QEMU_IMG`, then `$PATH`, then the
    /// current directory.
    ///
    /// Returns [BuilderError::BinaryNotFound] when none of them has it.
    pub fn auto() -> Result<QemuImgBuilder, BuilderError> {
        let binary_path = determine_binary_location("qemu-img", QEMU_IMG_LOCATION)?;
        Ok(Self::new().with_exec_binary(binary_path))
    }

    pub fn with_exec_binary(mut self, exec_binary: PathBuf) -> QemuImgBuilder {
        self.exec_binary = Some(exec_binary);
        self
    }

    /// Deadline for every conversion or resize, defaults to ten minutes
    pub fn with_timeout(mut self, timeout: Duration) -> QemuImgBuilder {
        self.timeout = Some(timeout);
        self
    }
}

impl Builder<QemuImg> for QemuImgBuilder {
    fn try_build(self) -> Result<QemuImg, BuilderError> {
        let exec_binary = required(stringify!(self.exec_binary), self.exec_binary)?;
        let tool = Tool::new(exec_binary).with_timeout(self.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT));
        Ok(QemuImg::new(tool))
    }
}

#[derive(Debug)]
pub struct VirshBuilder {
    exec_binary: Option<PathBuf>,
    connect_uri: Option<String>,
    timeout: Option<Duration>,
}

impl Default for VirshBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VirshBuilder {
    pub fn new() -> VirshBuilder {
        VirshBuilder {
            exec_binary: None,
            connect_uri: None,
            timeout: None,
        }
    }

    /// Locate `virsh` from `VMPILOT_VIRSH`, then `$PATH`, then the current
    /// directory, and connect to `qemu:///system`.
    pub fn auto() -> Result<VirshBuilder, BuilderError> {
        let binary_path = determine_binary_location("virsh", VIRSH_LOCATION)?;
        Ok(Self::new()
            .with_exec_binary(binary_path)
            .with_connect_uri(DEFAULT_CONNECT_URI.to_string()))
    }

    pub fn with_exec_binary(mut self, exec_binary: PathBuf) -> VirshBuilder {
        self.exec_binary = Some(exec_binary);
        self
    }

    pub fn with_connect_uri(mut self, connect_uri: String) -> VirshBuilder {
        self.connect_uri = Some(connect_uri);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> VirshBuilder {
        self.timeout = Some(timeout);
        self
    }
}

impl Builder<Virsh> for VirshBuilder {
    fn try_build(self) -> Result<Virsh, BuilderError> {
        let exec_binary = required(stringify!(self.exec_binary), self.exec_binary)?;
        let connect_uri = required(stringify!(self.connect_uri), self.connect_uri)?;
        if connect_uri.is_empty() {
            return Err(BuilderError::InvalidField(
                stringify!(self.connect_uri).to_string(),
                "must not be empty".to_string(),
            ));
        }
        let tool = Tool::new(exec_binary)
            .with_base_args(vec!["-c".to_string(), connect_uri.clone()])
            .with_timeout(self.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT));
        Ok(Virsh::new(tool, connect_uri))
    }
}
