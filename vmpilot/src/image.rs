//! # Boot disk preparation
//!
//! The boot disk of every VM is a private qcow2 copy of the base image,
//! grown to the requested capacity. The work is behind [ImageConverter] so
//! the orchestrator does not care whether a subprocess or an in-process
//! library does it; [QemuImg] shells out to `qemu-img`.
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::command::{CommandError, Tool};

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("could not convert {input} to {output}, reason: {source}")]
    Convert {
        input: String,
        output: String,
        #[source]
        source: CommandError,
    },
    #[error("could not resize {path} to {size_gb}G, reason: {source}")]
    Resize {
        path: String,
        size_gb: u64,
        #[source]
        source: CommandError,
    },
    #[error("cannot resize {path} to {size_gb}G, size out of range")]
    SizeOutOfRange { path: String, size_gb: u64 },
}

/// Disk image operations needed to prepare a boot disk
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// Copy `input` to a new qcow2 image at `output`
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ImageError>;
    /// Grow the image at `path` to `size_gb` GiB
    async fn resize(&self, path: &Path, size_gb: u64) -> Result<(), ImageError>;
}

/// [ImageConverter] backed by the `qemu-img` binary, build it with
/// [crate::builder::tools::QemuImgBuilder].
#[derive(Debug, Clone)]
pub struct QemuImg {
    tool: Tool,
}

impl QemuImg {
    pub fn new(tool: Tool) -> QemuImg {
        QemuImg { tool }
    }

    pub fn program(&self) -> &Path {
        self.tool.program()
    }

    pub(crate) fn convert_args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "convert".to_string(),
            "-O".to_string(),
            "qcow2".to_string(),
            input.display().to_string(),
            output.display().to_string(),
        ]
    }

    /// Size is given to qemu-img in MiB, `None` when it does not fit a u64
    pub(crate) fn resize_args(path: &Path, size_gb: u64) -> Option<Vec<String>> {
        let size_mb = size_gb.checked_mul(1024)?;
        Some(vec![
            "resize".to_string(),
            path.display().to_string(),
            format!("{}MB", size_mb),
        ])
    }
}

#[async_trait]
impl ImageConverter for QemuImg {
    #[instrument(skip(self), fields(input = %input.display(), output = %output.display()))]
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ImageError> {
        self.tool
            .run(&Self::convert_args(input, output))
            .await
            .map_err(|source| ImageError::Convert {
                input: input.display().to_string(),
                output: output.display().to_string(),
                source,
            })?;
        debug!("Base image converted");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn resize(&self, path: &Path, size_gb: u64) -> Result<(), ImageError> {
        let args =
            Self::resize_args(path, size_gb).ok_or_else(|| ImageError::SizeOutOfRange {
                path: path.display().to_string(),
                size_gb,
            })?;
        self.tool
            .run(&args)
            .await
            .map_err(|source| ImageError::Resize {
                path: path.display().to_string(),
                size_gb,
                source,
            })?;
        debug!("Disk resized to {}G", size_gb);
        Ok(())
    }
}
