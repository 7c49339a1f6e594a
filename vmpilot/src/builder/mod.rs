//! # Builder Pattern
//!
//! Every component that needs configuration before it can be used is created
//! through a builder. All fields are optional on the builder and validated
//! once you call [`Builder::try_build`]; a successful build can be trusted to
//! be complete.
//!
//! ## Example
//!
//! ```rust
//! use std::path::PathBuf;
//! use vmpilot::builder::{Builder, spec::VmSpecBuilder, tools::QemuImgBuilder};
//!
//! let spec = VmSpecBuilder::new()
//!     .with_memory_gb(4)
//!     .with_vcpus(2)
//!     .with_disk_gb(25)
//!     .with_password("hunter2".to_string())
//!     .with_ip_address("192.168.122.10/24".to_string())
//!     .with_gateway("192.168.122.1".to_string())
//!     .with_base_image(PathBuf::from("/var/lib/libvirt/images/jammy.img"))
//!     .try_build()
//!     .unwrap();
//!
//! let qemu_img = QemuImgBuilder::new()
//!     .with_exec_binary(PathBuf::from("/usr/bin/qemu-img"))
//!     .try_build()
//!     .unwrap();
//! ```
use std::{
    env::{split_paths, var_os},
    path::PathBuf,
};

pub mod provisioner;
pub mod spec;
pub mod tools;

fn required<T>(key: &str, value: Option<T>) -> Result<T, BuilderError> {
    match value {
        Some(value) => Ok(value),
        None => Err(BuilderError::MissingRequiredField(key.to_string())),
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BuilderError {
    /// The field is required but was not provided in the builder object
    #[error("missing required field {0}")]
    MissingRequiredField(String),
    /// A field was provided but its value cannot be used
    #[error("invalid value for {0}: {1}")]
    InvalidField(String, String),
    /// Happens when using auto methods to detect `qemu-img` or `virsh`
    #[error("binary not found: {0}")]
    BinaryNotFound(String),
}

/// Generic trait which all builder components implement
pub trait Builder<T> {
    /// Validate all the fields from the builder object and apply it to the
    /// final object
    fn try_build(self) -> Result<T, BuilderError>;
}

/// Tries to determine where a host binary lives, from several sources (top to
/// bottom priority):
///
/// - `env_var` environment variable: direct path to the binary
/// - `$PATH` environment variable: search for the binary in the directories
/// - the binary in the current working directory
pub(crate) fn determine_binary_location(name: &str, env_var: &str) -> Result<PathBuf, BuilderError> {
    find_binary_from_env_location(env_var)
        .or_else(|| find_binary_from_path(name))
        .or_else(|| find_binary_from_current_directory(name))
        .ok_or_else(|| {
            BuilderError::BinaryNotFound(format!(
                "{} is not installed, or set {} to its location",
                name, env_var
            ))
        })
}

fn find_binary_from_env_location(env_var: &str) -> Option<PathBuf> {
    if let Some(path) = var_os(env_var) {
        if PathBuf::from(&path).is_file() {
            return Some(PathBuf::from(path));
        }

        tracing::warn!("{} is set but the file does not exist: {:?}", env_var, path);
    }
    None
}

fn find_binary_from_path(name: &str) -> Option<PathBuf> {
    var_os("PATH").and_then(|paths| {
        split_paths(&paths)
            .map(|d| d.join(name))
            .find(|full_path| full_path.is_file())
    })
}

fn find_binary_from_current_directory(name: &str) -> Option<PathBuf> {
    let full_path = PathBuf::from(".").join(name);
    match full_path.is_file() {
        true => Some(full_path),
        false => None,
    }
}
