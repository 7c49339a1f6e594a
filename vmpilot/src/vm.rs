//! Virtual machine request and the on-disk layout of its artifacts

use std::{
    fmt,
    path::{Path, PathBuf},
};

/// File name of the boot disk inside the VM directory
pub const DISK_IMAGE_NAME: &str = "image.qcow2";
/// File name of the cloud-init seed media inside the VM directory
pub const SEED_IMAGE_NAME: &str = "seed.iso";
/// Bridge used when the request doesn't name one
pub const DEFAULT_BRIDGE: &str = "virbr0";

/// Everything needed to provision one virtual machine. It is provided once
/// and never mutated, build it with [crate::builder::spec::VmSpecBuilder].
#[derive(Clone, PartialEq)]
pub struct VmSpec {
    /// Optional human readable name, the durable handle is always generated
    pub display_name: Option<String>,
    /// Memory in GiB
    pub memory_gb: u64,
    pub vcpus: u32,
    /// Host bridge the guest network interface is attached to
    pub bridge: String,
    /// Password of the administrator account, only used for first boot
    pub password: String,
    /// Static address in CIDR notation, e.g. `192.168.122.10/24`
    pub ip_address: String,
    pub gateway: String,
    /// Body of the shell script run once at first boot
    pub script: String,
    /// Image the boot disk is derived from, any format `qemu-img` reads
    pub base_image: PathBuf,
    /// Boot disk capacity in GiB
    pub disk_gb: u64,
}

impl fmt::Debug for VmSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmSpec")
            .field("display_name", &self.display_name)
            .field("memory_gb", &self.memory_gb)
            .field("vcpus", &self.vcpus)
            .field("bridge", &self.bridge)
            .field("password", &"<redacted>")
            .field("ip_address", &self.ip_address)
            .field("gateway", &self.gateway)
            .field("script_len", &self.script.len())
            .field("base_image", &self.base_image)
            .field("disk_gb", &self.disk_gb)
            .finish()
    }
}

/// Where the artifacts of every VM live: one directory per VM, named after
/// the generated VM name, under a common base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    base_path: PathBuf,
}

impl ArtifactLayout {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> ArtifactLayout {
        ArtifactLayout {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(DISK_IMAGE_NAME)
    }

    pub fn seed_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(SEED_IMAGE_NAME)
    }
}
