//! # Domain descriptor
//!
//! Turns the few values that vary per VM (name, memory, vCPUs, MAC address,
//! bridge and artifact paths) into the libvirt domain XML submitted to the
//! hypervisor. Everything else about the virtual hardware is fixed below.
//!
//! Generation is pure: the same descriptor always serializes to the same
//! bytes. The only random input, the MAC address, is drawn once in
//! [DomainDescriptor::new] and can be pinned with [DomainDescriptor::with_mac].
use serde::Serialize;
use tracing::trace;
use vmpilot_models::models::domain::{
    Boot, Clock, Console, ConsoleTarget, Cpu, Devices, Disk, DiskDriver, DiskSource, DiskTarget,
    Domain, Features, Flag, Graphics, Interface, InterfaceMac, InterfaceModel, InterfaceSource,
    Memory, Os, OsType, Serial, SerialTarget,
};

use crate::{mac::MacAddress, vm::ArtifactLayout};

pub const DOMAIN_TYPE: &str = "kvm";
pub const MEMORY_UNIT: &str = "GiB";
pub const OS_TYPE: &str = "hvm";
pub const ARCH: &str = "x86_64";
pub const MACHINE: &str = "pc";
pub const BOOT_DEVICE: &str = "hd";
pub const CPU_MODE: &str = "host-passthrough";
pub const CLOCK_OFFSET: &str = "utc";
pub const ON_POWEROFF: &str = "destroy";
pub const ON_REBOOT: &str = "restart";
pub const ON_CRASH: &str = "destroy";
pub const EMULATOR: &str = "/usr/bin/qemu-system-x86_64";

pub const DISK_TARGET: &str = "vda";
pub const DISK_CACHE: &str = "writeback";
pub const CDROM_TARGET: &str = "hdc";
pub const NIC_MODEL: &str = "virtio";
pub const VNC_LISTEN: &str = "0.0.0.0";

#[derive(thiserror::Error, Debug)]
pub enum DescriptorError {
    #[error("invalid descriptor input {0}: {1}")]
    Invalid(String, String),
    #[error("could not serialize domain {0}, reason: {1}")]
    Serialize(String, String),
}

/// Per-VM inputs of the domain XML
#[derive(Debug, Clone, PartialEq)]
pub struct DomainDescriptor {
    name: String,
    memory_gb: u64,
    vcpus: u32,
    mac: MacAddress,
    bridge: String,
    layout: ArtifactLayout,
}

impl DomainDescriptor {
    /// Describe domain `name` with a freshly generated MAC address
    pub fn new(
        name: &str,
        memory_gb: u64,
        vcpus: u32,
        bridge: &str,
        layout: &ArtifactLayout,
    ) -> DomainDescriptor {
        DomainDescriptor {
            name: name.to_string(),
            memory_gb,
            vcpus,
            mac: MacAddress::generate(),
            bridge: bridge.to_string(),
            layout: layout.clone(),
        }
    }

    /// Use `mac` instead of the generated address, it must be the one written
    /// in the seed network configuration
    pub fn with_mac(self, mac: MacAddress) -> DomainDescriptor {
        DomainDescriptor { mac, ..self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.is_empty() {
            return Err(DescriptorError::Invalid(
                "name".to_string(),
                "must not be empty".to_string(),
            ));
        }
        if self.bridge.is_empty() {
            return Err(DescriptorError::Invalid(
                "bridge".to_string(),
                "must not be empty".to_string(),
            ));
        }
        if self.memory_gb == 0 || self.vcpus == 0 {
            return Err(DescriptorError::Invalid(
                "resources".to_string(),
                "memory and vcpus must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_domain(&self) -> Domain {
        Domain {
            domain_type: DOMAIN_TYPE.to_string(),
            name: self.name.clone(),
            memory: Memory {
                unit: MEMORY_UNIT.to_string(),
                value: self.memory_gb,
            },
            vcpu: self.vcpus,
            os: Os {
                os_type: OsType {
                    arch: ARCH.to_string(),
                    machine: MACHINE.to_string(),
                    value: OS_TYPE.to_string(),
                },
                boot: Boot {
                    dev: BOOT_DEVICE.to_string(),
                },
            },
            features: Features {
                acpi: Some(Flag {}),
                apic: Some(Flag {}),
                pae: Some(Flag {}),
            },
            cpu: Cpu {
                mode: CPU_MODE.to_string(),
            },
            clock: Clock {
                offset: CLOCK_OFFSET.to_string(),
            },
            on_poweroff: ON_POWEROFF.to_string(),
            on_reboot: ON_REBOOT.to_string(),
            on_crash: ON_CRASH.to_string(),
            devices: self.devices(),
        }
    }

    fn devices(&self) -> Devices {
        let boot_disk = Disk {
            disk_type: "file".to_string(),
            device: "disk".to_string(),
            driver: DiskDriver {
                name: "qemu".to_string(),
                format: "qcow2".to_string(),
                cache: Some(DISK_CACHE.to_string()),
            },
            source: DiskSource {
                file: self.layout.disk_path(&self.name).display().to_string(),
            },
            target: DiskTarget {
                dev: DISK_TARGET.to_string(),
                bus: "virtio".to_string(),
            },
            readonly: None,
        };
        let seed = Disk {
            disk_type: "file".to_string(),
            device: "cdrom".to_string(),
            driver: DiskDriver {
                name: "qemu".to_string(),
                format: "raw".to_string(),
                cache: None,
            },
            source: DiskSource {
                file: self.layout.seed_path(&self.name).display().to_string(),
            },
            target: DiskTarget {
                dev: CDROM_TARGET.to_string(),
                bus: "ide".to_string(),
            },
            readonly: Some(Flag {}),
        };

        Devices {
            emulator: EMULATOR.to_string(),
            disk: vec![boot_disk, seed],
            interface: vec![Interface {
                interface_type: "bridge".to_string(),
                source: InterfaceSource {
                    bridge: self.bridge.clone(),
                },
                mac: InterfaceMac {
                    address: self.mac.to_string(),
                },
                model: InterfaceModel {
                    model_type: NIC_MODEL.to_string(),
                },
            }],
            graphics: vec![Graphics {
                graphics_type: "vnc".to_string(),
                port: -1,
                autoport: "yes".to_string(),
                listen: VNC_LISTEN.to_string(),
            }],
            serial: vec![Serial {
                serial_type: "pty".to_string(),
                target: SerialTarget { port: 0 },
            }],
            console: vec![Console {
                console_type: "pty".to_string(),
                target: ConsoleTarget {
                    target_type: "serial".to_string(),
                    port: 0,
                },
            }],
        }
    }

    /// Serialize to the XML document libvirt accepts
    pub fn to_xml(&self) -> Result<String, DescriptorError> {
        self.validate()?;
        let mut xml = String::new();
        let mut serializer = quick_xml::se::Serializer::new(&mut xml);
        serializer.indent(' ', 2);
        self.to_domain()
            .serialize(serializer)
            .map_err(|e| DescriptorError::Serialize(self.name.clone(), e.to_string()))?;
        trace!("Domain XML for {}: {}", self.name, xml);
        Ok(xml)
    }
}
