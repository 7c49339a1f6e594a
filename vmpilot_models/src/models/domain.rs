//! libvirt domain descriptor
//!
//! Only the subset of the libvirt domain schema that vmpilot emits is
//! modelled. Field names prefixed with `@` are XML attributes and `$text`
//! is the element text content, following the quick-xml serde conventions.

/// Root `<domain>` element.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename = "domain")]
pub struct Domain {
    /// Hypervisor driver, e.g. `kvm`
    #[serde(rename = "@type")]
    pub domain_type: String,
    pub name: String,
    pub memory: Memory,
    pub vcpu: u32,
    pub os: Os,
    pub features: Features,
    pub cpu: Cpu,
    pub clock: Clock,
    pub on_poweroff: String,
    pub on_reboot: String,
    pub on_crash: String,
    pub devices: Devices,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Memory {
    #[serde(rename = "@unit")]
    pub unit: String,
    #[serde(rename = "$text")]
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Os {
    #[serde(rename = "type")]
    pub os_type: OsType,
    pub boot: Boot,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OsType {
    #[serde(rename = "@arch")]
    pub arch: String,
    #[serde(rename = "@machine")]
    pub machine: String,
    #[serde(rename = "$text")]
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Boot {
    #[serde(rename = "@dev")]
    pub dev: String,
}

/// Marker for flag elements such as `<acpi/>` which carry no content.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Flag {}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Features {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acpi: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apic: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pae: Option<Flag>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Cpu {
    #[serde(rename = "@mode")]
    pub mode: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Clock {
    #[serde(rename = "@offset")]
    pub offset: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Devices {
    pub emulator: String,
    #[serde(default)]
    pub disk: Vec<Disk>,
    #[serde(default)]
    pub interface: Vec<Interface>,
    #[serde(default)]
    pub graphics: Vec<Graphics>,
    #[serde(default)]
    pub serial: Vec<Serial>,
    #[serde(default)]
    pub console: Vec<Console>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Disk {
    /// Backing type, `file` for every disk vmpilot creates
    #[serde(rename = "@type")]
    pub disk_type: String,
    /// `disk` or `cdrom`
    #[serde(rename = "@device")]
    pub device: String,
    pub driver: DiskDriver,
    pub source: DiskSource,
    pub target: DiskTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Flag>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiskDriver {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub format: String,
    #[serde(rename = "@cache", skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiskSource {
    #[serde(rename = "@file")]
    pub file: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiskTarget {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@bus")]
    pub bus: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Interface {
    #[serde(rename = "@type")]
    pub interface_type: String,
    pub source: InterfaceSource,
    pub mac: InterfaceMac,
    pub model: InterfaceModel,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InterfaceSource {
    #[serde(rename = "@bridge")]
    pub bridge: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InterfaceMac {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InterfaceModel {
    #[serde(rename = "@type")]
    pub model_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Graphics {
    #[serde(rename = "@type")]
    pub graphics_type: String,
    /// `-1` lets libvirt pick a free port
    #[serde(rename = "@port")]
    pub port: i32,
    #[serde(rename = "@autoport")]
    pub autoport: String,
    #[serde(rename = "@listen")]
    pub listen: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Serial {
    #[serde(rename = "@type")]
    pub serial_type: String,
    pub target: SerialTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SerialTarget {
    #[serde(rename = "@port")]
    pub port: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Console {
    #[serde(rename = "@type")]
    pub console_type: String,
    pub target: ConsoleTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConsoleTarget {
    #[serde(rename = "@type")]
    pub target_type: String,
    #[serde(rename = "@port")]
    pub port: u32,
}
