use std::path::PathBuf;

use crate::{
    builder::{Builder, BuilderError},
    vm::{VmSpec, DEFAULT_BRIDGE},
};

use super::required;

#[derive(Debug, Default)]
pub struct VmSpecBuilder {
    display_name: Option<String>,
    memory_gb: Option<u64>,
    vcpus: Option<u32>,
    bridge: Option<String>,
    password: Option<String>,
    ip_address: Option<String>,
    gateway: Option<String>,
    script: Option<String>,
    base_image: Option<PathBuf>,
    disk_gb: Option<u64>,
}

impl VmSpecBuilder {
    pub fn new() -> VmSpecBuilder {
        VmSpecBuilder::default()
    }

    pub fn with_display_name(mut self, display_name: String) -> VmSpecBuilder {
        self.display_name = Some(display_name);
        self
    }

    pub fn with_memory_gb(mut self, memory_gb: u64) -> VmSpecBuilder {
        self.memory_gb = Some(memory_gb);
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> VmSpecBuilder {
        self.vcpus = Some(vcpus);
        self
    }

    /// Defaults to `virbr0`
    pub fn with_bridge(mut self, bridge: String) -> VmSpecBuilder {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_password(mut self, password: String) -> VmSpecBuilder {
        self.password = Some(password);
        self
    }

    pub fn with_ip_address(mut self, ip_address: String) -> VmSpecBuilder {
        self.ip_address = Some(ip_address);
        self
    }

    pub fn with_gateway(mut self, gateway: String) -> VmSpecBuilder {
        self.gateway = Some(gateway);
        self
    }

    /// Defaults to an empty script
    pub fn with_script(mut self, script: String) -> VmSpecBuilder {
        self.script = Some(script);
        self
    }

    pub fn with_base_image(mut self, base_image: PathBuf) -> VmSpecBuilder {
        self.base_image = Some(base_image);
        self
    }

    pub fn with_disk_gb(mut self, disk_gb: u64) -> VmSpecBuilder {
        self.disk_gb = Some(disk_gb);
        self
    }
}

fn assert_positive(key: &str, value: u64) -> Result<(), BuilderError> {
    if value == 0 {
        return Err(BuilderError::InvalidField(
            key.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

impl Builder<VmSpec> for VmSpecBuilder {
    fn try_build(self) -> Result<VmSpec, BuilderError> {
        let memory_gb = required(stringify!(self.memory_gb), self.memory_gb)?;
        let vcpus = required(stringify!(self.vcpus), self.vcpus)?;
        let password = required(stringify!(self.password), self.password)?;
        let ip_address = required(stringify!(self.ip_address), self.ip_address)?;
        let gateway = required(stringify!(self.gateway), self.gateway)?;
        let base_image = required(stringify!(self.base_image), self.base_image)?;
        let disk_gb = required(stringify!(self.disk_gb), self.disk_gb)?;

        assert_positive(stringify!(self.memory_gb), memory_gb)?;
        assert_positive(stringify!(self.vcpus), u64::from(vcpus))?;
        assert_positive(stringify!(self.disk_gb), disk_gb)?;

        let bridge = self.bridge.unwrap_or_else(|| DEFAULT_BRIDGE.to_string());
        if bridge.is_empty() {
            return Err(BuilderError::InvalidField(
                stringify!(self.bridge).to_string(),
                "must not be empty".to_string(),
            ));
        }

        Ok(VmSpec {
            display_name: self.display_name,
            memory_gb,
            vcpus,
            bridge,
            password,
            ip_address,
            gateway,
            script: self.script.unwrap_or_default(),
            base_image,
            disk_gb,
        })
    }
}
