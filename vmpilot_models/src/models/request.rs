/// Body of `POST /vms`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PostVmRequest {
    pub cloud_init: PostVmRequestCloudInit,
    pub resources: PostVmRequestResources,
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct PostVmRequestCloudInit {
    pub script: String,
    pub password: String,
    pub ip_address: String,
    pub gateway: String,
}

impl std::fmt::Debug for PostVmRequestCloudInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostVmRequestCloudInit")
            .field("script", &self.script)
            .field("password", &"<redacted>")
            .field("ip_address", &self.ip_address)
            .field("gateway", &self.gateway)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PostVmRequestResources {
    /// Memory in GiB
    pub memory: u64,
    pub vcpus: u32,
    /// Boot disk capacity in GiB
    pub disk: u64,
}
