//! cloud-init NoCloud documents carried by the seed media

use std::collections::BTreeMap;

/// `user-data` document
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CloudConfig {
    pub hostname: String,
    pub ssh_pwauth: bool,
    pub users: Vec<User>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<WriteFile>,
    /// Each entry is one command in exec form, run once on first boot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct User {
    pub name: String,
    pub plain_text_passwd: String,
    pub lock_passwd: bool,
    pub shell: String,
    pub sudo: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WriteFile {
    pub content: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

/// `meta-data` document
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MetaData {
    #[serde(rename = "instance-id")]
    pub instance_id: String,
    #[serde(rename = "local-hostname")]
    pub local_hostname: String,
}

/// `network-config` document, netplan version 2 format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NetworkConfig {
    pub network: Network,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Network {
    pub version: u8,
    pub ethernets: BTreeMap<String, Ethernet>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Ethernet {
    #[serde(rename = "match")]
    pub matcher: EthernetMatch,
    pub dhcp4: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    pub nameservers: Nameservers,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EthernetMatch {
    pub macaddress: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Route {
    pub to: String,
    pub via: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Nameservers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}
