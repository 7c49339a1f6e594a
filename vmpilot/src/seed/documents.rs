//! Rendering of the three NoCloud documents
use std::collections::BTreeMap;

use vmpilot_models::models::cloud_init::{
    CloudConfig, Ethernet, EthernetMatch, MetaData, Nameservers, Network, NetworkConfig, Route,
    User, WriteFile,
};

use crate::mac::MacAddress;

/// First line of every document
pub const HEADER: &str = "#cloud-config";

pub const HOSTNAME: &str = "localhost";
pub const INSTANCE_ID: &str = "i-1234567890";
pub const ADMIN_USER: &str = "ubuntu";
pub const ADMIN_SHELL: &str = "/bin/bash";
pub const ADMIN_SUDO: &str = "ALL=(ALL) NOPASSWD:ALL";
/// Where the first boot script is written in the guest
pub const SCRIPT_PATH: &str = "/root/setup_script.sh";
pub const INTERFACE_NAME: &str = "eth0";
pub const NAMESERVER: &str = "1.1.1.1";

fn with_header<T: serde::Serialize>(document: &T) -> Result<String, serde_yaml::Error> {
    let body = serde_yaml::to_string(document)?;
    Ok(format!("{}\n{}", HEADER, body))
}

pub fn user_data(password: &str, script: &str) -> CloudConfig {
    CloudConfig {
        hostname: HOSTNAME.to_string(),
        ssh_pwauth: true,
        users: vec![User {
            name: ADMIN_USER.to_string(),
            plain_text_passwd: password.to_string(),
            lock_passwd: false,
            shell: ADMIN_SHELL.to_string(),
            sudo: ADMIN_SUDO.to_string(),
        }],
        write_files: vec![WriteFile {
            content: script.to_string(),
            path: SCRIPT_PATH.to_string(),
            owner: Some("root:root".to_string()),
            permissions: Some("0755".to_string()),
        }],
        runcmd: vec![vec!["bash".to_string(), SCRIPT_PATH.to_string()]],
    }
}

pub fn meta_data() -> MetaData {
    MetaData {
        instance_id: INSTANCE_ID.to_string(),
        local_hostname: HOSTNAME.to_string(),
    }
}

pub fn network_config(mac: &MacAddress, address: &str, gateway: &str) -> NetworkConfig {
    let mut ethernets = BTreeMap::new();
    ethernets.insert(
        INTERFACE_NAME.to_string(),
        Ethernet {
            matcher: EthernetMatch {
                macaddress: mac.to_string(),
            },
            dhcp4: false,
            addresses: vec![address.to_string()],
            routes: vec![Route {
                to: "default".to_string(),
                via: gateway.to_string(),
            }],
            nameservers: Nameservers {
                addresses: vec![NAMESERVER.to_string()],
            },
        },
    );
    NetworkConfig {
        network: Network {
            version: 2,
            ethernets,
        },
    }
}

pub fn render_user_data(password: &str, script: &str) -> Result<String, serde_yaml::Error> {
    with_header(&user_data(password, script))
}

pub fn render_meta_data() -> Result<String, serde_yaml::Error> {
    with_header(&meta_data())
}

pub fn render_network_config(
    mac: &MacAddress,
    address: &str,
    gateway: &str,
) -> Result<String, serde_yaml::Error> {
    with_header(&network_config(mac, address, gateway))
}

/// Parse a rendered document back, checking the header line
pub fn parse<T: serde::de::DeserializeOwned>(document: &str) -> Result<T, serde_yaml::Error> {
    let body = document
        .strip_prefix(HEADER)
        .and_then(|rest| rest.strip_prefix('\n'))
        .ok_or_else(|| {
            <serde_yaml::Error as serde::de::Error>::custom(format!(
                "document does not start with {}",
                HEADER
            ))
        })?;
    serde_yaml::from_str(body)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use vmpilot_models::models::{CloudConfig, MetaData, NetworkConfig};

    use super::*;

    #[test]
    fn every_document_starts_with_header() {
        let mac = MacAddress::generate();
        for document in [
            render_user_data("pw", "echo hi").unwrap(),
            render_meta_data().unwrap(),
            render_network_config(&mac, "10.0.0.2/24", "10.0.0.1").unwrap(),
        ] {
            assert_eq!(document.lines().next(), Some(HEADER));
        }
    }

    #[test]
    fn user_data_round_trips_credentials_and_script() {
        let script = "#!/bin/bash\nset -e\necho 'quoted: \"yes\"' > /etc/motd\n";
        let password = "p@ss: word#1";
        let rendered = render_user_data(password, script).unwrap();
        let parsed: CloudConfig = parse(&rendered).unwrap();

        assert_eq!(parsed.users.len(), 1);
        assert_eq!(parsed.users[0].plain_text_passwd, password);
        assert_eq!(parsed.users[0].sudo, ADMIN_SUDO);
        assert!(parsed.ssh_pwauth);
        assert_eq!(parsed.write_files[0].content, script);
        assert_eq!(parsed.write_files[0].path, SCRIPT_PATH);
        assert_eq!(parsed.write_files[0].permissions.as_deref(), Some("0755"));
        assert_eq!(
            parsed.runcmd,
            vec![vec!["bash".to_string(), SCRIPT_PATH.to_string()]]
        );
    }

    #[test]
    fn meta_data_is_placeholder_identity() {
        let parsed: MetaData = parse(&render_meta_data().unwrap()).unwrap();
        assert_eq!(parsed.instance_id, INSTANCE_ID);
        assert_eq!(parsed.local_hostname, HOSTNAME);
    }

    #[test]
    fn network_config_matches_single_interface_by_mac() {
        let mac: MacAddress = "02:aa:bb:cc:dd:ee".parse().unwrap();
        let rendered = render_network_config(&mac, "192.168.122.10/24", "192.168.122.1").unwrap();
        let parsed: NetworkConfig = parse(&rendered).unwrap();

        assert_eq!(parsed.network.version, 2);
        assert_eq!(parsed.network.ethernets.len(), 1);
        let eth = &parsed.network.ethernets[INTERFACE_NAME];
        assert_eq!(eth.matcher.macaddress, "02:aa:bb:cc:dd:ee");
        assert!(!eth.dhcp4);
        assert_eq!(eth.addresses, vec!["192.168.122.10/24".to_string()]);
        assert_eq!(eth.routes[0].to, "default");
        assert_eq!(eth.routes[0].via, "192.168.122.1");
        assert_eq!(eth.nameservers.addresses, vec![NAMESERVER.to_string()]);
    }

    #[test]
    fn parse_rejects_missing_header() {
        assert!(parse::<MetaData>("instance-id: x\nlocal-hostname: y\n").is_err());
    }
}
