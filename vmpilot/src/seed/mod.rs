//! # cloud-init seed media
//!
//! The seed is a small read-only ISO-9660 image labelled `CIDATA` holding the
//! three NoCloud documents: `user-data`, `meta-data` and `network-config`.
//! cloud-init in the guest finds it by its label on first boot and configures
//! the administrator account, the static network and the first boot script.
//!
//! ## Example
//!
//! ```no_run
//! # async fn doc() -> Result<(), vmpilot::seed::SeedError> {
//! use vmpilot::{mac::MacAddress, seed::{SeedConfig, SeedMediaBuilder}};
//!
//! let config = SeedConfig {
//!     password: "hunter2".to_string(),
//!     script: "apt-get update\n".to_string(),
//!     mac: MacAddress::generate(),
//!     ip_address: "192.168.122.10/24".to_string(),
//!     gateway: "192.168.122.1".to_string(),
//! };
//! SeedMediaBuilder::new()
//!     .build("/var/lib/libvirt/images/vm/seed.iso", &config)
//!     .await?;
//! # Ok(())
//! # }
//! ```
use std::{fmt, path::Path};

use tracing::{debug, info, instrument};

use crate::mac::MacAddress;

pub mod documents;
pub mod iso9660;

use self::iso9660::{IsoError, IsoWriter};

/// Label cloud-init looks for on configuration drives
pub const VOLUME_ID: &str = "CIDATA";
/// Size of the seed image, the three documents need a few KiB
pub const SEED_CAPACITY: u64 = 10 * 1024 * 1024;

pub const USER_DATA: &str = "user-data";
pub const META_DATA: &str = "meta-data";
pub const NETWORK_CONFIG: &str = "network-config";

#[derive(thiserror::Error, Debug)]
pub enum SeedError {
    #[error("could not render {document}, reason: {source}")]
    Render {
        document: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("seed media needs {required} bytes but holds only {capacity} bytes")]
    CapacityExceeded { required: u64, capacity: u64 },
    #[error("could not write {document} to the seed media, reason: {source}")]
    Write {
        document: &'static str,
        #[source]
        source: IsoError,
    },
    #[error("could not finalize seed media at {path}, reason: {source}")]
    Finalize {
        path: String,
        #[source]
        source: IsoError,
    },
}

/// Values carried by the seed documents
#[derive(Clone, PartialEq)]
pub struct SeedConfig {
    pub password: String,
    pub script: String,
    /// Must be the address given to the domain network interface
    pub mac: MacAddress,
    pub ip_address: String,
    pub gateway: String,
}

impl fmt::Debug for SeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedConfig")
            .field("password", &"<redacted>")
            .field("script_len", &self.script.len())
            .field("mac", &self.mac)
            .field("ip_address", &self.ip_address)
            .field("gateway", &self.gateway)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SeedMediaBuilder {
    volume_id: String,
    capacity: u64,
}

impl Default for SeedMediaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedMediaBuilder {
    pub fn new() -> SeedMediaBuilder {
        SeedMediaBuilder {
            volume_id: VOLUME_ID.to_string(),
            capacity: SEED_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: u64) -> SeedMediaBuilder {
        self.capacity = capacity;
        self
    }

    /// Render the three documents in on-media order
    pub fn render(config: &SeedConfig) -> Result<Vec<(&'static str, String)>, SeedError> {
        let user_data = documents::render_user_data(&config.password, &config.script).map_err(
            |source| SeedError::Render {
                document: USER_DATA,
                source,
            },
        )?;
        let meta_data = documents::render_meta_data().map_err(|source| SeedError::Render {
            document: META_DATA,
            source,
        })?;
        let network_config =
            documents::render_network_config(&config.mac, &config.ip_address, &config.gateway)
                .map_err(|source| SeedError::Render {
                    document: NETWORK_CONFIG,
                    source,
                })?;
        Ok(vec![
            (USER_DATA, user_data),
            (META_DATA, meta_data),
            (NETWORK_CONFIG, network_config),
        ])
    }

    /// Assemble the image in memory
    pub fn assemble(&self, config: &SeedConfig) -> Result<Vec<u8>, SeedError> {
        let mut writer =
            IsoWriter::new(&self.volume_id, self.capacity).map_err(|source| SeedError::Finalize {
                path: String::new(),
                source,
            })?;

        for (document, content) in Self::render(config)? {
            debug!("Write {} ({} bytes)", document, content.len());
            writer
                .add_file(document, content.into_bytes())
                .map_err(|source| match source {
                    IsoError::CapacityExceeded { required, capacity } => {
                        SeedError::CapacityExceeded { required, capacity }
                    }
                    source => SeedError::Write { document, source },
                })?;
        }

        writer.finalize().map_err(|source| match source {
            IsoError::CapacityExceeded { required, capacity } => {
                SeedError::CapacityExceeded { required, capacity }
            }
            source => SeedError::Finalize {
                path: String::new(),
                source,
            },
        })
    }

    /// Build the seed media and write it at `path`, replacing any file there
    #[instrument(skip_all, fields(path = %path.as_ref().display(), mac = %config.mac))]
    pub async fn build<P: AsRef<Path>>(&self, path: P, config: &SeedConfig) -> Result<(), SeedError> {
        let path = path.as_ref();
        let image = self.assemble(config)?;
        tokio::fs::write(path, &image)
            .await
            .map_err(|e| SeedError::Finalize {
                path: path.display().to_string(),
                source: IsoError::Io(e),
            })?;
        info!("Seed media written ({} bytes)", image.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use vmpilot_models::models::{CloudConfig, MetaData, NetworkConfig};

    use super::{
        documents, iso9660::IsoImage, SeedConfig, SeedError, SeedMediaBuilder, META_DATA,
        NETWORK_CONFIG, USER_DATA,
    };
    use crate::mac::MacAddress;

    fn config() -> SeedConfig {
        SeedConfig {
            password: "s3cret!".to_string(),
            script: "#!/bin/bash\necho provisioned > /root/done\n".to_string(),
            mac: "02:aa:bb:cc:dd:ee".parse::<MacAddress>().unwrap(),
            ip_address: "192.168.122.10/24".to_string(),
            gateway: "192.168.122.1".to_string(),
        }
    }

    #[tokio::test]
    async fn seed_reads_back_the_three_documents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seed.iso");
        SeedMediaBuilder::new().build(&path, &config()).await.unwrap();

        let image = IsoImage::open(&path).unwrap();
        assert_eq!(image.volume_id(), "CIDATA");
        assert!(image.has_rock_ridge());
        let mut names: Vec<String> = image.entries().unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec![META_DATA, NETWORK_CONFIG, USER_DATA]);

        let user_data = String::from_utf8(image.read_file(USER_DATA).unwrap()).unwrap();
        let user_data: CloudConfig = documents::parse(&user_data).unwrap();
        assert_eq!(user_data.users[0].plain_text_passwd, "s3cret!");
        assert_eq!(user_data.write_files[0].content, config().script);

        let meta_data = String::from_utf8(image.read_file(META_DATA).unwrap()).unwrap();
        let _: MetaData = documents::parse(&meta_data).unwrap();

        let network = String::from_utf8(image.read_file(NETWORK_CONFIG).unwrap()).unwrap();
        let network: NetworkConfig = documents::parse(&network).unwrap();
        let eth = &network.network.ethernets[documents::INTERFACE_NAME];
        assert_eq!(eth.matcher.macaddress, "02:aa:bb:cc:dd:ee");
        assert_eq!(eth.addresses, vec!["192.168.122.10/24".to_string()]);
        assert_eq!(eth.routes[0].via, "192.168.122.1");
    }

    #[test]
    fn image_has_fixed_capacity() {
        let image = SeedMediaBuilder::new().assemble(&config()).unwrap();
        assert_eq!(image.len() as u64, super::SEED_CAPACITY);
    }

    #[test]
    fn insufficient_capacity_is_surfaced() {
        let result = SeedMediaBuilder::new()
            .with_capacity(16 * 2048)
            .assemble(&config());
        assert!(matches!(result, Err(SeedError::CapacityExceeded { .. })));
    }

    #[tokio::test]
    async fn unwritable_destination_is_surfaced() {
        let result = SeedMediaBuilder::new()
            .build("/nonexistent-directory/seed.iso", &config())
            .await;
        assert!(matches!(result, Err(SeedError::Finalize { .. })));
    }
}
