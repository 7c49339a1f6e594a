pub mod cloud_init;
pub mod console;
pub mod domain;
pub mod request;

pub use self::cloud_init::{CloudConfig, MetaData, NetworkConfig};
pub use self::console::Envelope;
pub use self::domain::Domain;
pub use self::request::{PostVmRequest, PostVmRequestCloudInit, PostVmRequestResources};
