mod common;

use std::{fs, path::PathBuf};

use pretty_assertions::assert_eq;
use tempfile::tempdir;
use vmpilot::{
    builder::{provisioner::ProvisionerBuilder, spec::VmSpecBuilder, Builder},
    hypervisor::{DomainState, Hypervisor},
    mac::MacAddress,
    seed::{documents, iso9660::IsoImage, NETWORK_CONFIG, USER_DATA},
};
use vmpilot_models::models::{CloudConfig, Domain, NetworkConfig};

use common::{CopyConverter, MemoryHypervisor};

#[tokio::test]
async fn provisioned_vm_uses_one_identity() {
    let dir = tempdir().unwrap();
    let base_image = dir.path().join("jammy.img");
    fs::write(&base_image, b"base image").unwrap();

    let hypervisor = MemoryHypervisor::new();
    let converter = std::sync::Arc::new(CopyConverter::default());
    let provisioner = ProvisionerBuilder::new()
        .with_hypervisor(hypervisor.clone())
        .with_image_converter(converter.clone())
        .with_base_path(dir.path().join("vms"))
        .try_build()
        .unwrap();

    let spec = VmSpecBuilder::new()
        .with_memory_gb(4)
        .with_vcpus(2)
        .with_disk_gb(30)
        .with_password("s3cret".to_string())
        .with_ip_address("10.10.0.5/24".to_string())
        .with_gateway("10.10.0.1".to_string())
        .with_script("#!/bin/bash\ntouch /root/ready\n".to_string())
        .with_base_image(base_image)
        .try_build()
        .unwrap();

    let name = provisioner.provision(&spec).await.unwrap();
    assert_eq!(
        hypervisor.lookup_domain(&name).await.unwrap(),
        Some(DomainState::Running)
    );
    assert_eq!(*converter.resized.lock().unwrap(), vec![30]);

    let layout = provisioner.layout();
    assert_eq!(fs::read(layout.disk_path(&name)).unwrap(), b"base image");

    let defined = hypervisor.defined.lock().unwrap();
    assert_eq!(defined.len(), 1);
    let domain: Domain = quick_xml::de::from_str(&defined[0]).unwrap();
    assert_eq!(domain.name, name);
    assert_eq!(
        PathBuf::from(&domain.devices.disk[0].source.file),
        layout.disk_path(&name)
    );
    assert_eq!(
        PathBuf::from(&domain.devices.disk[1].source.file),
        layout.seed_path(&name)
    );

    let seed = IsoImage::open(layout.seed_path(&name)).unwrap();
    let network = String::from_utf8(seed.read_file(NETWORK_CONFIG).unwrap()).unwrap();
    let network: NetworkConfig = documents::parse(&network).unwrap();
    let seed_mac: MacAddress = network.network.ethernets[documents::INTERFACE_NAME]
        .matcher
        .macaddress
        .parse()
        .unwrap();
    let domain_mac: MacAddress = domain.devices.interface[0].mac.address.parse().unwrap();
    assert_eq!(seed_mac, domain_mac);
    assert!(domain_mac.is_locally_administered());

    let user_data = String::from_utf8(seed.read_file(USER_DATA).unwrap()).unwrap();
    let user_data: CloudConfig = documents::parse(&user_data).unwrap();
    assert_eq!(user_data.users[0].plain_text_passwd, "s3cret");
    assert_eq!(user_data.write_files[0].content, "#!/bin/bash\ntouch /root/ready\n");
}
