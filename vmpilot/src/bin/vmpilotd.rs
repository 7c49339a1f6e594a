//! `vmpilotd`: HTTP daemon provisioning libvirt VMs and relaying their
//! serial console
use std::{process::ExitCode, sync::Arc};

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmpilot::{
    api::{self, AppState, RequestDefaults},
    builder::{
        provisioner::ProvisionerBuilder,
        tools::{QemuImgBuilder, VirshBuilder},
        Builder,
    },
    config::Settings,
    console::ConsoleRelay,
    hypervisor::Hypervisor,
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let virsh = VirshBuilder::auto()?
        .with_connect_uri(settings.connect_uri.clone())
        .with_timeout(settings.command_timeout)
        .try_build()?;
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(virsh);

    let qemu_img = QemuImgBuilder::auto()?
        .with_timeout(settings.command_timeout)
        .try_build()?;

    let provisioner = ProvisionerBuilder::new()
        .with_hypervisor(hypervisor.clone())
        .with_image_converter(Arc::new(qemu_img))
        .with_base_path(settings.base_path.clone())
        .with_keep_failed_artifacts(settings.keep_failed_artifacts)
        .try_build()?;

    let state = AppState {
        provisioner: Arc::new(provisioner),
        relay: ConsoleRelay::new(hypervisor),
        defaults: RequestDefaults {
            base_image: settings.base_image.clone(),
            bridge: settings.bridge.clone(),
        },
    };

    let listener = TcpListener::bind(settings.listen).await?;
    api::serve(listener, state).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting vmpilotd on {} (libvirt {}, images in {})",
        settings.listen,
        settings.connect_uri,
        settings.base_path.display()
    );

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
