//! # Provisioning
//!
//! One call to [Provisioner::provision] is one attempt at creating a VM. The
//! attempt walks through [ProvisionStep] in order: the MAC address and the
//! name are decided first, then the seed media and the boot disk are written
//! under the VM directory, the domain XML is built from them and finally the
//! domain is defined and started.
//!
//! Defining the domain is the only step visible outside this process, so it
//! comes last and happens at most once per attempt. Nothing is retried. When
//! the attempt fails before the domain is defined, the VM directory it
//! created is removed, unless the provisioner keeps failed artifacts for
//! inspection. Once defined, a domain is never undone.
use std::{fmt, path::Path, sync::Arc};

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    descriptor::{DescriptorError, DomainDescriptor},
    hypervisor::{Hypervisor, HypervisorError},
    image::{ImageConverter, ImageError},
    mac::MacAddress,
    seed::{SeedConfig, SeedError, SeedMediaBuilder},
    vm::{ArtifactLayout, VmSpec},
};

/// States of a provisioning attempt, in the order they are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisionStep {
    Start,
    SeedBuilt,
    DiskBuilt,
    DescriptorBuilt,
    Defined,
    Running,
    Done,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            ProvisionStep::Start => "start",
            ProvisionStep::SeedBuilt => "seed built",
            ProvisionStep::DiskBuilt => "disk built",
            ProvisionStep::DescriptorBuilt => "descriptor built",
            ProvisionStep::Defined => "defined",
            ProvisionStep::Running => "running",
            ProvisionStep::Done => "done",
        };
        f.write_str(step)
    }
}

/// Failure while writing one of the VM artifacts
#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("could not create VM directory, reason: {0}")]
    Workspace(#[from] std::io::Error),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Why an attempt failed, `step` is the last state it reached
#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("provisioning of {name} failed after step '{step}': {source}")]
    ArtifactBuild {
        name: String,
        step: ProvisionStep,
        #[source]
        source: ArtifactError,
    },
    #[error("provisioning of {name} failed after step '{step}': {source}")]
    Descriptor {
        name: String,
        step: ProvisionStep,
        #[source]
        source: DescriptorError,
    },
    #[error("provisioning of {name} failed after step '{step}': {source}")]
    Hypervisor {
        name: String,
        step: ProvisionStep,
        #[source]
        source: HypervisorError,
    },
}

impl ProvisionError {
    pub fn step(&self) -> ProvisionStep {
        match self {
            ProvisionError::ArtifactBuild { step, .. }
            | ProvisionError::Descriptor { step, .. }
            | ProvisionError::Hypervisor { step, .. } => *step,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProvisionError::ArtifactBuild { name, .. }
            | ProvisionError::Descriptor { name, .. }
            | ProvisionError::Hypervisor { name, .. } => name,
        }
    }
}

/// Component errors before they are tagged with the attempt context
#[derive(Debug)]
enum StepError {
    Artifact(ArtifactError),
    Descriptor(DescriptorError),
    Hypervisor(HypervisorError),
}

impl From<std::io::Error> for StepError {
    fn from(e: std::io::Error) -> StepError {
        StepError::Artifact(ArtifactError::Workspace(e))
    }
}

impl From<SeedError> for StepError {
    fn from(e: SeedError) -> StepError {
        StepError::Artifact(ArtifactError::Seed(e))
    }
}

impl From<ImageError> for StepError {
    fn from(e: ImageError) -> StepError {
        StepError::Artifact(ArtifactError::Image(e))
    }
}

impl StepError {
    fn into_provision_error(self, name: &str, step: ProvisionStep) -> ProvisionError {
        let name = name.to_string();
        match self {
            StepError::Artifact(source) => ProvisionError::ArtifactBuild { name, step, source },
            StepError::Descriptor(source) => ProvisionError::Descriptor { name, step, source },
            StepError::Hypervisor(source) => ProvisionError::Hypervisor { name, step, source },
        }
    }
}

/// Progress of one attempt
#[derive(Debug)]
struct Attempt {
    step: ProvisionStep,
    created_dir: bool,
}

/// Creates VMs, build it with [crate::builder::provisioner::ProvisionerBuilder]
pub struct Provisioner {
    pub(crate) hypervisor: Arc<dyn Hypervisor>,
    pub(crate) converter: Arc<dyn ImageConverter>,
    pub(crate) seed: SeedMediaBuilder,
    pub(crate) layout: ArtifactLayout,
    pub(crate) keep_failed_artifacts: bool,
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("seed", &self.seed)
            .field("layout", &self.layout)
            .field("keep_failed_artifacts", &self.keep_failed_artifacts)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Provision a VM under a freshly generated name and return that name
    pub async fn provision(&self, spec: &VmSpec) -> Result<String, ProvisionError> {
        let name = Uuid::new_v4().to_string();
        self.provision_named(&name, spec).await?;
        Ok(name)
    }

    /// Provision a VM called `name`, the name must not be in use
    #[instrument(skip_all, fields(name = %name))]
    pub async fn provision_named(&self, name: &str, spec: &VmSpec) -> Result<(), ProvisionError> {
        if let Some(display_name) = &spec.display_name {
            info!("Provisioning {} ({})", name, display_name);
        }
        let mut attempt = Attempt {
            step: ProvisionStep::Start,
            created_dir: false,
        };

        match self.run_steps(name, spec, &mut attempt).await {
            Ok(()) => {
                info!("VM is running");
                Ok(())
            }
            Err(e) => {
                let e = e.into_provision_error(name, attempt.step);
                error!("{}", e);
                if attempt.step < ProvisionStep::Defined {
                    self.discard(name, &attempt).await;
                }
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        name: &str,
        spec: &VmSpec,
        attempt: &mut Attempt,
    ) -> Result<(), StepError> {
        let mac = MacAddress::generate();
        debug!("Generated MAC {}", mac);

        let vm_dir = self.layout.vm_dir(name);
        tokio::fs::create_dir_all(self.layout.base_path()).await?;
        tokio::fs::create_dir(&vm_dir).await?;
        attempt.created_dir = true;

        let seed = SeedConfig {
            password: spec.password.clone(),
            script: spec.script.clone(),
            mac,
            ip_address: spec.ip_address.clone(),
            gateway: spec.gateway.clone(),
        };
        self.seed.build(self.layout.seed_path(name), &seed).await?;
        attempt.step = ProvisionStep::SeedBuilt;

        let disk = self.layout.disk_path(name);
        self.converter.convert(&spec.base_image, &disk).await?;
        self.converter.resize(&disk, spec.disk_gb).await?;
        attempt.step = ProvisionStep::DiskBuilt;

        let xml = DomainDescriptor::new(name, spec.memory_gb, spec.vcpus, &spec.bridge, &self.layout)
            .with_mac(mac)
            .to_xml()
            .map_err(StepError::Descriptor)?;
        attempt.step = ProvisionStep::DescriptorBuilt;

        self.hypervisor
            .define_domain(&xml)
            .await
            .map_err(StepError::Hypervisor)?;
        attempt.step = ProvisionStep::Defined;

        self.hypervisor
            .start_domain(name)
            .await
            .map_err(StepError::Hypervisor)?;
        attempt.step = ProvisionStep::Running;

        attempt.step = ProvisionStep::Done;
        Ok(())
    }

    /// Remove the artifacts of an attempt that never reached the hypervisor
    async fn discard(&self, name: &str, attempt: &Attempt) {
        let vm_dir = self.layout.vm_dir(name);
        if !attempt.created_dir {
            return;
        }
        if self.keep_failed_artifacts {
            warn!("Keeping artifacts of failed attempt in {}", vm_dir.display());
            return;
        }
        if let Err(e) = remove_dir(&vm_dir).await {
            warn!("Could not remove {}: {}", vm_dir.display(), e);
        }
    }
}

async fn remove_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::remove_dir_all(path).await?;
    debug!("Removed {}", path.display());
    Ok(())
}
