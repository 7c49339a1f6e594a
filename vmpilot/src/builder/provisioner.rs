use std::{fmt, path::PathBuf, sync::Arc};

use crate::{
    builder::{Builder, BuilderError},
    hypervisor::Hypervisor,
    image::ImageConverter,
    provision::Provisioner,
    seed::SeedMediaBuilder,
    vm::ArtifactLayout,
};

use super::required;

/// Default directory holding one sub-directory per VM
pub const DEFAULT_BASE_PATH: &str = "/var/lib/libvirt/images";

#[derive(Default)]
pub struct ProvisionerBuilder {
    hypervisor: Option<Arc<dyn Hypervisor>>,
    converter: Option<Arc<dyn ImageConverter>>,
    seed: Option<SeedMediaBuilder>,
    base_path: Option<PathBuf>,
    keep_failed_artifacts: bool,
}

impl fmt::Debug for ProvisionerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerBuilder")
            .field("hypervisor", &self.hypervisor.is_some())
            .field("converter", &self.converter.is_some())
            .field("seed", &self.seed)
            .field("base_path", &self.base_path)
            .field("keep_failed_artifacts", &self.keep_failed_artifacts)
            .finish()
    }
}

impl ProvisionerBuilder {
    pub fn new() -> ProvisionerBuilder {
        ProvisionerBuilder::default()
    }

    /// Connection shared with the console relay
    pub fn with_hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> ProvisionerBuilder {
        self.hypervisor = Some(hypervisor);
        self
    }

    pub fn with_image_converter(mut self, converter: Arc<dyn ImageConverter>) -> ProvisionerBuilder {
        self.converter = Some(converter);
        self
    }

    /// Defaults to a 10 MiB `CIDATA` image
    pub fn with_seed_builder(mut self, seed: SeedMediaBuilder) -> ProvisionerBuilder {
        self.seed = Some(seed);
        self
    }

    /// Defaults to `/var/lib/libvirt/images`
    pub fn with_base_path(mut self, base_path: PathBuf) -> ProvisionerBuilder {
        self.base_path = Some(base_path);
        self
    }

    /// Leave the directory of a failed attempt on disk instead of removing it
    pub fn with_keep_failed_artifacts(mut self, keep: bool) -> ProvisionerBuilder {
        self.keep_failed_artifacts = keep;
        self
    }
}

impl Builder<Provisioner> for ProvisionerBuilder {
    fn try_build(self) -> Result<Provisioner, BuilderError> {
        let hypervisor = required(stringify!(self.hypervisor), self.hypervisor)?;
        let converter = required(stringify!(self.converter), self.converter)?;
        let base_path = self
            .base_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_PATH));
        if !base_path.is_absolute() {
            return Err(BuilderError::InvalidField(
                stringify!(self.base_path).to_string(),
                format!("{} is not an absolute path", base_path.display()),
            ));
        }

        Ok(Provisioner {
            hypervisor,
            converter,
            seed: self.seed.unwrap_or_default(),
            layout: ArtifactLayout::new(base_path),
            keep_failed_artifacts: self.keep_failed_artifacts,
        })
    }
}
