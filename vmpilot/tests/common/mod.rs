#![allow(dead_code)]

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use vmpilot::{
    hypervisor::{ConsoleStream, DomainState, Hypervisor, HypervisorError},
    image::{ImageConverter, ImageError},
};

/// Converter copying the base image as is
#[derive(Debug, Default)]
pub struct CopyConverter {
    pub resized: Mutex<Vec<u64>>,
}

#[async_trait]
impl ImageConverter for CopyConverter {
    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ImageError> {
        tokio::fs::copy(input, output).await.unwrap();
        Ok(())
    }

    async fn resize(&self, _: &Path, size_gb: u64) -> Result<(), ImageError> {
        self.resized.lock().unwrap().push(size_gb);
        Ok(())
    }
}

/// Hypervisor keeping defined domains in memory, consoles are in-memory pipes
/// whose guest end is handed to the test
#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    pub defined: Mutex<Vec<String>>,
    pub running: Mutex<Vec<String>>,
    pub guests: Mutex<Vec<DuplexStream>>,
}

impl MemoryHypervisor {
    pub fn new() -> Arc<MemoryHypervisor> {
        Arc::new(MemoryHypervisor::default())
    }

    pub fn mark_running(&self, name: &str) {
        self.running.lock().unwrap().push(name.to_string());
    }

    pub fn take_guest(&self) -> Option<DuplexStream> {
        self.guests.lock().unwrap().pop()
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainState>, HypervisorError> {
        if self.running.lock().unwrap().iter().any(|n| n == name) {
            return Ok(Some(DomainState::Running));
        }
        let defined = self
            .defined
            .lock()
            .unwrap()
            .iter()
            .any(|xml| xml.contains(&format!("<name>{}</name>", name)));
        Ok(defined.then_some(DomainState::Defined))
    }

    async fn define_domain(&self, xml: &str) -> Result<(), HypervisorError> {
        self.defined.lock().unwrap().push(xml.to_string());
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.mark_running(name);
        Ok(())
    }

    async fn open_console(&self, _: &str, _: &str) -> Result<ConsoleStream, HypervisorError> {
        let (console, guest) = tokio::io::duplex(4096);
        self.guests.lock().unwrap().push(guest);
        let (read, write) = tokio::io::split(console);
        Ok(ConsoleStream::new(read, write))
    }
}
