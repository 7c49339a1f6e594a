//! [Hypervisor] backed by the `virsh` command line client
//!
//! Every call opens its own connection to the URI given at build time, so
//! one [Virsh] can serve concurrent provisioning requests and console
//! sessions. Consoles are reached through the PTY libvirt allocates for the
//! domain serial port, found in the live domain XML.
use std::{
    fs::OpenOptions,
    io,
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use async_trait::async_trait;
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use tokio::net::unix::pipe;
use tracing::{debug, info, instrument};

use crate::command::{CommandError, Tool};

use super::{ConsoleStream, DomainState, Hypervisor, HypervisorError};

/// Messages libvirt prints when asked about a domain it doesn't know
const UNKNOWN_DOMAIN_MARKERS: [&str; 2] = ["failed to get domain", "Domain not found"];

#[derive(Debug, Clone)]
pub struct Virsh {
    tool: Tool,
    connect_uri: String,
}

impl Virsh {
    /// `tool` must already carry the `-c <uri>` arguments, use
    /// [crate::builder::tools::VirshBuilder]
    pub fn new(tool: Tool, connect_uri: String) -> Virsh {
        Virsh { tool, connect_uri }
    }

    pub fn connect_uri(&self) -> &str {
        &self.connect_uri
    }

    async fn virsh(
        &self,
        operation: &'static str,
        domain: &str,
    ) -> Result<String, HypervisorError> {
        self.tool
            .run(&[operation.to_string(), domain.to_string()])
            .await
            .map_err(|source| command_error(operation, domain, source))
    }
}

fn command_error(operation: &'static str, domain: &str, source: CommandError) -> HypervisorError {
    if let CommandError::Failed { stderr, .. } = &source {
        if UNKNOWN_DOMAIN_MARKERS.iter().any(|m| stderr.contains(m)) {
            return HypervisorError::NotFound(domain.to_string());
        }
    }
    HypervisorError::Command {
        operation,
        domain: domain.to_string(),
        source,
    }
}

#[derive(Debug, Default)]
struct CharDevice {
    path: Option<String>,
    alias: Option<String>,
}

fn attribute(element: &BytesStart, name: &str) -> Result<Option<String>, String> {
    match element.try_get_attribute(name).map_err(|e| e.to_string())? {
        Some(attribute) => Ok(Some(
            attribute
                .unescape_value()
                .map_err(|e| e.to_string())?
                .into_owned(),
        )),
        None => Ok(None),
    }
}

fn is_char_device(name: &[u8]) -> bool {
    name == b"serial" || name == b"console"
}

/// Find the host path of the character device aliased `device` in a live
/// domain XML
pub(crate) fn console_path(xml: &str, device: &str) -> Result<Option<String>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut current: Option<CharDevice> = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) if is_char_device(e.name().as_ref()) => {
                current = Some(CharDevice::default());
            }
            Event::Start(e) | Event::Empty(e) => {
                if let Some(char_device) = current.as_mut() {
                    match e.name().as_ref() {
                        b"source" => char_device.path = attribute(&e, "path")?,
                        b"alias" => char_device.alias = attribute(&e, "name")?,
                        _ => {}
                    }
                }
            }
            Event::End(e) if is_char_device(e.name().as_ref()) => {
                if let Some(CharDevice {
                    path: Some(path),
                    alias: Some(alias),
                }) = current.take()
                {
                    if alias == device {
                        return Ok(Some(path));
                    }
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Attach to the console device at `path`. Both handles are non-blocking and
/// registered with the reactor, so dropping a pending read releases the
/// device. `O_NOCTTY` keeps the PTY from becoming our controlling terminal.
pub(crate) fn open_console_device(path: &Path) -> io::Result<ConsoleStream> {
    let flags = libc::O_NONBLOCK | libc::O_NOCTTY;
    let reader = OpenOptions::new().read(true).custom_flags(flags).open(path)?;
    let writer = OpenOptions::new().write(true).custom_flags(flags).open(path)?;
    Ok(ConsoleStream::new(
        pipe::Receiver::from_file_unchecked(reader)?,
        pipe::Sender::from_file_unchecked(writer)?,
    ))
}

/// Name of the domain a descriptor defines, the `<name>` child of `<domain>`
fn domain_name(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut depth = 0usize;
    let mut in_name = false;

    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                depth += 1;
                in_name = depth == 2 && e.name().as_ref() == b"name";
            }
            Event::Text(text) if in_name => return text.unescape().ok().map(|t| t.into_owned()),
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                in_name = false;
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

#[async_trait]
impl Hypervisor for Virsh {
    #[instrument(skip(self), fields(uri = %self.connect_uri))]
    async fn lookup_domain(&self, name: &str) -> Result<Option<DomainState>, HypervisorError> {
        match self.virsh("domstate", name).await {
            Ok(state) => state
                .parse::<DomainState>()
                .map(Some)
                .map_err(|state| HypervisorError::UnknownState(name.to_string(), state)),
            Err(HypervisorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all, fields(uri = %self.connect_uri))]
    async fn define_domain(&self, xml: &str) -> Result<(), HypervisorError> {
        let args = ["define".to_string(), "/dev/stdin".to_string()];
        let output = self
            .tool
            .run_with_input(&args, xml.as_bytes())
            .await
            .map_err(|source| HypervisorError::Command {
                operation: "define",
                domain: domain_name(xml).unwrap_or_default(),
                source,
            })?;
        info!("{}", output.trim());
        Ok(())
    }

    #[instrument(skip(self), fields(uri = %self.connect_uri))]
    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh("start", name).await?;
        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(uri = %self.connect_uri))]
    async fn open_console(
        &self,
        name: &str,
        device: &str,
    ) -> Result<ConsoleStream, HypervisorError> {
        let xml = self.virsh("dumpxml", name).await?;
        let path = console_path(&xml, device)
            .map_err(|e| HypervisorError::Description(name.to_string(), e))?
            .ok_or_else(|| HypervisorError::ConsoleUnavailable {
                domain: name.to_string(),
                device: device.to_string(),
            })?;
        debug!("Console {} of {} is {}", device, name, path);

        open_console_device(Path::new(&path))
            .map_err(|source| HypervisorError::ConsoleOpen { path, source })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::Write as _,
        os::unix::fs::PermissionsExt,
        path::Path,
        process::Command,
        time::Duration,
    };

    use futures::{channel::mpsc, StreamExt};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use vmpilot_models::models::Envelope;

    use super::{command_error, console_path, domain_name, open_console_device, Virsh};
    use crate::{
        builder::{tools::VirshBuilder, Builder},
        command::CommandError,
        console::{relay, Direction},
        hypervisor::{DomainState, Hypervisor, HypervisorError, CONSOLE_DEVICE},
    };

    const LIVE_XML: &str = r#"<domain type='kvm' id='7'>
  <name>vm-A</name>
  <devices>
    <serial type='pty'>
      <source path='/dev/pts/3'/>
      <target type='isa-serial' port='0'>
        <model name='isa-serial'/>
      </target>
      <alias name='serial0'/>
    </serial>
    <console type='pty' tty='/dev/pts/3'>
      <source path='/dev/pts/3'/>
      <target type='serial' port='0'/>
      <alias name='serial0'/>
    </console>
  </devices>
</domain>"#;

    /// Stand-in for virsh answering from files in `dir`
    fn fake_virsh(dir: &Path, dumpxml: &str) -> Virsh {
        fs::write(dir.join("dump.xml"), dumpxml).unwrap();
        let script = dir.join("virsh");
        fs::write(
            &script,
            format!(
                r#"#!/bin/sh
cd {dir}
echo "$@" >> calls.log
case "$3" in
  domstate)
    if [ "$4" = "vm-A" ]; then echo running; else echo "error: failed to get domain '$4'" >&2; exit 1; fi ;;
  define) cat > defined.xml; echo "Domain 'vm-A' defined from /dev/stdin" ;;
  start) echo "Domain '$4' started" ;;
  dumpxml) cat dump.xml ;;
  *) exit 2 ;;
esac
"#,
                dir = dir.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        VirshBuilder::new()
            .with_exec_binary(script)
            .with_connect_uri("test:///default".to_string())
            .try_build()
            .unwrap()
    }

    #[test]
    fn console_path_follows_alias() {
        assert_eq!(
            console_path(LIVE_XML, CONSOLE_DEVICE).unwrap(),
            Some("/dev/pts/3".to_string())
        );
        assert_eq!(console_path(LIVE_XML, "serial1").unwrap(), None);
    }

    #[test]
    fn console_path_of_inactive_domain() {
        let xml = "<domain><devices><serial type='pty'><target port='0'/></serial></devices></domain>";
        assert_eq!(console_path(xml, CONSOLE_DEVICE).unwrap(), None);
    }

    #[test]
    fn domain_name_ignores_nested_names() {
        let xml = "<domain><metadata><name>other</name></metadata><name>vm-A</name></domain>";
        assert_eq!(domain_name(xml), Some("vm-A".to_string()));
        assert_eq!(domain_name("<domain type=\"kvm\"/>"), None);
    }

    #[tokio::test]
    async fn lookup_maps_states_and_missing_domains() {
        let dir = tempdir().unwrap();
        let virsh = fake_virsh(dir.path(), LIVE_XML);
        assert_eq!(
            virsh.lookup_domain("vm-A").await.unwrap(),
            Some(DomainState::Running)
        );
        assert_eq!(virsh.lookup_domain("vm-B").await.unwrap(), None);
    }

    #[tokio::test]
    async fn define_passes_xml_on_stdin() {
        let dir = tempdir().unwrap();
        let virsh = fake_virsh(dir.path(), LIVE_XML);
        virsh.define_domain("<domain type=\"kvm\"/>").await.unwrap();
        virsh.start_domain("vm-A").await.unwrap();

        let defined = fs::read_to_string(dir.path().join("defined.xml")).unwrap();
        assert_eq!(defined, "<domain type=\"kvm\"/>");
        let calls = fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(
            calls.lines().collect::<Vec<_>>(),
            vec![
                "-c test:///default define /dev/stdin",
                "-c test:///default start vm-A"
            ]
        );
    }

    #[test]
    fn unknown_domain_errors_map_to_not_found() {
        let failed = |stderr: &str| CommandError::Failed {
            program: "virsh".to_string(),
            status: "exit status: 1".to_string(),
            stderr: stderr.to_string(),
        };
        let result = command_error("start", "vm-B", failed("error: failed to get domain 'vm-B'"));
        assert!(matches!(result, HypervisorError::NotFound(name) if name == "vm-B"));
        let result = command_error("start", "vm-B", failed("error: internal error"));
        assert!(matches!(result, HypervisorError::Command { operation: "start", .. }));
    }

    /// FIFO standing in for a PTY, what is written comes back on the read side
    fn fifo(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("pty");
        let status = Command::new("mkfifo").arg(&path).status().unwrap();
        assert!(status.success());
        path
    }

    #[tokio::test]
    async fn open_console_attaches_to_device_path() {
        let dir = tempdir().unwrap();
        let pty = fifo(dir.path());
        let xml = LIVE_XML.replace("/dev/pts/3", &pty.display().to_string());
        let virsh = fake_virsh(dir.path(), &xml);

        let console = virsh.open_console("vm-A", CONSOLE_DEVICE).await.unwrap();
        let (mut reader, mut writer) = console.split();
        writer.write_all(b"root\n").await.unwrap();
        writer.flush().await.unwrap();

        let mut echoed = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"root\n");
    }

    #[tokio::test]
    async fn console_output_reaches_reconnected_client() {
        let dir = tempdir().unwrap();
        let pty = fifo(dir.path());

        let (client_tx, mut from_first) = mpsc::unbounded::<String>();
        let (to_first, client_rx) = mpsc::unbounded::<Result<String, String>>();
        let first = tokio::spawn(relay(
            open_console_device(&pty).unwrap(),
            client_tx,
            client_rx,
        ));

        let mut guest = fs::OpenOptions::new().write(true).open(&pty).unwrap();
        guest.write_all(b"boot\n").unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), from_first.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Envelope::from_json(&frame).unwrap().message, "boot\n");

        // the first session is now waiting on its next console read
        drop(to_first);
        let end = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.ended_by, Direction::ClientToConsole);

        let (client_tx, mut from_second) = mpsc::unbounded::<String>();
        let (_to_second, client_rx) = mpsc::unbounded::<Result<String, String>>();
        let second = tokio::spawn(relay(
            open_console_device(&pty).unwrap(),
            client_tx,
            client_rx,
        ));
        guest.write_all(b"login: ").unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), from_second.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Envelope::from_json(&frame).unwrap().message, "login: ");
        second.abort();
    }

    #[tokio::test]
    async fn open_console_without_device() {
        let dir = tempdir().unwrap();
        let virsh = fake_virsh(dir.path(), "<domain><devices/></domain>");
        let result = virsh.open_console("vm-A", CONSOLE_DEVICE).await;
        assert!(matches!(
            result,
            Err(HypervisorError::ConsoleUnavailable { .. })
        ));
    }
}
