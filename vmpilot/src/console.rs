//! # Console relay
//!
//! Bridges the serial console of a running domain with one client
//! connection. Traffic is wrapped in [Envelope]s: bytes read from the console
//! go out as `server` envelopes, `client` envelopes coming in are typed into
//! the console and anything else the client sends is ignored.
//!
//! A session runs two pumps, one per direction, as separate tasks. Each pump
//! owns the handles it uses and drops them when it returns. The first pump to
//! stop cancels the [SessionSignal], the other one observes it before its next
//! read or write and stops as well, so ending either direction always
//! releases both the console and the client connection.
//!
//! The client transport is any pair of a [Sink] of text frames and a
//! [Stream] of received text frames, which is what a split WebSocket looks
//! like once binary and control frames are filtered out.
use std::{fmt, io, sync::Arc};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};
use tracing::{debug, info, instrument, trace, warn};
use vmpilot_models::models::Envelope;

use crate::hypervisor::{ConsoleStream, DomainState, Hypervisor, HypervisorError, CONSOLE_DEVICE};

/// Largest chunk read from the console at once
pub const READ_BUFFER_SIZE: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("console stream failed, reason: {0}")]
    Stream(#[source] io::Error),
    #[error("client transport failed, reason: {0}")]
    Transport(String),
    #[error("could not encode envelope, reason: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("domain {domain} is not running ({state})")]
    NotRunning { domain: String, state: String },
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error("relay task failed, reason: {0}")]
    Task(String),
}

/// Cancellation shared by the two pumps of a session, remembering which
/// direction stopped first
#[derive(Debug, Clone)]
pub struct SessionSignal {
    sender: Arc<watch::Sender<Option<Direction>>>,
    receiver: watch::Receiver<Option<Direction>>,
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSignal {
    pub fn new() -> SessionSignal {
        let (sender, receiver) = watch::channel(None);
        SessionSignal {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Cancel the session on behalf of `by`, only the first call is recorded
    pub fn cancel(&self, by: Direction) {
        self.sender.send_if_modified(|first| match first {
            Some(_) => false,
            None => {
                *first = Some(by);
                true
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Direction whose [SessionSignal::cancel] came first
    pub fn ended_by(&self) -> Option<Direction> {
        *self.receiver.borrow()
    }

    /// Resolves once [SessionSignal::cancel] was called on any clone
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if receiver.borrow_and_update().is_some() {
                return;
            }
            // the sender lives as long as self, this never errors
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ConsoleToClient,
    ClientToConsole,
}

/// Why a pump stopped
#[derive(Debug)]
pub enum PumpEnd {
    /// The console reached end of file
    ConsoleClosed,
    /// The client ended its stream
    ClientClosed,
    /// The other direction stopped first
    Cancelled,
    Failed(RelayError),
}

impl PumpEnd {
    pub fn is_failure(&self) -> bool {
        matches!(self, PumpEnd::Failed(_))
    }
}

/// Outcome of a session once both pumps stopped
#[derive(Debug)]
pub struct SessionEnd {
    /// Direction which stopped first and ended the session
    pub ended_by: Direction,
    pub console_to_client: PumpEnd,
    pub client_to_console: PumpEnd,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = match self.ended_by {
            Direction::ConsoleToClient => &self.console_to_client,
            Direction::ClientToConsole => &self.client_to_console,
        };
        write!(f, "session ended by {:?}: {:?}", self.ended_by, cause)
    }
}

/// Length of the UTF-8 sequence cut short at the end of `bytes`
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        // continuation bytes are 0b10xxxxxx
        if bytes[i] & 0xC0 != 0x80 {
            return match std::str::from_utf8(&bytes[i..]) {
                Err(e) if e.error_len().is_none() => bytes.len() - i,
                _ => 0,
            };
        }
    }
    0
}

async fn console_to_client<R, Tx>(reader: &mut R, client: &mut Tx, signal: &SessionSignal) -> PumpEnd
where
    R: AsyncRead + Unpin,
    Tx: Sink<String> + Unpin,
    Tx::Error: fmt::Display,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    // bytes of a character split by the previous read, kept at the front
    let mut carried = 0;
    loop {
        let read = tokio::select! {
            _ = signal.cancelled() => return PumpEnd::Cancelled,
            read = reader.read(&mut buffer[carried..]) => read,
        };
        let (closed, filled) = match read {
            Ok(0) => (true, carried),
            Ok(n) => (false, carried + n),
            Err(e) => return PumpEnd::Failed(RelayError::Stream(e)),
        };
        trace!("Read {} bytes from console", filled - carried);

        let kept = if closed { 0 } else { incomplete_tail(&buffer[..filled]) };
        let text = String::from_utf8_lossy(&buffer[..filled - kept]).into_owned();
        buffer.copy_within(filled - kept..filled, 0);
        carried = kept;

        if !text.is_empty() {
            let frame = match Envelope::server(text).to_json() {
                Ok(frame) => frame,
                Err(e) => return PumpEnd::Failed(RelayError::Encode(e)),
            };
            let sent = tokio::select! {
                _ = signal.cancelled() => return PumpEnd::Cancelled,
                sent = client.send(frame) => sent,
            };
            if let Err(e) = sent {
                return PumpEnd::Failed(RelayError::Transport(e.to_string()));
            }
        }
        if closed {
            return PumpEnd::ConsoleClosed;
        }
    }
}

/// Write the whole payload, `Ok(0)` from the console counts as a failure
async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < payload.len() {
        match writer.write(&payload[written..]).await? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "console accepted no bytes",
                ))
            }
            n => written += n,
        }
    }
    writer.flush().await
}

async fn client_to_console<W, Rx, E>(writer: &mut W, client: &mut Rx, signal: &SessionSignal) -> PumpEnd
where
    W: AsyncWrite + Unpin,
    Rx: Stream<Item = Result<String, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let received = tokio::select! {
            _ = signal.cancelled() => return PumpEnd::Cancelled,
            received = client.next() => received,
        };
        let frame = match received {
            None => return PumpEnd::ClientClosed,
            Some(Err(e)) => return PumpEnd::Failed(RelayError::Transport(e.to_string())),
            Some(Ok(frame)) => frame,
        };
        let envelope = match Envelope::from_json(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Skipping undecodable frame: {}", e);
                continue;
            }
        };
        if !envelope.is_client() || envelope.message.is_empty() {
            trace!("Ignoring {} envelope", envelope.kind);
            continue;
        }

        if signal.is_cancelled() {
            return PumpEnd::Cancelled;
        }
        if let Err(e) = write_payload(writer, envelope.message.as_bytes()).await {
            warn!("Console write failed, aborting stream: {}", e);
            if let Err(shutdown) = writer.shutdown().await {
                debug!("Console abort failed: {}", shutdown);
            }
            return PumpEnd::Failed(RelayError::Stream(e));
        }
    }
}

/// Pump bytes between `console` and the client until either side stops
pub async fn relay<Tx, Rx, E>(console: ConsoleStream, client_tx: Tx, client_rx: Rx) -> SessionEnd
where
    Tx: Sink<String> + Send + Unpin + 'static,
    Tx::Error: fmt::Display + Send,
    Rx: Stream<Item = Result<String, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
{
    let signal = SessionSignal::new();
    let (mut reader, mut writer) = console.split();

    let up_signal = signal.clone();
    let mut client_tx = client_tx;
    let mut up = tokio::spawn(async move {
        let end = console_to_client(&mut reader, &mut client_tx, &up_signal).await;
        up_signal.cancel(Direction::ConsoleToClient);
        if let Err(e) = client_tx.close().await {
            debug!("Closing client transport failed: {}", e);
        }
        end
    });

    let down_signal = signal.clone();
    let mut client_rx = client_rx;
    let mut down = tokio::spawn(async move {
        let end = client_to_console(&mut writer, &mut client_rx, &down_signal).await;
        down_signal.cancel(Direction::ClientToConsole);
        end
    });

    let joined = |result: Result<PumpEnd, tokio::task::JoinError>| {
        result.unwrap_or_else(|e| PumpEnd::Failed(RelayError::Task(e.to_string())))
    };
    // a finished task already cancelled the signal, this only matters when
    // one of them panicked
    let (stopped, console_to_client, client_to_console) = tokio::select! {
        first = &mut up => {
            signal.cancel(Direction::ConsoleToClient);
            (Direction::ConsoleToClient, joined(first), joined(down.await))
        }
        first = &mut down => {
            signal.cancel(Direction::ClientToConsole);
            (Direction::ClientToConsole, joined(up.await), joined(first))
        }
    };
    let end = SessionEnd {
        ended_by: signal.ended_by().unwrap_or(stopped),
        console_to_client,
        client_to_console,
    };
    info!("{}", end);
    end
}

/// Attaches clients to the console of running domains
#[derive(Clone)]
pub struct ConsoleRelay {
    hypervisor: Arc<dyn Hypervisor>,
    device: String,
}

impl fmt::Debug for ConsoleRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleRelay")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl ConsoleRelay {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> ConsoleRelay {
        ConsoleRelay {
            hypervisor,
            device: CONSOLE_DEVICE.to_string(),
        }
    }

    /// Character device to attach to, defaults to `serial0`
    pub fn with_device(self, device: String) -> ConsoleRelay {
        ConsoleRelay { device, ..self }
    }

    /// Open the console of `name`, which must be running
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn open(&self, name: &str) -> Result<ConsoleStream, RelayError> {
        match self.hypervisor.lookup_domain(name).await? {
            Some(DomainState::Running) => {}
            Some(state) => {
                return Err(RelayError::NotRunning {
                    domain: name.to_string(),
                    state: format!("{:?}", state),
                })
            }
            None => return Err(HypervisorError::NotFound(name.to_string()).into()),
        }
        let console = self.hypervisor.open_console(name, &self.device).await?;
        debug!("Console attached");
        Ok(console)
    }

    /// Open the console of `name` and relay it with the client until the
    /// session ends
    pub async fn attach<Tx, Rx, E>(
        &self,
        name: &str,
        client_tx: Tx,
        client_rx: Rx,
    ) -> Result<SessionEnd, RelayError>
    where
        Tx: Sink<String> + Send + Unpin + 'static,
        Tx::Error: fmt::Display + Send,
        Rx: Stream<Item = Result<String, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send + 'static,
    {
        let console = self.open(name).await?;
        Ok(relay(console, client_tx, client_rx).await)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        task::{Context, Poll},
        time::Duration,
    };

    use async_trait::async_trait;
    use futures::{channel::mpsc, SinkExt, StreamExt};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncWrite, AsyncWriteExt};
    use vmpilot_models::models::Envelope;

    use super::{
        incomplete_tail, relay, ConsoleRelay, Direction, PumpEnd, RelayError, SessionSignal,
    };
    use crate::hypervisor::{ConsoleStream, DomainState, Hypervisor, HypervisorError};

    type Frame = Result<String, String>;

    fn client_frame(kind: &str, message: &str) -> Frame {
        Ok(Envelope {
            kind: kind.to_string(),
            message: message.to_string(),
        }
        .to_json()
        .unwrap())
    }

    /// Console writer which rejects every write and counts aborts
    #[derive(Clone, Default)]
    struct RejectingWriter {
        writes: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        error: bool,
    }

    impl AsyncWrite for RejectingWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.error {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
            } else {
                Poll::Ready(Ok(0))
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn signal_reaches_every_clone() {
        let signal = SessionSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_cancelled());
        let waiting = tokio::spawn(async move { observer.cancelled().await });
        signal.cancel(Direction::ClientToConsole);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn signal_keeps_first_direction() {
        let signal = SessionSignal::new();
        assert_eq!(signal.ended_by(), None);
        signal.clone().cancel(Direction::ConsoleToClient);
        signal.cancel(Direction::ClientToConsole);
        assert_eq!(signal.ended_by(), Some(Direction::ConsoleToClient));
    }

    #[test]
    fn incomplete_tail_finds_cut_characters() {
        let dot = "●".as_bytes();
        assert_eq!(incomplete_tail(b"login: "), 0);
        assert_eq!(incomplete_tail(&[&b"ab"[..], &dot[..1]].concat()), 1);
        assert_eq!(incomplete_tail(&[&b"ab"[..], &dot[..2]].concat()), 2);
        assert_eq!(incomplete_tail(dot), 0);
        assert_eq!(incomplete_tail(&[b'a', 0xFF]), 0);
    }

    #[tokio::test]
    async fn characters_split_by_reads_stay_whole() {
        let (mut guest, console) = tokio::io::duplex(8192);
        let (console_read, console_write) = tokio::io::split(console);
        let (client_tx, from_relay) = mpsc::unbounded::<String>();
        let (_to_relay, client_rx) = mpsc::unbounded::<Frame>();

        let mut payload = "a".repeat(super::READ_BUFFER_SIZE - 1);
        payload.push_str("●ok ┌─┐");
        guest.write_all(payload.as_bytes()).await.unwrap();
        drop(guest);

        let end = relay(ConsoleStream::new(console_read, console_write), client_tx, client_rx).await;
        assert!(matches!(end.console_to_client, PumpEnd::ConsoleClosed));

        let frames: Vec<String> = from_relay.collect().await;
        let mut received = String::new();
        for frame in frames {
            let envelope = Envelope::from_json(&frame).unwrap();
            assert!(envelope.message.len() <= super::READ_BUFFER_SIZE);
            received.push_str(&envelope.message);
        }
        assert!(!received.contains('\u{FFFD}'));
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn console_bytes_reach_client_unmodified() {
        let (mut guest, console) = tokio::io::duplex(4096);
        let (console_read, console_write) = tokio::io::split(console);
        let (client_tx, mut from_relay) = mpsc::unbounded::<String>();
        let (to_relay, client_rx) = mpsc::unbounded::<Frame>();

        let session = tokio::spawn(relay(
            ConsoleStream::new(console_read, console_write),
            client_tx,
            client_rx,
        ));

        guest.write_all(b"Ubuntu 22.04 LTS\r\nlogin: ").await.unwrap();
        let frame = from_relay.next().await.unwrap();
        let envelope = Envelope::from_json(&frame).unwrap();
        assert_eq!(envelope.kind, "server");
        assert_eq!(envelope.message, "Ubuntu 22.04 LTS\r\nlogin: ");

        drop(to_relay);
        let end = session.await.unwrap();
        assert_eq!(end.ended_by, Direction::ClientToConsole);
        assert!(matches!(end.client_to_console, PumpEnd::ClientClosed));
        assert!(matches!(end.console_to_client, PumpEnd::Cancelled));
    }

    #[tokio::test]
    async fn chunks_never_exceed_buffer() {
        let (mut guest, console) = tokio::io::duplex(8192);
        let (console_read, console_write) = tokio::io::split(console);
        let (client_tx, from_relay) = mpsc::unbounded::<String>();
        let (_to_relay, client_rx) = mpsc::unbounded::<Frame>();

        let payload: Vec<u8> = (0..3000).map(|i| b'a' + (i % 26) as u8).collect();
        guest.write_all(&payload).await.unwrap();
        drop(guest);

        let end = relay(ConsoleStream::new(console_read, console_write), client_tx, client_rx).await;
        assert_eq!(end.ended_by, Direction::ConsoleToClient);
        assert!(matches!(end.console_to_client, PumpEnd::ConsoleClosed));

        let frames: Vec<String> = from_relay.collect().await;
        let mut received = String::new();
        for frame in frames {
            let envelope = Envelope::from_json(&frame).unwrap();
            assert!(!envelope.message.is_empty());
            assert!(envelope.message.len() <= super::READ_BUFFER_SIZE);
            received.push_str(&envelope.message);
        }
        assert_eq!(received.as_bytes(), payload.as_slice());
    }

    #[tokio::test]
    async fn only_client_envelopes_are_written() {
        let (mut guest, console) = tokio::io::duplex(4096);
        let (console_read, console_write) = tokio::io::split(console);
        let (client_tx, _from_relay) = mpsc::unbounded::<String>();
        let (mut to_relay, client_rx) = mpsc::unbounded::<Frame>();

        let session = tokio::spawn(relay(
            ConsoleStream::new(console_read, console_write),
            client_tx,
            client_rx,
        ));

        to_relay.send(client_frame("server", "ignored\n")).await.unwrap();
        to_relay.send(client_frame("resize", "80x24")).await.unwrap();
        to_relay.send(Ok("not json".to_string())).await.unwrap();
        to_relay.send(client_frame("client", "root\n")).await.unwrap();
        drop(to_relay);

        let end = session.await.unwrap();
        assert!(matches!(end.client_to_console, PumpEnd::ClientClosed));

        let mut typed = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut guest, &mut typed)
            .await
            .unwrap();
        assert_eq!(typed, "root\n");
    }

    async fn run_with_rejecting_writer(writer: RejectingWriter) -> super::SessionEnd {
        let (_guest, console) = tokio::io::duplex(64);
        let (console_read, _) = tokio::io::split(console);
        let (client_tx, _from_relay) = mpsc::unbounded::<String>();
        let (mut to_relay, client_rx) = mpsc::unbounded::<Frame>();

        for keys in ["ls\n", "pwd\n", "exit\n"] {
            to_relay.send(client_frame("client", keys)).await.unwrap();
        }
        relay(ConsoleStream::new(console_read, writer), client_tx, client_rx).await
    }

    #[tokio::test]
    async fn zero_length_write_aborts_once() {
        let writer = RejectingWriter::default();
        let end = run_with_rejecting_writer(writer.clone()).await;

        assert_eq!(end.ended_by, Direction::ClientToConsole);
        assert!(matches!(end.client_to_console, PumpEnd::Failed(RelayError::Stream(_))));
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_error_aborts_once() {
        let writer = RejectingWriter {
            error: true,
            ..Default::default()
        };
        let end = run_with_rejecting_writer(writer.clone()).await;

        assert!(end.client_to_console.is_failure());
        assert!(matches!(end.console_to_client, PumpEnd::Cancelled));
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_error_ends_session() {
        let (_guest, console) = tokio::io::duplex(64);
        let (console_read, console_write) = tokio::io::split(console);
        let (client_tx, _from_relay) = mpsc::unbounded::<String>();
        let (mut to_relay, client_rx) = mpsc::unbounded::<Frame>();
        to_relay.send(Err("connection reset".to_string())).await.unwrap();

        let end = relay(ConsoleStream::new(console_read, console_write), client_tx, client_rx).await;
        assert!(matches!(
            end.client_to_console,
            PumpEnd::Failed(RelayError::Transport(ref reason)) if reason == "connection reset"
        ));
    }

    #[tokio::test]
    async fn client_going_away_ends_console_pump() {
        let (mut guest, console) = tokio::io::duplex(64);
        let (console_read, console_write) = tokio::io::split(console);
        let (client_tx, from_relay) = mpsc::unbounded::<String>();
        let (_to_relay, client_rx) = mpsc::unbounded::<Frame>();
        drop(from_relay);

        let session = tokio::spawn(relay(
            ConsoleStream::new(console_read, console_write),
            client_tx,
            client_rx,
        ));
        guest.write_all(b"login: ").await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.ended_by, Direction::ConsoleToClient);
        assert!(matches!(end.console_to_client, PumpEnd::Failed(RelayError::Transport(_))));
        assert!(matches!(end.client_to_console, PumpEnd::Cancelled));
    }

    struct StateOnly(Option<DomainState>);

    #[async_trait]
    impl Hypervisor for StateOnly {
        async fn lookup_domain(&self, _: &str) -> Result<Option<DomainState>, HypervisorError> {
            Ok(self.0)
        }

        async fn define_domain(&self, _: &str) -> Result<(), HypervisorError> {
            unreachable!()
        }

        async fn start_domain(&self, _: &str) -> Result<(), HypervisorError> {
            unreachable!()
        }

        async fn open_console(&self, _: &str, _: &str) -> Result<ConsoleStream, HypervisorError> {
            let (console, _guest) = tokio::io::duplex(64);
            let (read, write) = tokio::io::split(console);
            Ok(ConsoleStream::new(read, write))
        }
    }

    #[tokio::test]
    async fn attach_requires_running_domain() {
        let relay = ConsoleRelay::new(Arc::new(StateOnly(Some(DomainState::Defined))));
        let result = relay.open("vm-A").await;
        assert!(matches!(result, Err(RelayError::NotRunning { .. })));

        let relay = ConsoleRelay::new(Arc::new(StateOnly(None)));
        let result = relay.open("vm-A").await;
        assert!(matches!(
            result,
            Err(RelayError::Hypervisor(HypervisorError::NotFound(_)))
        ));

        let relay = ConsoleRelay::new(Arc::new(StateOnly(Some(DomainState::Running))));
        assert!(relay.open("vm-A").await.is_ok());
    }
}
