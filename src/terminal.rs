use crate::decoder::{FrameDecoder, Utf8Decoder};
use crate::engine::{EngineGateway, ExecConfig};
use crate::error::{ErrorKind, Result};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SHELL: &str = "/bin/sh";
const PROMPT: &[u8] = b"$ ";
const READ_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    /// Socket when the engine upgrades the connection, polling otherwise.
    #[default]
    Auto,
    Socket,
    Polling,
}

impl FromStr for TerminalMode {
    type Err = ErrorKind;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "socket" => Ok(Self::Socket),
            "polling" | "poll" => Ok(Self::Polling),
            other => Err(ErrorKind::Unsupported(format!("terminal mode `{other}`"))),
        }
    }
}

/// Channel kind a session settled on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ActiveMode {
    Socket,
    Polling,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closed,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    Output(Bytes),
    State(SessionState),
    Error(ErrorKind),
}

/// Receives a session's events. It runs while the session is locked, so it
/// must hand events off and never call back into the manager.
pub type EventCallback = Arc<dyn Fn(TerminalEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "term-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub container_id: String,
    pub shell: String,
    pub state: SessionState,
    pub mode: Option<ActiveMode>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
enum Escape {
    #[default]
    None,
    Esc,
    Csi,
}

/// Local editing for polling sessions, where the remote side has no TTY to
/// echo or edit input.
#[derive(Debug, Default)]
struct LineDiscipline {
    buffer: String,
    text: Utf8Decoder,
    escape: Escape,
    after_cr: bool,
}

#[derive(Debug, Default, PartialEq)]
struct Edit {
    echo: Vec<u8>,
    lines: Vec<String>,
}

impl LineDiscipline {
    fn input(&mut self, bytes: &[u8]) -> Edit {
        let mut edit = Edit::default();
        let text = self.text.feed(bytes);

        for ch in text.chars() {
            let after_cr = std::mem::take(&mut self.after_cr);
            match (self.escape, ch) {
                (Escape::Esc, '[') => {
                    self.escape = Escape::Csi;
                    continue;
                }
                (Escape::Esc, _) => {
                    self.escape = Escape::None;
                    continue;
                }
                (Escape::Csi, '\u{40}'..='\u{7e}') => {
                    self.escape = Escape::None;
                    continue;
                }
                (Escape::Csi, _) => continue,
                (Escape::None, _) => {}
            }

            match ch {
                '\u{1b}' => self.escape = Escape::Esc,
                '\r' => {
                    self.after_cr = true;
                    edit.echo.extend_from_slice(b"\r\n");
                    edit.lines.push(std::mem::take(&mut self.buffer));
                }
                '\n' if after_cr => {}
                '\n' => {
                    edit.echo.extend_from_slice(b"\r\n");
                    edit.lines.push(std::mem::take(&mut self.buffer));
                }
                '\u{7f}' | '\u{8}' => {
                    if self.buffer.pop().is_some() {
                        edit.echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                '\u{3}' => {
                    self.buffer.clear();
                    edit.echo.extend_from_slice(b"^C\r\n");
                    edit.lines.push(String::new());
                }
                ch if ch.is_control() => {}
                ch => {
                    self.buffer.push(ch);
                    let mut encoded = [0u8; 4];
                    edit.echo
                        .extend_from_slice(ch.encode_utf8(&mut encoded).as_bytes());
                }
            }
        }
        edit
    }
}

enum Channel {
    Socket {
        exec_id: String,
        input: mpsc::UnboundedSender<Bytes>,
        token: CancellationToken,
    },
    Polling {
        discipline: LineDiscipline,
        lines: mpsc::UnboundedSender<String>,
        token: CancellationToken,
    },
}

impl Channel {
    fn cancel(&self) {
        match self {
            Self::Socket { token, .. } | Self::Polling { token, .. } => token.cancel(),
        }
    }

    fn mode(&self) -> ActiveMode {
        match self {
            Self::Socket { .. } => ActiveMode::Socket,
            Self::Polling { .. } => ActiveMode::Polling,
        }
    }
}

enum Link {
    Socket {
        exec_id: String,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    },
    Polling,
}

struct SessionInner {
    state: SessionState,
    generation: u64,
    channel: Option<Channel>,
    size: Option<(u16, u16)>,
}

struct Session {
    id: SessionId,
    container_id: String,
    shell: String,
    callback: EventCallback,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        if inner.state != state {
            debug!("{} {:?} -> {:?}", self.id, inner.state, state);
            inner.state = state;
            (self.callback)(TerminalEvent::State(state));
        }
    }

    /// Delivers an event only while `generation` is still the live channel.
    fn emit(&self, generation: u64, event: TerminalEvent) -> bool {
        let inner = self.lock();
        if inner.generation != generation || inner.state == SessionState::Closed {
            return false;
        }
        (self.callback)(event);
        true
    }

    fn fail(&self, generation: u64, error: ErrorKind) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state == SessionState::Closed {
            return;
        }
        warn!("{} failed: {error}", self.id);
        if let Some(channel) = inner.channel.take() {
            channel.cancel();
        }
        (self.callback)(TerminalEvent::Error(error));
        self.set_state(&mut inner, SessionState::Error);
    }

    fn remote_closed(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        info!("{} closed by engine", self.id);
        if let Some(channel) = inner.channel.take() {
            channel.cancel();
        }
        self.set_state(&mut inner, SessionState::Closed);
    }

    /// Drops any live channel and starts a new generation in `Connecting`.
    fn begin_connect(&self) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(channel) = inner.channel.take() {
            channel.cancel();
        }
        self.set_state(&mut inner, SessionState::Connecting);
        inner.generation
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(channel) = inner.channel.take() {
            channel.cancel();
        }
        self.set_state(&mut inner, SessionState::Closed);
    }

    fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            id: self.id,
            container_id: self.container_id.clone(),
            shell: self.shell.clone(),
            state: inner.state,
            mode: inner.channel.as_ref().map(Channel::mode),
        }
    }
}

/// Owns every interactive exec session. Sessions are independent of each
/// other; each one reports through its own callback.
pub struct TerminalSessionManager {
    gateway: EngineGateway,
    mode: TerminalMode,
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl TerminalSessionManager {
    pub fn new(gateway: EngineGateway, mode: TerminalMode) -> Self {
        Self {
            gateway,
            mode,
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions()
            .get(&id)
            .cloned()
            .ok_or(ErrorKind::StreamClosed)
    }

    /// Registers an idle session; nothing is sent to the engine until
    /// `connect`.
    pub fn create(&self, container_id: &str, shell: Option<&str>, on_event: EventCallback) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let shell = shell
            .map(str::trim)
            .filter(|shell| !shell.is_empty())
            .unwrap_or(DEFAULT_SHELL);
        let session = Arc::new(Session {
            id,
            container_id: container_id.to_string(),
            shell: shell.to_string(),
            callback: on_event,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                generation: 0,
                channel: None,
                size: None,
            }),
        });
        self.sessions().insert(id, session);
        id
    }

    /// Creates and connects a session. On failure the session stays
    /// registered in `Error` so it can be reconnected or closed.
    pub async fn open(
        &self,
        container_id: &str,
        shell: Option<&str>,
        on_event: EventCallback,
    ) -> Result<SessionId> {
        let id = self.create(container_id, shell, on_event);
        self.connect(id).await?;
        Ok(id)
    }

    pub async fn connect(&self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        let generation = session.begin_connect();

        let link = match self.establish(&session).await {
            Ok(link) => link,
            Err(error) => {
                session.fail(generation, error.clone());
                return Err(error);
            }
        };

        let resize = {
            let mut inner = session.lock();
            if inner.generation != generation || inner.state == SessionState::Closed {
                return Err(ErrorKind::StreamClosed);
            }
            let channel = self.activate(&session, generation, link);
            let resize = match (&channel, inner.size) {
                (Channel::Socket { exec_id, .. }, Some((rows, cols))) => {
                    Some((exec_id.clone(), rows, cols))
                }
                _ => None,
            };
            let polling = channel.mode() == ActiveMode::Polling;
            inner.channel = Some(channel);
            session.set_state(&mut inner, SessionState::Connected);
            if polling {
                (session.callback)(TerminalEvent::Output(Bytes::from_static(PROMPT)));
            }
            resize
        };
        info!("{id} connected to {}", session.container_id);

        if let Some((exec_id, rows, cols)) = resize
            && let Err(error) = self.gateway.resize_exec(&exec_id, rows, cols).await
        {
            debug!("initial resize of {id} failed: {error}");
        }
        Ok(())
    }

    /// Explicit reconnect: the current channel is dropped and the exec is
    /// created again with the same container and shell.
    pub async fn reconnect(&self, id: SessionId) -> Result<()> {
        info!("reconnecting {id}");
        self.connect(id).await
    }

    async fn establish(&self, session: &Session) -> Result<Link> {
        if self.mode == TerminalMode::Polling {
            return self.probe_polling(session).await;
        }

        let exec_id = self
            .gateway
            .create_exec(&session.container_id, &ExecConfig::interactive(&session.shell))
            .await?;
        match self.gateway.attach_exec(&exec_id, true).await {
            Ok(duplex) => Ok(Link::Socket {
                exec_id,
                reader: duplex.reader,
                writer: duplex.writer,
            }),
            Err(error @ (ErrorKind::Unsupported(_) | ErrorKind::Http { .. }))
                if self.mode == TerminalMode::Auto =>
            {
                info!("{} falling back to polling: {error}", session.id);
                self.probe_polling(session).await
            }
            Err(error) => Err(error),
        }
    }

    async fn probe_polling(&self, session: &Session) -> Result<Link> {
        let details = self.gateway.inspect_container(&session.container_id).await?;
        if !details.state.running {
            return Err(ErrorKind::Http {
                status: 409,
                message: format!("container {} is not running", session.container_id),
            });
        }
        Ok(Link::Polling)
    }

    fn activate(&self, session: &Arc<Session>, generation: u64, link: Link) -> Channel {
        let token = CancellationToken::new();
        match link {
            Link::Socket {
                exec_id,
                reader,
                writer,
            } => {
                let (input, queued) = mpsc::unbounded_channel();
                tokio::spawn(pump_output(
                    Arc::clone(session),
                    generation,
                    reader,
                    token.clone(),
                    self.gateway.endpoint(),
                ));
                tokio::spawn(pump_input(
                    Arc::clone(session),
                    generation,
                    writer,
                    queued,
                    token.clone(),
                    self.gateway.endpoint(),
                ));
                Channel::Socket {
                    exec_id,
                    input,
                    token,
                }
            }
            Link::Polling => {
                let (lines, queued) = mpsc::unbounded_channel();
                tokio::spawn(run_lines(
                    Arc::clone(session),
                    self.gateway.clone(),
                    generation,
                    queued,
                    token.clone(),
                ));
                Channel::Polling {
                    discipline: LineDiscipline::default(),
                    lines,
                    token,
                }
            }
        }
    }

    /// Forwards input to the remote side as soon as it arrives.
    pub fn send_input(&self, id: SessionId, bytes: &[u8]) -> Result<()> {
        let session = self.session(id)?;
        let mut inner = session.lock();
        if inner.state != SessionState::Connected {
            return Err(ErrorKind::StreamClosed);
        }

        match inner.channel.as_mut() {
            Some(Channel::Socket { input, .. }) => input
                .send(Bytes::copy_from_slice(bytes))
                .map_err(|_| ErrorKind::StreamClosed),
            Some(Channel::Polling {
                discipline, lines, ..
            }) => {
                let edit = discipline.input(bytes);
                for line in edit.lines {
                    lines.send(line).map_err(|_| ErrorKind::StreamClosed)?;
                }
                if !edit.echo.is_empty() {
                    (session.callback)(TerminalEvent::Output(Bytes::from(edit.echo)));
                }
                Ok(())
            }
            None => Err(ErrorKind::StreamClosed),
        }
    }

    /// Sends new dimensions to the remote exec. Polling sessions have no
    /// remote TTY; the size is kept for the next socket connection.
    pub async fn resize(&self, id: SessionId, rows: u16, cols: u16) -> Result<()> {
        let session = self.session(id)?;
        let exec_id = {
            let mut inner = session.lock();
            inner.size = Some((rows, cols));
            match &inner.channel {
                Some(Channel::Socket { exec_id, .. }) => Some(exec_id.clone()),
                _ => None,
            }
        };

        match exec_id {
            Some(exec_id) => self.gateway.resize_exec(&exec_id, rows, cols).await,
            None => Ok(()),
        }
    }

    /// Closes a session; idempotent. No event reaches the callback once this
    /// returns, and the remote side sees its input closed.
    pub fn close(&self, id: SessionId) {
        let removed = self.sessions().remove(&id);
        if let Some(session) = removed {
            session.shutdown();
            info!("{id} closed");
        }
    }

    pub fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions());
        for session in sessions.values() {
            session.shutdown();
        }
        if !sessions.is_empty() {
            info!("closed {} terminal sessions", sessions.len());
        }
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.info(id).map(|info| info.state)
    }

    pub fn info(&self, id: SessionId) -> Option<SessionInfo> {
        let session = self.sessions().get(&id).cloned()?;
        Some(session.info())
    }

    pub fn sessions_for(&self, container_id: &str) -> Vec<SessionId> {
        self.sessions()
            .values()
            .filter(|session| session.container_id == container_id)
            .map(|session| session.id)
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }
}

async fn pump_output(
    session: Arc<Session>,
    generation: u64,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    token: CancellationToken,
    endpoint: String,
) {
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            read = reader.read(&mut buffer) => read,
        };
        match read {
            Ok(0) => {
                session.remote_closed(generation);
                return;
            }
            Ok(count) => {
                let chunk = Bytes::copy_from_slice(&buffer[..count]);
                if !session.emit(generation, TerminalEvent::Output(chunk)) {
                    return;
                }
            }
            Err(error) => {
                session.fail(
                    generation,
                    ErrorKind::ConnectionUnavailable {
                        endpoint,
                        reason: error.to_string(),
                    },
                );
                return;
            }
        }
    }
}

async fn pump_input(
    session: Arc<Session>,
    generation: u64,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
    token: CancellationToken,
    endpoint: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = queued.recv() => next,
        };
        let Some(bytes) = next else {
            break;
        };

        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(error) => Err(error),
        };
        if let Err(error) = written {
            session.fail(
                generation,
                ErrorKind::ConnectionUnavailable {
                    endpoint,
                    reason: error.to_string(),
                },
            );
            break;
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!("{} input shutdown: {error}", session.id);
    }
}

async fn run_lines(
    session: Arc<Session>,
    gateway: EngineGateway,
    generation: u64,
    mut queued: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = queued.recv() => next,
        };
        let Some(line) = next else {
            return;
        };

        let command = line.trim();
        if !command.is_empty() {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = run_one_shot(&gateway, &session, command) => outcome,
            };
            match outcome {
                Ok(output) => {
                    if !output.is_empty()
                        && !session.emit(generation, TerminalEvent::Output(output))
                    {
                        return;
                    }
                }
                Err(error) => {
                    let message = Bytes::from(format!("{error}\r\n"));
                    if !session.emit(generation, TerminalEvent::Output(message))
                        || !session.emit(generation, TerminalEvent::Error(error))
                    {
                        return;
                    }
                }
            }
        }

        if !session.emit(generation, TerminalEvent::Output(Bytes::from_static(PROMPT))) {
            return;
        }
    }
}

async fn run_one_shot(gateway: &EngineGateway, session: &Session, command: &str) -> Result<Bytes> {
    let exec_id = gateway
        .create_exec(
            &session.container_id,
            &ExecConfig::one_shot(&session.shell, command),
        )
        .await?;
    let raw = gateway.run_exec(&exec_id, false).await?;

    let mut frames = FrameDecoder::new();
    let mut output = Vec::with_capacity(raw.len());
    for frame in frames.feed(&raw).into_iter().chain(frames.flush()) {
        output.extend_from_slice(&frame.payload);
    }
    Ok(Bytes::from(to_crlf(&output)))
}

/// Output post-processing a TTY would do: bare `\n` becomes `\r\n`.
fn to_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 16);
    let mut previous = 0u8;
    for &byte in bytes {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        ActiveMode, Edit, EventCallback, LineDiscipline, SessionState, TerminalEvent, TerminalMode,
        TerminalSessionManager, to_crlf,
    };
    use crate::engine::EngineGateway;
    use crate::error::ErrorKind;
    use crate::testing::FakeTransport;
    use crate::transport::Method;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    type Events = Arc<Mutex<Vec<TerminalEvent>>>;

    fn recorder() -> (EventCallback, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: EventCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
        (callback, events)
    }

    fn output(events: &Events) -> String {
        let bytes = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                TerminalEvent::Output(bytes) => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect::<Vec<_>>();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn states(events: &Events) -> Vec<SessionState> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                TerminalEvent::State(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    async fn wait_until(mut ready: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !ready() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn engine_with_exec() -> Arc<FakeTransport> {
        let fake = FakeTransport::new();
        fake.respond(Method::POST, "/containers/web/exec", 201, json!({"Id": "exec1"}));
        fake.respond(
            Method::GET,
            "/containers/web/json",
            200,
            json!({"Id": "web", "State": {"Running": true}}),
        );
        fake
    }

    #[tokio::test]
    async fn socket_session_relays_both_directions() {
        let fake = engine_with_exec();
        fake.enable_upgrades();
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Auto);
        let (callback, events) = recorder();

        let id = manager.open("web", None, callback).await.unwrap();
        assert_eq!(manager.info(id).unwrap().mode, Some(ActiveMode::Socket));
        assert_eq!(
            states(&events),
            vec![SessionState::Connecting, SessionState::Connected]
        );

        let mut remote = fake.take_upgraded().unwrap();
        remote.write_all(b"/ # ").await.unwrap();
        wait_until(|| output(&events) == "/ # ").await;

        manager.send_input(id, b"ls\r").unwrap();
        let mut received = [0u8; 3];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"ls\r");
        assert!(
            fake.requests()
                .contains(&"UPGRADE /exec/exec1/start".to_string())
        );
    }

    #[tokio::test]
    async fn no_output_after_close() {
        let fake = engine_with_exec();
        fake.enable_upgrades();
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Socket);
        let (callback, events) = recorder();

        let id = manager.open("web", Some("/bin/bash"), callback).await.unwrap();
        let mut remote = fake.take_upgraded().unwrap();
        remote.write_all(b"before").await.unwrap();
        wait_until(|| output(&events) == "before").await;

        manager.close(id);
        manager.close(id);
        let seen = events.lock().unwrap().len();
        let _ = remote.write_all(b"after").await;

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), remote.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(events.lock().unwrap().len(), seen);
        assert_eq!(output(&events), "before");
        assert_eq!(states(&events).last(), Some(&SessionState::Closed));
        assert!(manager.state(id).is_none());
        assert!(manager.send_input(id, b"x").is_err());
    }

    #[tokio::test]
    async fn remote_hangup_closes_session() {
        let fake = engine_with_exec();
        fake.enable_upgrades();
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Socket);
        let (callback, events) = recorder();

        let id = manager.open("web", None, callback).await.unwrap();
        drop(fake.take_upgraded());
        wait_until(|| manager.state(id) == Some(SessionState::Closed)).await;
        assert_eq!(states(&events).last(), Some(&SessionState::Closed));
    }

    #[tokio::test]
    async fn strict_socket_mode_fails_without_upgrade() {
        let fake = engine_with_exec();
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Socket);
        let (callback, events) = recorder();

        let error = manager.open("web", None, callback).await.unwrap_err();
        assert!(matches!(error, ErrorKind::Unsupported(_)));
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .any(|event| matches!(event, TerminalEvent::Error(_)))
        );
        let ids = manager.sessions_for("web");
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.state(ids[0]), Some(SessionState::Error));
    }

    #[tokio::test]
    async fn auto_mode_falls_back_to_polling_line_discipline() {
        let fake = engine_with_exec();
        let mut framed = vec![1u8, 0, 0, 0, 0, 0, 0, 3];
        framed.extend_from_slice(b"hi\n");
        fake.respond(
            Method::POST,
            "/exec/exec1/start",
            200,
            Value::String(String::from_utf8(framed).unwrap()),
        );
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Auto);
        let (callback, events) = recorder();

        let id = manager.open("web", None, callback).await.unwrap();
        assert_eq!(manager.info(id).unwrap().mode, Some(ActiveMode::Polling));
        assert_eq!(output(&events), "$ ");

        manager.send_input(id, b"ec\x7fcho hi\r").unwrap();
        wait_until(|| output(&events).ends_with("hi\r\n$ ")).await;
        assert_eq!(output(&events), "$ ec\x08 \x08cho hi\r\nhi\r\n$ ");
        assert_eq!(fake.count("POST /exec/exec1/start"), 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_channel_and_ignores_old_one() {
        let fake = engine_with_exec();
        fake.enable_upgrades();
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Socket);
        let (callback, events) = recorder();

        let id = manager.open("web", None, callback).await.unwrap();
        let mut first = fake.take_upgraded().unwrap();
        manager.reconnect(id).await.unwrap();
        let mut second = fake.take_upgraded().unwrap();
        assert_eq!(fake.upgrade_count(), 2);

        let _ = first.write_all(b"stale").await;
        second.write_all(b"fresh").await.unwrap();
        wait_until(|| output(&events).contains("fresh")).await;
        assert!(!output(&events).contains("stale"));
        assert_eq!(manager.state(id), Some(SessionState::Connected));
    }

    #[tokio::test]
    async fn resize_targets_live_exec() {
        let fake = engine_with_exec();
        fake.enable_upgrades();
        fake.respond(Method::POST, "/exec/exec1/resize", 200, Value::Null);
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Socket);
        let (callback, _) = recorder();

        let id = manager.open("web", None, callback).await.unwrap();
        manager.resize(id, 40, 120).await.unwrap();
        assert!(
            fake.requests()
                .contains(&"POST /exec/exec1/resize?h=40&w=120".to_string())
        );
    }

    #[tokio::test]
    async fn close_all_clears_every_session() {
        let fake = engine_with_exec();
        let manager = TerminalSessionManager::new(EngineGateway::new(fake.clone()), TerminalMode::Polling);
        let (first_cb, first) = recorder();
        let (second_cb, _) = recorder();

        manager.open("web", None, first_cb).await.unwrap();
        manager.open("web", None, second_cb).await.unwrap();
        assert_eq!(manager.sessions_for("web").len(), 2);
        assert!(manager.sessions_for("db").is_empty());

        manager.close_all();
        assert_eq!(manager.session_count(), 0);
        assert_eq!(states(&first).last(), Some(&SessionState::Closed));
    }

    #[test]
    fn line_discipline_edits_and_skips_escape_sequences() {
        let mut discipline = LineDiscipline::default();
        assert_eq!(
            discipline.input(b"ab\x1b[Ac\r\n"),
            Edit {
                echo: b"abc\r\n".to_vec(),
                lines: vec!["abc".to_string()],
            }
        );
        assert_eq!(
            discipline.input(b"\x7fxy\x03"),
            Edit {
                echo: b"xy^C\r\n".to_vec(),
                lines: vec![String::new()],
            }
        );
        assert_eq!(discipline.input("é\n".as_bytes()).lines, vec!["é".to_string()]);
    }

    #[test]
    fn crlf_conversion_leaves_existing_pairs() {
        assert_eq!(to_crlf(b"a\nb\r\nc"), b"a\r\nb\r\nc".to_vec());
        assert_eq!("polling".parse::<TerminalMode>().unwrap(), TerminalMode::Polling);
        assert!("telnet".parse::<TerminalMode>().is_err());
    }
}
