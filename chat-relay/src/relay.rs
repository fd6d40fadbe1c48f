use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    select,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    message::{self, ChatRecord, DEFAULT_MAX_FRAME_BYTES, Frame, LineCodec, Record},
    presence,
    registry::{DuplicatePolicy, RegisterError, Registry, SessionHandle, SessionId},
    routing::{self, RouteOutcome, SenderPolicy, TrustClaimedSender, VerifiedSender},
};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub duplicate_policy: DuplicatePolicy,
    pub verify_sender: bool,
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Reject,
            verify_sender: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new(config)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Returns an error only if
    /// the listener itself can no longer accept.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        tokio::pin!(shutdown);

        let result = loop {
            select! {
                _ = &mut shutdown => break Ok(()),
                accept_result = listener.accept() => {
                    if let Err(err) = handle_accept_result(accept_result, &state) {
                        break Err(err);
                    }
                }
            }
        };

        handle_shutdown(&state).await;
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Stops every connection, logged in or not. The registry is closed in the
/// same step so a login racing the shutdown cannot slip in afterwards.
async fn handle_shutdown(state: &RelayState) {
    info!("relay shutting down");
    state.shutdown.cancel();
    for handle in state.registry.lock().await.close() {
        handle.close();
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
) -> Result<()> {
    match result {
        Ok((stream, peer)) => {
            spawn_connection_handler(stream, peer, state);
            Ok(())
        }
        Err(err) if is_transient_accept_error(&err) => {
            warn!(error = ?err, "failed to accept connection");
            Ok(())
        }
        Err(err) => Err(err).context("listener can no longer accept connections"),
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    debug!(%peer, "connection accepted, awaiting login");
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(%peer, error = ?err, "connection closed with error");
        }
    });
}

struct RelayState {
    registry: Mutex<Registry>,
    sender_policy: Box<dyn SenderPolicy>,
    next_id: AtomicU64,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
}

impl RelayState {
    fn new(config: RelayConfig) -> Self {
        let sender_policy: Box<dyn SenderPolicy> = if config.verify_sender {
            Box::new(VerifiedSender)
        } else {
            Box::new(TrustClaimedSender)
        };

        Self {
            registry: Mutex::new(Registry::new(config.duplicate_policy)),
            sender_policy,
            next_id: AtomicU64::new(1),
            max_frame_bytes: config.max_frame_bytes,
            shutdown: CancellationToken::new(),
        }
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // Every registry change and its presence broadcast happen under one lock
    // acquisition, so clients see presence records in mutation order.

    async fn login(&self, nickname: String, handle: SessionHandle) -> Result<(), RegisterError> {
        let mut registry = self.registry.lock().await;
        if let Some(evicted) = registry.register(nickname, handle)? {
            evicted.close();
        }
        presence::announce(&registry);
        Ok(())
    }

    async fn logout(&self, nickname: &str, id: SessionId) -> bool {
        let mut registry = self.registry.lock().await;
        let removed = registry.unregister(nickname, id);
        if removed {
            presence::announce(&registry);
        }
        removed
    }

    async fn forward(&self, session: &str, chat: &ChatRecord, frame: Frame) -> RouteOutcome {
        let registry = self.registry.lock().await;
        routing::route(&registry, self.sender_policy.as_ref(), session, chat, frame)
    }
}

enum Phase {
    AwaitingLogin,
    Active { nickname: String },
}

type FrameStream = FramedRead<OwnedReadHalf, LineCodec>;

/// Drives one connection. Reading happens here; writing belongs to a separate
/// task that drains the session outbox, so a peer that stops reading only
/// grows its own backlog and never stalls this loop.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, LineCodec::new(state.max_frame_bytes));
    let sink = FramedWrite::new(writer, LineCodec::new(state.max_frame_bytes));
    let (outbox, inbox) = mpsc::unbounded_channel();
    let handle = SessionHandle::new(state.next_id(), outbox);
    let mut writer_task = tokio::spawn(async move {
        if let Err(err) = message::write_outbox(sink, inbox).await {
            debug!(%peer, error = %err, "failed to write to client");
        }
    });
    let mut phase = Phase::AwaitingLogin;

    let result = read_session(
        &state,
        &handle,
        &mut phase,
        &mut frames,
        &mut writer_task,
        peer,
    )
    .await;

    if let Phase::Active { nickname } = &phase {
        if state.logout(nickname, handle.id()).await {
            info!(%peer, %nickname, "user left");
        } else {
            debug!(%peer, %nickname, "session already replaced");
        }
    }

    // Once the registry lets go of its clone this is the last sender: the
    // writer flushes whatever is still queued and then closes the socket.
    drop(handle);
    result
}

async fn read_session(
    state: &RelayState,
    handle: &SessionHandle,
    phase: &mut Phase,
    frames: &mut FrameStream,
    writer_task: &mut JoinHandle<()>,
    peer: SocketAddr,
) -> Result<()> {
    loop {
        select! {
            frame = frames.next() => {
                match frame {
                    Some(frame) => {
                        let frame = frame.context("failed to read from client")?;
                        handle_frame(state, handle, phase, frame.freeze(), peer).await?;
                    }
                    None => break,
                }
            }
            _ = &mut *writer_task => {
                debug!(%peer, "session closed by relay");
                break;
            }
            _ = state.shutdown.cancelled() => break,
        }
    }

    Ok(())
}

async fn handle_frame(
    state: &RelayState,
    handle: &SessionHandle,
    phase: &mut Phase,
    frame: Frame,
    peer: SocketAddr,
) -> Result<()> {
    let record = match message::decode(&frame) {
        Ok(record) => record,
        Err(err) => {
            warn!(%peer, error = %err, "dropping malformed record");
            return Ok(());
        }
    };

    let next = match phase {
        Phase::AwaitingLogin => attempt_login(state, handle, record, peer)
            .await?
            .map(|nickname| Phase::Active { nickname }),
        Phase::Active { nickname } => {
            handle_active_record(state, nickname, record, frame, peer).await;
            None
        }
    };

    if let Some(next) = next {
        *phase = next;
    }
    Ok(())
}

async fn attempt_login(
    state: &RelayState,
    handle: &SessionHandle,
    record: Record,
    peer: SocketAddr,
) -> Result<Option<String>> {
    let nickname = match record {
        Record::Login { nickname } => nickname,
        other => {
            debug!(%peer, kind = other.kind(), "ignoring record received before login");
            return Ok(None);
        }
    };

    let nickname = nickname.trim().to_string();
    if nickname.is_empty() {
        reject_login(handle, "nickname cannot be empty".to_string())?;
        return Ok(None);
    }

    match state.login(nickname.clone(), handle.clone()).await {
        Ok(()) => {
            info!(%peer, %nickname, "user logged in");
            Ok(Some(nickname))
        }
        Err(err) => {
            warn!(%peer, %nickname, error = %err, "login rejected");
            reject_login(handle, err.to_string())?;
            Ok(None)
        }
    }
}

/// Queues the rejection on the session's own outbox, behind anything already
/// waiting there.
fn reject_login(handle: &SessionHandle, message: String) -> Result<()> {
    let frame = message::to_frame(&Record::Error { message })
        .context("failed to encode login rejection")?;
    if !handle.deliver(frame) {
        debug!(session = handle.id(), "writer gone before login rejection");
    }
    Ok(())
}

async fn handle_active_record(
    state: &RelayState,
    nickname: &str,
    record: Record,
    frame: Frame,
    peer: SocketAddr,
) {
    let chat = match record {
        Record::Chat(chat) => chat,
        other => {
            debug!(%peer, %nickname, kind = other.kind(), "ignoring record from active session");
            return;
        }
    };

    match state.forward(nickname, &chat, frame).await {
        RouteOutcome::Delivered => {
            info!(sender = %chat.sender, target = %chat.target, "chat forwarded");
        }
        RouteOutcome::Miss => {
            debug!(sender = %chat.sender, target = %chat.target, "chat target offline, dropping");
        }
        RouteOutcome::Refused => {
            warn!(
                %nickname,
                claimed = %chat.sender,
                target = %chat.target,
                "sender does not match session, dropping"
            );
        }
    }
}
