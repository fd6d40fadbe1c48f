use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{TcpStream, tcp::OwnedReadHalf},
    select,
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{self, ChatRecord, Content, Frame, LineCodec, Outbound, Record, decode},
};

/// The transport could not be established. Never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not connect to {addr}: {source}")]
    Failed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {timeout:?} connecting to {addr}")]
    TimedOut { addr: SocketAddr, timeout: Duration },
}

pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ConnectError> {
    connect_with(addr, timeout, TcpStream::connect(addr)).await
}

/// Waits at most `timeout` for `dial` to produce a connection to `addr`.
pub async fn connect_with<S, F>(
    addr: SocketAddr,
    timeout: Duration,
    dial: F,
) -> Result<S, ConnectError>
where
    F: Future<Output = io::Result<S>>,
{
    match tokio::time::timeout(timeout, dial).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ConnectError::Failed { addr, source }),
        Err(_) => Err(ConnectError::TimedOut { addr, timeout }),
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let timeout = Duration::from_millis(args.connect_timeout_ms);
    let stream = connect(args.server, timeout).await?;
    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, LineCodec::new(args.max_frame_bytes));
    let sink = FramedWrite::new(writer, LineCodec::new(args.max_frame_bytes));
    let (outbox, inbox) = mpsc::unbounded_channel();
    // Uploads go through their own task so incoming records keep being read
    // while a large file is still on its way out.
    let writer_task = tokio::spawn(message::write_outbox(sink, inbox));

    let mut session = ClientSession::new(
        args.nickname,
        args.downloads,
        outbox,
        args.max_frame_bytes,
    );
    session
        .send(Record::Login {
            nickname: session.nickname.clone(),
        })
        .context("failed to send login")?;
    write_stdout(&format!(
        "*** connected to {} as {}",
        args.server, session.nickname
    ))
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let result = run_client_loop(&mut session, &mut frames, &mut stdin).await;

    // Dropping the last sender lets the writer flush and close the socket.
    drop(session);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%error, "connection closed while sending"),
        Err(error) => warn!(%error, "client writer task failed"),
    }

    result
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("{size} bytes once encoded, the relay accepts at most {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection to the relay is closed")]
    Disconnected,
}

/// What the terminal user is doing: who they are, who they are talking to,
/// and the last presence list the server sent.
struct ClientSession {
    nickname: String,
    target: Option<String>,
    online: Vec<String>,
    downloads: Option<PathBuf>,
    outbox: mpsc::UnboundedSender<Outbound>,
    max_frame_bytes: usize,
}

impl ClientSession {
    fn new(
        nickname: String,
        downloads: Option<PathBuf>,
        outbox: mpsc::UnboundedSender<Outbound>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            nickname,
            target: None,
            online: Vec::new(),
            downloads,
            outbox,
            max_frame_bytes,
        }
    }

    /// Queues a record for the writer task. A record the relay would cut the
    /// connection over is refused here instead.
    fn send(&self, record: Record) -> Result<(), SendError> {
        let frame: Frame = message::to_frame(&record)?;
        if frame.len() > self.max_frame_bytes {
            return Err(SendError::TooLarge {
                size: frame.len(),
                limit: self.max_frame_bytes,
            });
        }
        self.outbox
            .send(Outbound::Frame(frame))
            .map_err(|_| SendError::Disconnected)
    }
}

async fn run_client_loop(
    session: &mut ClientSession,
    frames: &mut FramedRead<OwnedReadHalf, LineCodec>,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    loop {
        select! {
            frame = frames.next() => {
                let frame = frame.transpose().context("failed to read from relay")?;
                if !handle_server_frame(session, frame).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_stdin_input(session, &line).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(session: &mut ClientSession, frame: Option<BytesMut>) -> Result<bool> {
    let Some(frame) = frame else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    match decode(&frame) {
        Ok(record) => render_server_record(session, record).await?,
        Err(error) => warn!(%error, "ignoring record from server"),
    }
    Ok(true)
}

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    To(String),
    File(PathBuf),
    Who,
    Quit,
    Text(String),
    Empty,
}

impl Input {
    /// Parses one line of terminal input.
    ///
    /// `/to <nickname>`, `/file <path>`, `/who` and `/quit` are commands
    /// (case-insensitive); anything else is text for the current target.
    pub fn parse(line: &str) -> Result<Self> {
        let text = line.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return Ok(Input::Empty);
        }
        if !text.starts_with('/') {
            return Ok(Input::Text(text.to_string()));
        }

        let (command, argument) = match text.split_once(char::is_whitespace) {
            Some((command, argument)) => (command, argument.trim()),
            None => (text, ""),
        };

        match (command.to_lowercase().as_str(), argument.is_empty()) {
            ("/quit", _) => Ok(Input::Quit),
            ("/who", _) => Ok(Input::Who),
            ("/to", false) => Ok(Input::To(argument.to_string())),
            ("/file", false) => Ok(Input::File(PathBuf::from(argument))),
            ("/to", true) => Err(anyhow!("usage: /to <nickname>")),
            ("/file", true) => Err(anyhow!("usage: /file <path>")),
            _ => Err(anyhow!(
                "unknown command. Try: /to <nickname>, /file <path>, /who, /quit"
            )),
        }
    }
}

async fn handle_stdin_input(session: &mut ClientSession, line: &str) -> Result<bool> {
    let input = match Input::parse(line) {
        Ok(input) => input,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    match input {
        Input::Empty => {}
        Input::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Input::Who => write_stdout(&render_online(&session.online)).await?,
        Input::To(target) => {
            write_stdout(&format!("*** chatting with {target}")).await?;
            session.target = Some(target);
        }
        Input::Text(text) => {
            let Some(target) = current_target(session).await? else {
                return Ok(true);
            };
            let chat = ChatRecord::text(&session.nickname, &target, &text);
            session.send(Record::Chat(chat))?;
            write_stdout(&format!("-> {target}: {text}")).await?;
        }
        Input::File(path) => {
            let Some(target) = current_target(session).await? else {
                return Ok(true);
            };
            send_file(session, &target, &path).await?;
        }
    }
    Ok(true)
}

async fn current_target(session: &ClientSession) -> io::Result<Option<String>> {
    if session.target.is_none() {
        write_stderr("!!! pick someone to talk to first with /to <nickname>").await?;
    }
    Ok(session.target.clone())
}

async fn send_file(session: &ClientSession, target: &str, path: &Path) -> Result<()> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            write_stderr(&format!("!!! cannot read {}: {err}", path.display())).await?;
            return Ok(());
        }
    };
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let chat = ChatRecord::file(&session.nickname, target, &name, bytes);
    match session.send(Record::Chat(chat)) {
        Ok(()) => write_stdout(&format!("*** sent file {name} to {target}")).await?,
        Err(err @ SendError::TooLarge { .. }) => {
            write_stderr(&format!("!!! {name} is too large to send: {err}")).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_server_record(session: &mut ClientSession, record: Record) -> Result<()> {
    match record {
        Record::UserList { users } => {
            session.online = users
                .into_iter()
                .filter(|user| *user != session.nickname)
                .collect();
            write_stdout(&render_online(&session.online)).await?;
        }
        Record::Chat(ChatRecord {
            sender, content, ..
        }) => match content {
            Content::Text(text) => write_stdout(&format!("<{sender}> {text}")).await?,
            Content::File { name, bytes } => {
                write_stdout(&format!(
                    "*** {sender} sent file {name} ({} bytes)",
                    bytes.len()
                ))
                .await?;
                if let Some(dir) = &session.downloads {
                    save_download(dir, &name, &bytes).await?;
                }
            }
        },
        Record::Error { message } => write_stderr(&format!("!!! {message}")).await?,
        Record::Login { .. } => {}
    }
    Ok(())
}

fn render_online(others: &[String]) -> String {
    if others.is_empty() {
        "*** online: nobody else".to_string()
    } else {
        format!("*** online: {}", others.join(", "))
    }
}

/// Keeps only the final path component so a sender cannot write outside
/// the download directory.
fn download_path(dir: &Path, name: &str) -> PathBuf {
    let file_name = Path::new(name)
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "download".into());
    dir.join(file_name)
}

async fn save_download(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let path = download_path(dir, name);
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => write_stdout(&format!("*** saved {}", path.display())).await,
        Err(err) => write_stderr(&format!("!!! cannot save {}: {err}", path.display())).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
