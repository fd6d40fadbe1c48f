use std::io;

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWrite, sync::mpsc};
use tokio_util::codec::{Decoder, Encoder, FramedWrite};

/// Upper bound on a single frame. A 10 MB attachment inflates to ~13.4 MB once
/// base64 encoded, so the default leaves plenty of headroom.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// One encoded record, without its newline terminator. Cheap to clone, so a
/// single presence frame can be queued for every session without copying.
pub type Frame = Bytes;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Login {
        nickname: String,
    },
    Chat(ChatRecord),
    #[serde(rename = "userlist")]
    UserList {
        users: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Login { .. } => "login",
            Record::Chat(_) => "chat",
            Record::UserList { .. } => "userlist",
            Record::Error { .. } => "error",
        }
    }
}

/// A one-to-one message. On the wire the payload is spread over optional
/// `content` / `fileName` / `fileContent` fields; here it is a single
/// [`Content`] so a record can never be half text and half file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "WireChat", into = "WireChat")]
pub struct ChatRecord {
    pub sender: String,
    pub target: String,
    pub content: Content,
}

impl ChatRecord {
    pub fn text(
        sender: impl Into<String>,
        target: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            target: target.into(),
            content: Content::Text(text.into()),
        }
    }

    pub fn file(
        sender: impl Into<String>,
        target: impl Into<String>,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            sender: sender.into(),
            target: target.into(),
            content: Content::File {
                name: name.into(),
                bytes,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    File { name: String, bytes: Vec<u8> },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChat {
    sender: String,
    target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_content: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum ChatShapeError {
    #[error("chat record carries neither content nor a file")]
    Empty,
    #[error("chat record has fileContent but no fileName")]
    MissingFileName,
    #[error("fileContent is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl TryFrom<WireChat> for ChatRecord {
    type Error = ChatShapeError;

    fn try_from(wire: WireChat) -> Result<Self, Self::Error> {
        // A file payload wins if both shapes are present, matching how
        // receiving clients have always inspected the record.
        let content = match (wire.file_content, wire.file_name, wire.content) {
            (Some(encoded), Some(name), _) => Content::File {
                name,
                bytes: STANDARD.decode(encoded)?,
            },
            (Some(_), None, _) => return Err(ChatShapeError::MissingFileName),
            (None, _, Some(text)) => Content::Text(text),
            (None, _, None) => return Err(ChatShapeError::Empty),
        };

        Ok(Self {
            sender: wire.sender,
            target: wire.target,
            content,
        })
    }
}

impl From<ChatRecord> for WireChat {
    fn from(chat: ChatRecord) -> Self {
        let (content, file_name, file_content) = match chat.content {
            Content::Text(text) => (Some(text), None, None),
            Content::File { name, bytes } => (None, Some(name), Some(STANDARD.encode(bytes))),
        };

        Self {
            sender: chat.sender,
            target: chat.target,
            content,
            file_name,
            file_content,
        }
    }
}

/// Received bytes did not parse as a known record.
#[derive(Debug, thiserror::Error)]
#[error("malformed record: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

pub fn decode(bytes: &[u8]) -> Result<Record, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode(record: &Record) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

/// Wraps an encoded record for sending.
pub fn to_frame(record: &Record) -> serde_json::Result<Frame> {
    encode(record).map(Frame::from)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds the {limit} byte limit")]
    TooLong { limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Newline framing for records.
///
/// Compact JSON never contains a raw newline, so one line is exactly one
/// record no matter how TCP segments the stream. Blank lines are skipped and a
/// trailing `\r` is tolerated. Lines are returned as raw bytes: whether they
/// decode as a record is the caller's business, and a bad record must not end
/// the stream. Only an over-long line does.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_len: usize,
    // Bytes already searched for a newline, so a large frame arriving in
    // many segments is not rescanned from the start each time.
    scanned: usize,
}

impl LineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
        }
    }

    fn too_long(&self) -> FrameError {
        FrameError::TooLong {
            limit: self.max_len,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn trim_line(mut line: BytesMut) -> BytesMut {
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.truncate(line.len() - 1);
    }
    line
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.scanned..].iter().position(|byte| *byte == b'\n');
            let Some(offset) = newline else {
                // One spare byte for a `\r` whose `\n` has not arrived yet.
                if src.len() > self.max_len + 1 {
                    return Err(self.too_long());
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let line = trim_line(src.split_to(self.scanned + offset + 1));
            self.scanned = 0;

            if line.len() > self.max_len {
                return Err(self.too_long());
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        // Unterminated tail left by a peer that closed right after writing.
        self.scanned = 0;
        let tail = trim_line(src.split());
        if tail.iter().all(u8::is_ascii_whitespace) {
            Ok(None)
        } else {
            Ok(Some(tail))
        }
    }
}

impl Encoder<Frame> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(frame.len() + 1);
        dst.put_slice(&frame);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Work queued for the task that owns a connection's write half.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close,
}

/// Writes queued frames until told to close or until every sender is gone,
/// then shuts the write half down. This task is the only writer on the
/// socket, so a slow peer stalls its own queue and nothing else.
pub async fn write_outbox<W>(
    mut sink: FramedWrite<W, LineCodec>,
    mut outbox: mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(Outbound::Frame(frame)) = outbox.recv().await {
        sink.send(frame).await?;
    }
    sink.close().await
}
