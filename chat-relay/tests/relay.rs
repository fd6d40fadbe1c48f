use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use chat_relay::{
    message::{ChatRecord, Content, LineCodec, Record, decode, to_frame},
    registry::DuplicatePolicy,
    relay::{Relay, RelayConfig},
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(300);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

struct TestRelay {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let relay = Relay::new(listener, config);

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            server,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }
}

struct TestClient {
    frames: FramedRead<OwnedReadHalf, LineCodec>,
    sink: FramedWrite<OwnedWriteHalf, LineCodec>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            frames: FramedRead::new(reader, LineCodec::default()),
            sink: FramedWrite::new(writer, LineCodec::default()),
        })
    }

    /// Connects, logs in and consumes the presence record that follows.
    async fn login(addr: SocketAddr, nickname: &str) -> Result<(Self, Vec<String>)> {
        let mut client = Self::connect(addr).await?;
        client
            .send(&Record::Login {
                nickname: nickname.to_string(),
            })
            .await?;
        let users = client.expect_userlist().await?;
        Ok((client, users))
    }

    async fn send(&mut self, record: &Record) -> Result<()> {
        self.sink.send(to_frame(record)?).await?;
        Ok(())
    }

    async fn send_raw(&mut self, frame: &[u8]) -> Result<()> {
        self.sink.send(Bytes::copy_from_slice(frame)).await?;
        Ok(())
    }

    async fn next_raw(&mut self) -> Result<Option<BytesMut>> {
        Ok(timeout(READ_TIMEOUT, self.frames.next()).await?.transpose()?)
    }

    async fn next_file(&mut self) -> Result<(String, Vec<u8>)> {
        let frame = timeout(TRANSFER_TIMEOUT, self.frames.next())
            .await?
            .ok_or_else(|| anyhow!("connection closed"))??;
        match decode(&frame)? {
            Record::Chat(ChatRecord {
                content: Content::File { name, bytes },
                ..
            }) => Ok((name, bytes)),
            other => Err(anyhow!("expected file record, got {other:?}")),
        }
    }

    async fn next(&mut self) -> Result<Record> {
        let frame = self
            .next_raw()
            .await?
            .ok_or_else(|| anyhow!("connection closed"))?;
        Ok(decode(&frame)?)
    }

    async fn expect_userlist(&mut self) -> Result<Vec<String>> {
        match self.next().await? {
            Record::UserList { users } => Ok(users),
            other => Err(anyhow!("expected userlist, got {other:?}")),
        }
    }

    async fn expect_silence(&mut self) {
        let result = timeout(SILENCE, self.frames.next()).await;
        assert!(result.is_err(), "expected no record, got {result:?}");
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn presence_chat_and_departure() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;

    let (mut alice, users) = TestClient::login(relay.addr, "alice").await?;
    assert_eq!(users, names(&["alice"]));

    let (mut bob, users) = TestClient::login(relay.addr, "bob").await?;
    assert_eq!(users, names(&["alice", "bob"]));
    assert_eq!(alice.expect_userlist().await?, names(&["alice", "bob"]));

    let chat = Record::Chat(ChatRecord::text("alice", "bob", "hi"));
    alice.send(&chat).await?;
    assert_eq!(bob.next().await?, chat);

    // The sender gets no echo of its own message.
    alice.expect_silence().await;

    bob.sink.close().await?;
    drop(bob);
    assert_eq!(alice.expect_userlist().await?, names(&["alice"]));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn file_attachments_arrive_byte_for_byte() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    alice.expect_userlist().await?;

    let large: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i * 7 % 256) as u8).collect();
    for payload in [vec![0x89], large] {
        let sent = ChatRecord::file("alice", "bob", "x.png", payload.clone());
        alice.send(&Record::Chat(sent)).await?;

        let (name, bytes) = bob.next_file().await?;
        assert_eq!(name, "x.png");
        assert_eq!(bytes, payload);
    }

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn crossing_uploads_do_not_stall_each_other() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    alice.expect_userlist().await?;

    let for_bob: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let for_alice: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 241) as u8).collect();

    // Neither side reads while uploading, so the relay is still writing the
    // first file to bob when bob's own upload arrives.
    let to_bob = Record::Chat(ChatRecord::file("alice", "bob", "a.bin", for_bob.clone()));
    timeout(TRANSFER_TIMEOUT, alice.send(&to_bob)).await??;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let to_alice = Record::Chat(ChatRecord::file("bob", "alice", "b.bin", for_alice.clone()));
    timeout(TRANSFER_TIMEOUT, bob.send(&to_alice)).await??;

    assert_eq!(bob.next_file().await?, ("a.bin".to_string(), for_bob));
    assert_eq!(alice.next_file().await?, ("b.bin".to_string(), for_alice));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn forwarding_is_verbatim() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    alice.expect_userlist().await?;

    let raw = br#"{"target":"bob","content":"hi","sender":"alice","type":"chat","sentAt":"12:00:00"}"#;
    alice.send_raw(raw).await?;

    assert_eq!(bob.next_raw().await?.as_deref(), Some(raw.as_slice()));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_target_is_dropped_silently() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;

    alice
        .send(&Record::Chat(ChatRecord::text("alice", "carol", "anyone?")))
        .await?;
    alice.expect_silence().await;

    // Still connected: the next thing alice hears is bob arriving.
    let (_bob, _) = TestClient::login(relay.addr, "bob").await?;
    assert_eq!(alice.expect_userlist().await?, names(&["alice", "bob"]));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_nickname_is_rejected_and_retry_allowed() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;

    let mut imposter = TestClient::connect(relay.addr).await?;
    imposter
        .send(&Record::Login {
            nickname: "alice".into(),
        })
        .await?;
    match imposter.next().await? {
        Record::Error { message } => assert!(message.contains("alice"), "{message}"),
        other => panic!("expected error record, got {other:?}"),
    }
    alice.expect_silence().await;

    imposter
        .send(&Record::Login {
            nickname: "alice2".into(),
        })
        .await?;
    assert_eq!(imposter.expect_userlist().await?, names(&["alice", "alice2"]));
    assert_eq!(alice.expect_userlist().await?, names(&["alice", "alice2"]));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn empty_nickname_is_rejected() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut client = TestClient::connect(relay.addr).await?;

    client
        .send(&Record::Login {
            nickname: "   ".into(),
        })
        .await?;
    assert!(matches!(client.next().await?, Record::Error { .. }));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn eviction_replaces_the_old_session() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        duplicate_policy: DuplicatePolicy::Evict,
        ..RelayConfig::default()
    })
    .await?;

    let (mut old, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut fresh, users) = TestClient::login(relay.addr, "alice").await?;
    assert_eq!(users, names(&["alice"]));
    assert!(old.next_raw().await?.is_none(), "old session should be closed");

    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    assert_eq!(fresh.expect_userlist().await?, names(&["alice", "bob"]));

    let chat = Record::Chat(ChatRecord::text("bob", "alice", "which one are you?"));
    bob.send(&chat).await?;
    assert_eq!(fresh.next().await?, chat);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_records_keep_the_connection_open() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    alice.expect_userlist().await?;

    alice.send_raw(b"this is not json").await?;
    alice
        .send_raw(br#"{"type":"chat","sender":"alice","target":"bob"}"#)
        .await?;
    alice.send_raw(br#"{"type":"teleport"}"#).await?;

    let chat = Record::Chat(ChatRecord::text("alice", "bob", "still here"));
    alice.send(&chat).await?;
    assert_eq!(bob.next().await?, chat);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn records_before_login_are_ignored() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;

    let mut alice = TestClient::connect(relay.addr).await?;
    alice
        .send(&Record::Chat(ChatRecord::text("alice", "bob", "too early")))
        .await?;
    alice
        .send(&Record::Login {
            nickname: "alice".into(),
        })
        .await?;

    assert_eq!(alice.expect_userlist().await?, names(&["alice", "bob"]));
    assert_eq!(bob.expect_userlist().await?, names(&["alice", "bob"]));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn claimed_sender_is_trusted_by_default() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    alice.expect_userlist().await?;

    let spoofed = Record::Chat(ChatRecord::text("mallory", "bob", "guess who"));
    alice.send(&spoofed).await?;
    assert_eq!(bob.next().await?, spoofed);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn verifying_relay_drops_spoofed_sender() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        verify_sender: true,
        ..RelayConfig::default()
    })
    .await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    alice.expect_userlist().await?;

    alice
        .send(&Record::Chat(ChatRecord::text("mallory", "bob", "guess who")))
        .await?;
    bob.expect_silence().await;

    let honest = Record::Chat(ChatRecord::text("alice", "bob", "it's me"));
    alice.send(&honest).await?;
    assert_eq!(bob.next().await?, honest);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn oversized_frame_closes_only_that_connection() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        max_frame_bytes: 256,
        ..RelayConfig::default()
    })
    .await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;
    let (mut bob, _) = TestClient::login(relay.addr, "bob").await?;
    alice.expect_userlist().await?;

    bob.send_raw(&[b'x'; 1024]).await?;
    // Closed either cleanly or with a reset, depending on unread bytes.
    assert!(!matches!(bob.next_raw().await, Ok(Some(_))));
    assert_eq!(alice.expect_userlist().await?, names(&["alice"]));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_registered_sessions() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let (mut alice, _) = TestClient::login(relay.addr, "alice").await?;

    relay.stop().await;

    assert!(alice.next_raw().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_connections_awaiting_login() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut lurker = TestClient::connect(relay.addr).await?;

    // A rejected login proves the relay is serving this connection.
    lurker
        .send(&Record::Login {
            nickname: String::new(),
        })
        .await?;
    assert!(matches!(lurker.next().await?, Record::Error { .. }));

    relay.stop().await;

    assert!(lurker.next_raw().await?.is_none());
    Ok(())
}
