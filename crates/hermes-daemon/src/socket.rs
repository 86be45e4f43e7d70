/// Length-prefixed JSON over TCP for remote controls and UIs.
///
/// Each client gets a `Hello` with the current snapshot on connect, then
/// every `BroadcastMessage` as it happens.  Commands go to `DaemonCore`;
/// `GetState` is answered directly from the board.
use crate::bridge::NowPlayingBoard;
use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use hermes_proto::protocol::{Broadcast, Command, Frame, Message, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    board: NowPlayingBoard,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let connected = Arc::new(AtomicUsize::new(0));
        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    let count = connected.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Client {} connected from {} ({} connected)", id, peer, count);

                    let board = board.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    let connected = connected.clone();

                    tokio::spawn(async move {
                        handle_client(stream, board, id, evt_tx, bcast_rx).await;
                        let count = connected.fetch_sub(1, Ordering::SeqCst) - 1;
                        info!("Client {} disconnected ({} connected)", id, count);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    board: NowPlayingBoard,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&board).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let (message, consumed) = match Message::next_frame(&read_buf) {
                                Ok(Frame::Partial) => break,
                                Ok(Frame::Complete { message, consumed }) => (message, consumed),
                                Err(e) => {
                                    warn!("Client {} sent an unreadable stream: {}", client_id, e);
                                    let _ = send_error(&mut write_half, e.to_string()).await;
                                    return;
                                }
                            };
                            read_buf.drain(..consumed);

                            match message {
                                Ok(Message::Command(Command::GetState)) => {
                                    if let Ok(encoded) = encode_state(&board).await {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok(Message::Command(cmd)) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("Client {} sent a bad frame: {}", client_id, e);
                                    let message = format!("bad frame: {}", e);
                                    if send_error(&mut write_half, message).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::State(data)) => Broadcast::State { data },
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Ok(BroadcastMessage::Error(message)) => Broadcast::Error { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::State { data: board.snapshot().await }
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn send_error(write_half: &mut OwnedWriteHalf, message: String) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(Broadcast::Error { message }).encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}

async fn encode_hello(board: &NowPlayingBoard) -> anyhow::Result<Vec<u8>> {
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: board.snapshot().await,
    })
    .encode()
}

async fn encode_state(board: &NowPlayingBoard) -> anyhow::Result<Vec<u8>> {
    Message::Broadcast(Broadcast::State {
        data: board.snapshot().await,
    })
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_proto::protocol::{NowPlaying, TransportState};
    use std::time::Duration;

    struct Client {
        stream: TcpStream,
        buf: Vec<u8>,
    }

    impl Client {
        async fn recv(&mut self) -> Broadcast {
            let mut tmp = [0u8; 4096];
            loop {
                if let Ok((msg, consumed)) = Message::decode(&self.buf) {
                    self.buf.drain(..consumed);
                    match msg {
                        Message::Broadcast(b) => return b,
                        other => panic!("unexpected {:?}", other),
                    }
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut tmp))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "server closed the connection");
                self.buf.extend_from_slice(&tmp[..n]);
            }
        }

        async fn send(&mut self, cmd: Command) {
            let encoded = Message::Command(cmd).encode().unwrap();
            self.stream.write_all(&encoded).await.unwrap();
        }
    }

    async fn connect(
        board: NowPlayingBoard,
    ) -> (
        Client,
        mpsc::Receiver<DaemonEvent>,
        broadcast::Sender<BroadcastMessage>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (event_tx, event_rx) = mpsc::channel(8);
        let (bcast_tx, _) = broadcast::channel(16);
        let bcast_rx = bcast_tx.subscribe();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream, board, 1, event_tx, bcast_rx).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = Client {
            stream,
            buf: Vec::new(),
        };
        (client, event_rx, bcast_tx)
    }

    #[tokio::test]
    async fn test_hello_then_get_state() {
        let board = NowPlayingBoard::new(NowPlaying {
            rev: 7,
            volume: 40,
            ..Default::default()
        });
        let (mut client, _events, _bcast) = connect(board).await;

        match client.recv().await {
            Broadcast::Hello {
                protocol_version,
                state,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.rev, 7);
                assert_eq!(state.volume, 40);
            }
            other => panic!("expected Hello, got {:?}", other),
        }

        client.send(Command::GetState).await;
        assert!(matches!(client.recv().await, Broadcast::State { data } if data.rev == 7));
    }

    #[tokio::test]
    async fn test_commands_reach_the_core() {
        let (mut client, mut events, _bcast) = connect(NowPlayingBoard::default()).await;
        client.recv().await;

        client.send(Command::Like).await;
        client.send(Command::Volume { value: 20 }).await;

        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(DaemonEvent::ClientCommand(Command::Like))
        ));
        let second = events.recv().await;
        assert!(matches!(
            second,
            Some(DaemonEvent::ClientCommand(Command::Volume { value: 20 }))
        ));
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_stall_the_client() {
        let (mut client, mut events, _bcast) = connect(NowPlayingBoard::default()).await;
        client.recv().await;

        let garbage = b"{\"command\":\"nonsense\"";
        let mut frame = (garbage.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(garbage);
        client.stream.write_all(&frame).await.unwrap();
        client.send(Command::Like).await;

        assert!(matches!(
            client.recv().await,
            Broadcast::Error { message } if message.starts_with("bad frame")
        ));
        let next = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert!(matches!(
            next,
            Some(DaemonEvent::ClientCommand(Command::Like))
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_closes_the_connection() {
        let (mut client, mut events, _bcast) = connect(NowPlayingBoard::default()).await;
        client.recv().await;

        client.stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(client.recv().await, Broadcast::Error { .. }));

        let mut tmp = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.stream.read(&mut tmp))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        // handle_client returned, so the core sender is gone
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcasts_are_forwarded() {
        let (mut client, _events, bcast) = connect(NowPlayingBoard::default()).await;
        client.recv().await;

        let now = NowPlaying {
            rev: 3,
            state: TransportState::Playing,
            ..Default::default()
        };
        bcast.send(BroadcastMessage::State(now)).unwrap();
        bcast
            .send(BroadcastMessage::Error("station stopped".into()))
            .unwrap();

        assert!(matches!(
            client.recv().await,
            Broadcast::State { data } if data.state == TransportState::Playing
        ));
        assert!(matches!(
            client.recv().await,
            Broadcast::Error { message } if message == "station stopped"
        ));
    }
}
