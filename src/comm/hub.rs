//! TCP hub: accept loop, identity handshake and frame routing.
//!
//! Every module holds one connection to the hub. Calls and replies are
//! routed by identity, events fan out to every other connection, and
//! presence changes are announced to everyone. The hub never inspects
//! call arguments or event payloads.

use super::codec::{read_frame, write_frame};
use super::wire::{Frame, Presence, Reject, Welcome};
use crate::types::{Identity, TransportConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

type Routes = Arc<RwLock<HashMap<Identity, mpsc::Sender<Frame>>>>;

/// Message broker for [`TcpComm`](super::TcpComm) clients.
#[derive(Debug)]
pub struct Hub {
    listener: TcpListener,
    config: TransportConfig,
    cancel: CancellationToken,
    routes: Routes,
}

impl Hub {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            cancel: CancellationToken::new(),
            routes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Identities currently connected.
    pub async fn connected(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self.routes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run the accept loop until cancelled or a fatal error occurs.
    pub async fn serve(&self) -> std::io::Result<()> {
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "Hub listening on {} (max_connections={})",
            self.local_addr()?,
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Hub shutting down");
                    break;
                }
                accept = self.listener.accept() => {
                    let (stream, peer) = accept?;

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(
                        "Hub connection from {} (active={})",
                        peer,
                        self.config.max_connections - conn_semaphore.available_permits(),
                    );
                    let routes = self.routes.clone();
                    let cancel = self.cancel.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, routes, cancel, config, permit).await {
                            tracing::warn!("Connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// Handshake, then route frames until the client leaves.
async fn handle_connection(
    stream: TcpStream,
    routes: Routes,
    cancel: CancellationToken,
    config: TransportConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let Some((identity, outbound_rx)) = handshake(&mut reader, &mut writer, &routes, &config).await?
    else {
        return Ok(());
    };
    tracing::info!("{} connected to hub", identity);

    let writer_cancel = cancel.child_token();
    let writer_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        writer_cancel.clone(),
        config.write_timeout,
    ));

    let result = route_frames(&identity, &mut reader, &routes, &cancel, &config).await;

    // Remove the route first so no frame is queued for a dead writer.
    let removed = routes.write().await.remove(&identity).is_some();
    writer_cancel.cancel();
    let _ = writer_task.await;
    if removed {
        broadcast(&routes, &identity, Frame::PeerLeft(Presence { identity: identity.clone() })).await;
    }
    tracing::info!("{} disconnected from hub", identity);
    result
}

/// Read `Hello`, claim the identity, answer `Welcome`.
///
/// Returns `None` when the client was refused.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    routes: &Routes,
    config: &TransportConfig,
) -> std::io::Result<Option<(Identity, mpsc::Receiver<Frame>)>> {
    let first = tokio::time::timeout(config.hello_timeout, read_frame(reader, config.max_frame_bytes)).await;
    let hello = match first {
        Err(_elapsed) => {
            tracing::debug!("No Hello within {:?}, dropping connection", config.hello_timeout);
            return Ok(None);
        }
        Ok(result) => match result? {
            None => return Ok(None),
            Some((msg_type, payload)) => match Frame::decode(msg_type, &payload) {
                Ok(Frame::Hello(hello)) if !hello.identity.is_empty() => hello,
                Ok(_) | Err(_) => {
                    send_direct(writer, &Frame::error("expected Hello with an identity"), config.write_timeout)
                        .await?;
                    return Ok(None);
                }
            },
        },
    };

    let (tx, rx) = mpsc::channel(config.outbound_queue);
    let peers = {
        let mut table = routes.write().await;
        if table.contains_key(&hello.identity) {
            drop(table);
            tracing::warn!("Refusing duplicate identity {}", hello.identity);
            send_direct(
                writer,
                &Frame::error(format!("identity {} is already connected", hello.identity)),
                config.write_timeout,
            )
            .await?;
            return Ok(None);
        }
        let mut peers: Vec<Identity> = table.keys().cloned().collect();
        peers.sort();
        table.insert(hello.identity.clone(), tx);
        peers
    };

    // Welcome goes out before the writer task starts, so it is always the
    // first frame the client sees.
    send_direct(writer, &Frame::Welcome(Welcome { peers }), config.write_timeout).await?;
    broadcast(
        routes,
        &hello.identity,
        Frame::PeerJoined(Presence {
            identity: hello.identity.clone(),
        }),
    )
    .await;
    Ok(Some((hello.identity, rx)))
}

async fn route_frames(
    identity: &Identity,
    reader: &mut OwnedReadHalf,
    routes: &Routes,
    cancel: &CancellationToken,
    config: &TransportConfig,
) -> std::io::Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(config.read_timeout, read_frame(reader, config.max_frame_bytes)) => {
                match read {
                    Err(_elapsed) => {
                        tracing::debug!("{} silent for {:?}, dropping connection", identity, config.read_timeout);
                        return Ok(());
                    }
                    Ok(result) => match result? {
                        Some(frame) => frame,
                        None => return Ok(()),
                    },
                }
            }
        };

        let (msg_type, payload) = frame;
        let frame = match Frame::decode(msg_type, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("{} sent an undecodable frame: {}", identity, e);
                send_to(routes, identity, Frame::error(e.to_string())).await;
                continue;
            }
        };

        match frame {
            Frame::Call(mut call) => {
                // The connection, not the payload, decides who the caller is.
                call.caller = identity.clone();
                let (id, target) = (call.id, call.target.clone());
                if !send_to(routes, &target, Frame::Call(call)).await {
                    let reason = format!("module {} is not connected or not accepting calls", target);
                    send_to(routes, identity, Frame::Reject(Reject { id, target, reason })).await;
                }
            }
            Frame::Reply(mut reply) => {
                reply.responder = identity.clone();
                let caller = reply.caller.clone();
                if !send_to(routes, &caller, Frame::Reply(reply)).await {
                    tracing::debug!("Reply from {} for departed caller {}", identity, caller);
                }
            }
            Frame::Event(event) => {
                broadcast(routes, identity, Frame::Event(event)).await;
            }
            Frame::Ping => {}
            other => {
                tracing::warn!("{} sent unexpected frame type 0x{:02X}", identity, other.msg_type());
                send_to(routes, identity, Frame::error("unexpected frame type")).await;
            }
        }
    }
}

/// Queue a frame for one connection. False if absent or its queue is full.
async fn send_to(routes: &Routes, target: &Identity, frame: Frame) -> bool {
    let table = routes.read().await;
    match table.get(target) {
        Some(tx) => tx.try_send(frame).is_ok(),
        None => false,
    }
}

/// Queue a frame for every connection except `origin`.
async fn broadcast(routes: &Routes, origin: &Identity, frame: Frame) {
    let table = routes.read().await;
    for (identity, tx) in table.iter() {
        if identity == origin {
            continue;
        }
        if tx.try_send(frame.clone()).is_err() {
            tracing::warn!("Outbound queue of {} full, dropping frame 0x{:02X}", identity, frame.msg_type());
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = send_direct(&mut writer, &frame, timeout).await {
            tracing::debug!("Hub write failed: {}", e);
            break;
        }
    }
}

/// Encode and write one frame with a timeout.
pub(crate) async fn send_direct<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
    timeout: Duration,
) -> std::io::Result<()> {
    let (msg_type, payload) = frame.encode().map_err(|e| {
        tracing::error!("Frame encoding failed: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })?;
    timed_write(writer, msg_type, &payload, timeout).await
}

/// Write a frame with a timeout. Slow consumers are dropped.
async fn timed_write<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, msg_type, payload))
        .await
        .map_err(|_| {
            tracing::warn!("Write timeout ({:?}), dropping connection", timeout);
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::codec::{MSG_ERROR, MSG_WELCOME};
    use crate::comm::wire::{Hello, Reply, PROTOCOL_VERSION};
    use crate::comm::{Call, CallResult};

    async fn start_hub() -> (SocketAddr, CancellationToken) {
        let hub = Hub::bind("127.0.0.1:0".parse().unwrap(), TransportConfig::default())
            .await
            .unwrap();
        let addr = hub.local_addr().unwrap();
        let token = hub.shutdown_token();
        tokio::spawn(async move {
            let _ = hub.serve().await;
        });
        (addr, token)
    }

    async fn send(stream: &mut TcpStream, frame: Frame) {
        let (msg_type, payload) = frame.encode().unwrap();
        write_frame(stream, msg_type, &payload).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Frame {
        let (msg_type, payload) = read_frame(stream, 1 << 20).await.unwrap().unwrap();
        Frame::decode(msg_type, &payload).unwrap()
    }

    async fn join(addr: SocketAddr, name: &str) -> (TcpStream, Vec<Identity>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            Frame::Hello(Hello {
                identity: Identity::parse(name).unwrap(),
                protocol: PROTOCOL_VERSION,
            }),
        )
        .await;
        match recv(&mut stream).await {
            Frame::Welcome(welcome) => (stream, welcome.peers),
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_welcome_lists_existing_peers() {
        let (addr, token) = start_hub().await;
        let (mut first, peers) = join(addr, "telescope").await;
        assert!(peers.is_empty());

        let (_second, peers) = join(addr, "camera").await;
        assert_eq!(peers, vec![Identity::parse("telescope").unwrap()]);

        match recv(&mut first).await {
            Frame::PeerJoined(p) => assert_eq!(p.identity.as_str(), "camera"),
            other => panic!("unexpected {other:?}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_identity_gets_error_frame() {
        let (addr, token) = start_hub().await;
        let (_first, _) = join(addr, "dome").await;

        let mut dup = TcpStream::connect(addr).await.unwrap();
        send(
            &mut dup,
            Frame::Hello(Hello {
                identity: Identity::parse("dome").unwrap(),
                protocol: PROTOCOL_VERSION,
            }),
        )
        .await;
        let (msg_type, _) = read_frame(&mut dup, 1 << 20).await.unwrap().unwrap();
        assert_eq!(msg_type, MSG_ERROR);
        assert_ne!(msg_type, MSG_WELCOME);
        token.cancel();
    }

    #[tokio::test]
    async fn test_call_to_absent_target_is_rejected() {
        let (addr, token) = start_hub().await;
        let (mut caller, _) = join(addr, "scheduler").await;

        send(
            &mut caller,
            Frame::Call(Call {
                id: 9,
                caller: Identity::parse("scheduler").unwrap(),
                target: Identity::parse("ghost").unwrap(),
                method: "get_state".into(),
                args: vec![],
                deadline_ms: 1000,
            }),
        )
        .await;
        match recv(&mut caller).await {
            Frame::Reject(reject) => {
                assert_eq!(reject.id, 9);
                assert_eq!(reject.target.as_str(), "ghost");
            }
            other => panic!("unexpected {other:?}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_caller_identity_is_enforced() {
        let (addr, token) = start_hub().await;
        let (mut target, _) = join(addr, "camera").await;
        let (mut caller, _) = join(addr, "scheduler").await;
        let _ = recv(&mut target).await; // PeerJoined(scheduler)

        send(
            &mut caller,
            Frame::Call(Call {
                id: 1,
                caller: Identity::parse("impostor").unwrap(),
                target: Identity::parse("camera").unwrap(),
                method: "abort".into(),
                args: vec![],
                deadline_ms: 1000,
            }),
        )
        .await;
        match recv(&mut target).await {
            Frame::Call(call) => assert_eq!(call.caller.as_str(), "scheduler"),
            other => panic!("unexpected {other:?}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_reply_responder_is_enforced() {
        let (addr, token) = start_hub().await;
        let (mut caller, _) = join(addr, "scheduler").await;
        let (mut forger, _) = join(addr, "impostor").await;
        let _ = recv(&mut caller).await; // PeerJoined(impostor)

        send(
            &mut forger,
            Frame::Reply(Reply {
                id: 1,
                caller: Identity::parse("scheduler").unwrap(),
                responder: Identity::parse("camera").unwrap(),
                result: CallResult::Success(serde_json::json!("forged")),
            }),
        )
        .await;
        match recv(&mut caller).await {
            Frame::Reply(reply) => assert_eq!(reply.responder.as_str(), "impostor"),
            other => panic!("unexpected {other:?}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_departure_is_announced() {
        let (addr, token) = start_hub().await;
        let (mut stays, _) = join(addr, "weather").await;
        let (leaves, _) = join(addr, "roof").await;
        let _ = recv(&mut stays).await; // PeerJoined(roof)

        drop(leaves);
        match recv(&mut stays).await {
            Frame::PeerLeft(p) => assert_eq!(p.identity.as_str(), "roof"),
            other => panic!("unexpected {other:?}"),
        }
        token.cancel();
    }
}
