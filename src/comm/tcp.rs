//! TCP client transport talking to a [`Hub`](super::Hub).

use super::codec::read_frame;
use super::hub::send_direct;
use super::wire::{Frame, Hello, Reply, PROTOCOL_VERSION};
use super::{pump_inbound, Call, CallResult, Comm, Inbound, InboundMessage, PendingCalls};
use crate::events::Event;
use crate::types::{Error, Identity, Result, TransportConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

/// State shared between the comm handle and its connection tasks.
#[derive(Debug)]
struct Link {
    identity: Identity,
    pending: PendingCalls,
    epoch: AtomicU64,
    peers: RwLock<BTreeSet<Identity>>,
}

impl Link {
    fn set_peers(&self, peers: impl IntoIterator<Item = Identity>) {
        let mut set = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        set.clear();
        set.extend(peers);
    }

    fn update_peer(&self, identity: &Identity, present: bool) {
        let mut set = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if present {
            set.insert(identity.clone());
        } else {
            set.remove(identity);
        }
    }

    /// Tear down after the hub connection ended, at most once per session.
    fn connection_lost(&self, cancel: &CancellationToken, reason: &str) {
        if cancel.is_cancelled() {
            return;
        }
        cancel.cancel();
        let failed = self.pending.fail_all("connection lost");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_peers([]);
        tracing::warn!(
            "{} lost hub connection: {} ({} outstanding calls failed)",
            self.identity,
            reason,
            failed
        );
    }
}

#[derive(Debug)]
struct Session {
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    _guard: DropGuard,
}

/// Hub client.
#[derive(Debug)]
pub struct TcpComm {
    link: Arc<Link>,
    config: TransportConfig,
    session: Mutex<Option<Session>>,
}

impl TcpComm {
    pub fn new(identity: Identity, config: TransportConfig) -> Self {
        Self {
            link: Arc::new(Link {
                identity,
                pending: PendingCalls::new(),
                epoch: AtomicU64::new(0),
                peers: RwLock::new(BTreeSet::new()),
            }),
            config,
            session: Mutex::new(None),
        }
    }

    async fn outbound(&self) -> Result<mpsc::Sender<Frame>> {
        match &*self.session.lock().await {
            Some(session) if !session.cancel.is_cancelled() => Ok(session.outbound.clone()),
            _ => Err(Error::connection(format!(
                "{} is not connected to the hub",
                self.link.identity
            ))),
        }
    }

    /// Exchange Hello/Welcome on a fresh connection.
    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Vec<Identity>> {
        let hello = Frame::Hello(Hello {
            identity: self.link.identity.clone(),
            protocol: PROTOCOL_VERSION,
        });
        send_direct(writer, &hello, self.config.write_timeout).await?;

        let answer = tokio::time::timeout(
            self.config.hello_timeout,
            read_frame(reader, self.config.max_frame_bytes),
        )
        .await
        .map_err(|_| Error::connection("hub did not answer Hello"))??;
        let Some((msg_type, payload)) = answer else {
            return Err(Error::connection("hub closed the connection during handshake"));
        };
        match Frame::decode(msg_type, &payload)? {
            Frame::Welcome(welcome) => Ok(welcome.peers),
            Frame::Error(e) => Err(Error::connection(e.message)),
            other => Err(Error::connection(format!(
                "unexpected handshake frame 0x{:02X}",
                other.msg_type()
            ))),
        }
    }
}

#[async_trait]
impl Comm for TcpComm {
    fn identity(&self) -> Identity {
        self.link.identity.clone()
    }

    fn epoch(&self) -> u64 {
        self.link.epoch.load(Ordering::SeqCst)
    }

    async fn connect(&self, inbound: Arc<dyn Inbound>) -> Result<()> {
        let mut session = self.session.lock().await;
        if matches!(&*session, Some(s) if !s.cancel.is_cancelled()) {
            return Err(Error::connection(format!(
                "{} is already connected",
                self.link.identity
            )));
        }

        let addr = &self.config.hub_addr;
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::connection(format!("connecting to hub {} timed out", addr)))?
            .map_err(|e| Error::connection(format!("connecting to hub {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let peers = self.handshake(&mut reader, &mut writer).await?;
        self.link.set_peers(peers);

        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(write_loop(
            writer,
            outbound_rx,
            cancel.clone(),
            self.link.clone(),
            self.config.clone(),
        ));
        {
            let cancel = cancel.clone();
            let inbound = inbound.clone();
            tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = pump_inbound(inbound, inbox_rx) => {}
                }
            });
        }
        tracker.spawn(read_loop(
            reader,
            ReadContext {
                link: self.link.clone(),
                inbound,
                outbound: outbound.clone(),
                inbox,
                cancel: cancel.clone(),
                max_frame_bytes: self.config.max_frame_bytes,
            },
        ));
        tracker.close();

        *session = Some(Session {
            outbound,
            cancel: cancel.clone(),
            tracker,
            _guard: cancel.drop_guard(),
        });
        self.link.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::info!("{} connected to hub {}", self.link.identity, addr);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session.cancel.cancel();
        if tokio::time::timeout(self.config.write_timeout, session.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("{} transport tasks did not stop in time", self.link.identity);
        }

        let failed = self.link.pending.fail_all("connection lost");
        self.link.epoch.fetch_add(1, Ordering::SeqCst);
        self.link.set_peers([]);
        tracing::info!(
            "{} disconnected from hub ({} outstanding calls failed)",
            self.link.identity,
            failed
        );
        Ok(())
    }

    async fn send_call(
        &self,
        target: &Identity,
        method: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<CallResult> {
        let outbound = self.outbound().await?;
        let pending = self.link.pending.register(target);
        let call = Call {
            id: pending.id(),
            caller: self.link.identity.clone(),
            target: target.clone(),
            method: method.to_string(),
            args,
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        };
        tracing::debug!("call {} -> {}.{}", call.id, target, method);
        outbound
            .send(Frame::Call(call))
            .await
            .map_err(|_| Error::connection_lost(target.as_str()))?;
        pending.wait(deadline).await
    }

    async fn publish_event(&self, event: &Event) -> Result<()> {
        self.outbound()
            .await?
            .send(Frame::Event(event.clone()))
            .await
            .map_err(|_| Error::connection("hub connection closed"))
    }

    async fn peers(&self) -> Vec<Identity> {
        self.link
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

// =============================================================================
// Connection tasks
// =============================================================================

struct ReadContext {
    link: Arc<Link>,
    inbound: Arc<dyn Inbound>,
    outbound: mpsc::Sender<Frame>,
    inbox: mpsc::UnboundedSender<InboundMessage>,
    cancel: CancellationToken,
    max_frame_bytes: u32,
}

async fn read_loop(mut reader: OwnedReadHalf, ctx: ReadContext) {
    loop {
        let read = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            read = read_frame(&mut reader, ctx.max_frame_bytes) => read,
        };
        let (msg_type, payload) = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => return ctx.link.connection_lost(&ctx.cancel, "hub closed the connection"),
            Err(e) => return ctx.link.connection_lost(&ctx.cancel, &e.to_string()),
        };
        match Frame::decode(msg_type, &payload) {
            Ok(frame) => handle_frame(&ctx, frame),
            Err(e) => tracing::warn!("{} received an undecodable frame: {}", ctx.link.identity, e),
        }
    }
}

fn handle_frame(ctx: &ReadContext, frame: Frame) {
    match frame {
        Frame::Reply(reply) => {
            ctx.link
                .pending
                .complete_from(reply.id, &reply.responder, Ok(reply.result));
        }
        Frame::Reject(reject) => {
            ctx.link
                .pending
                .complete(reject.id, Err(Error::remote(reject.target.as_str(), reject.reason)));
        }
        Frame::Call(call) => {
            let inbound = ctx.inbound.clone();
            let outbound = ctx.outbound.clone();
            let responder = ctx.link.identity.clone();
            tokio::spawn(async move {
                let (id, caller) = (call.id, call.caller.clone());
                let result = inbound.handle_call(call).await;
                let reply = Frame::Reply(Reply {
                    id,
                    caller,
                    responder,
                    result,
                });
                if outbound.send(reply).await.is_err() {
                    tracing::debug!("Reply to call {} dropped: connection closed", id);
                }
            });
        }
        Frame::Event(event) => {
            let _ = ctx.inbox.send(InboundMessage::Event(event));
        }
        Frame::PeerJoined(presence) => {
            ctx.link.update_peer(&presence.identity, true);
            let _ = ctx.inbox.send(InboundMessage::PeerJoined(presence.identity));
        }
        Frame::PeerLeft(presence) => {
            ctx.link.update_peer(&presence.identity, false);
            ctx.link
                .pending
                .fail_target(&presence.identity, "module disconnected");
            let _ = ctx.inbox.send(InboundMessage::PeerLeft(presence.identity));
        }
        Frame::Error(e) => {
            tracing::warn!("Hub reported an error to {}: {}", ctx.link.identity, e.message);
        }
        other => {
            tracing::debug!("Ignoring frame 0x{:02X} from hub", other.msg_type());
        }
    }
}

/// Drain the outbound queue into the socket, with keepalives in between.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    link: Arc<Link>,
    config: TransportConfig,
) {
    let mut keepalive = tokio::time::interval(config.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;

    loop {
        // Queued frames go out before cancellation is noticed, so a
        // closing announcement still reaches the hub.
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
            _ = keepalive.tick() => Frame::Ping,
        };
        if let Err(e) = send_direct(&mut writer, &frame, config.write_timeout).await {
            link.connection_lost(&cancel, &e.to_string());
            break;
        }
    }
}
