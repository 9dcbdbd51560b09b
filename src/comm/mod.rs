//! Transport abstraction between modules.
//!
//! A [`Comm`] connects one module to the network. It carries calls to a
//! target identity and back, and broadcasts events to every other module.
//! Two backends ship with the crate:
//!
//! - [`LocalNetwork`]/[`LocalComm`]: in-process, for tests and for several
//!   modules sharing one process
//! - [`TcpComm`] talking to a [`Hub`]: length-prefixed msgpack frames over TCP
//!
//! Inbound traffic is handed to an [`Inbound`] implementation supplied at
//! connect time. Inbound calls run concurrently, each on its own task;
//! inbound events are delivered one at a time, in arrival order.

pub mod codec;
pub mod hub;
pub mod local;
pub mod pending;
pub mod tcp;
pub mod wire;

pub use hub::Hub;
pub use local::{LocalComm, LocalNetwork};
pub use pending::PendingCalls;
pub use tcp::TcpComm;

use crate::events::Event;
use crate::types::{Error, ErrorKind, Identity, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Calls and results
// =============================================================================

/// A remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Unique among the caller's outstanding calls.
    pub id: u64,
    pub caller: Identity,
    pub target: Identity,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Caller's deadline, informational for the responder.
    pub deadline_ms: u64,
}

impl Call {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Outcome of a call as seen on the wire. Never carries a stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallResult {
    Success(Value),
    Failure { kind: ErrorKind, message: String },
}

impl CallResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CallResult::Success(_))
    }

    /// Map a peer's answer into a local result.
    ///
    /// Invocation failures (bad method, bad arguments) stay `Invocation`;
    /// everything else the peer reports becomes `Remote` carrying its kind.
    pub fn into_result(self, responder: &Identity) -> Result<Value> {
        match self {
            CallResult::Success(value) => Ok(value),
            CallResult::Failure {
                kind: ErrorKind::Invocation,
                message,
            } => Err(Error::invocation(message)),
            CallResult::Failure { kind, message } => Err(Error::Remote {
                module: responder.to_string(),
                kind,
                message,
            }),
        }
    }
}

impl From<Result<Value>> for CallResult {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => CallResult::Success(value),
            Err(e) => e.to_failure(),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Receiver of inbound traffic, supplied to [`Comm::connect`].
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Answer a call addressed to this module.
    async fn handle_call(&self, call: Call) -> CallResult;

    /// Handle a broadcast event from another module.
    async fn handle_event(&self, event: Event);

    async fn peer_joined(&self, _identity: &Identity) {}

    async fn peer_left(&self, _identity: &Identity) {}
}

/// One module's connection to the network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Comm: Send + Sync {
    fn identity(&self) -> Identity;

    /// Connection generation, bumped on every connect and disconnect.
    /// Anything learned under an older epoch is stale.
    fn epoch(&self) -> u64;

    async fn connect(&self, inbound: Arc<dyn Inbound>) -> Result<()>;

    /// Fails every outstanding call with "connection lost".
    async fn disconnect(&self) -> Result<()>;

    /// Send a call and wait for its result until `deadline` elapses.
    async fn send_call(
        &self,
        target: &Identity,
        method: &str,
        args: Vec<Value>,
        deadline: Duration,
    ) -> Result<CallResult>;

    /// Broadcast to every other module. Fire-and-forget.
    async fn publish_event(&self, event: &Event) -> Result<()>;

    /// Identities currently reachable.
    async fn peers(&self) -> Vec<Identity>;
}

/// Connect, run `body`, and disconnect regardless of how `body` ended.
///
/// An error from `body` wins over an error from the disconnect.
pub async fn scoped<F, Fut, T>(comm: &dyn Comm, inbound: Arc<dyn Inbound>, body: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    comm.connect(inbound).await?;
    let result = body().await;
    let disconnected = comm.disconnect().await;
    let value = result?;
    disconnected?;
    Ok(value)
}

// =============================================================================
// Inbound pump
// =============================================================================

/// Ordered inbound traffic that is not a call.
#[derive(Debug, Clone)]
pub(crate) enum InboundMessage {
    Event(Event),
    PeerJoined(Identity),
    PeerLeft(Identity),
}

/// Deliver inbound events and presence changes strictly in arrival order.
pub(crate) async fn pump_inbound(
    inbound: Arc<dyn Inbound>,
    mut rx: mpsc::UnboundedReceiver<InboundMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            InboundMessage::Event(event) => inbound.handle_event(event).await,
            InboundMessage::PeerJoined(identity) => inbound.peer_joined(&identity).await,
            InboundMessage::PeerLeft(identity) => inbound.peer_left(&identity).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn camera() -> Identity {
        Identity::parse("camera").unwrap()
    }

    #[test]
    fn test_into_result_success() {
        let value = CallResult::Success(json!(3.5)).into_result(&camera()).unwrap();
        assert_eq!(value, json!(3.5));
    }

    #[test]
    fn test_into_result_keeps_invocation_kind() {
        let err = CallResult::Failure {
            kind: ErrorKind::Invocation,
            message: "unknown method: explode".into(),
        }
        .into_result(&camera())
        .unwrap_err();
        assert!(matches!(err, Error::Invocation(_)));
    }

    #[test]
    fn test_into_result_wraps_peer_failure() {
        let err = CallResult::Failure {
            kind: ErrorKind::Image,
            message: "shutter stuck".into(),
        }
        .into_result(&camera())
        .unwrap_err();
        match err {
            Error::Remote {
                module,
                kind,
                message,
            } => {
                assert_eq!(module, "camera");
                assert_eq!(kind, ErrorKind::Image);
                assert_eq!(message, "shutter stuck");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_to_failure() {
        let result: CallResult = Err(Error::motion("limit reached")).into();
        assert_eq!(
            result,
            CallResult::Failure {
                kind: ErrorKind::Motion,
                message: "limit reached".into()
            }
        );
    }

    #[tokio::test]
    async fn test_scoped_disconnects_after_failing_body() {
        struct Nothing;

        #[async_trait]
        impl Inbound for Nothing {
            async fn handle_call(&self, _call: Call) -> CallResult {
                CallResult::Success(Value::Null)
            }
            async fn handle_event(&self, _event: Event) {}
        }

        let mut comm = MockComm::new();
        comm.expect_connect().times(1).returning(|_| Ok(()));
        comm.expect_disconnect().times(1).returning(|| Ok(()));

        let result: Result<()> = scoped(&comm, Arc::new(Nothing), || async {
            Err(Error::general("body failed"))
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::General);
    }
}
