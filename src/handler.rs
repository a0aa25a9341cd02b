use crate::close::CloseReason;
use crate::dispatch::DispatchEvent;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Capability a shard uses to report to its owner.
///
/// Shards hold only a weak reference to their delegate, so a dropped owner
/// simply stops receiving reports. Calls may arrive concurrently from every
/// shard task.
pub trait ShardDelegate: Send + Sync + 'static {
    /// The shard established a session
    fn shard_did_connect(&self, shard_id: u32, resumed: bool) -> impl Future<Output = ()> + Send;

    /// The shard lost its connection. `closed` is true when it will not
    /// reconnect on its own.
    fn shard_did_disconnect(
        &self,
        shard_id: u32,
        reason: CloseReason,
        closed: bool,
    ) -> impl Future<Output = ()> + Send;

    /// Whether the shard should reconnect (and resume where possible) after
    /// a close that does not force either answer.
    fn shard_should_attempt_resuming(
        &self,
        _shard_id: u32,
        _reason: CloseReason,
        _closed: bool,
    ) -> impl Future<Output = bool> + Send {
        async { false }
    }

    /// A dispatch arrived; the shard's sequence already includes it
    fn shard_did_receive_event(
        &self,
        shard_id: u32,
        event: DispatchEvent,
    ) -> impl Future<Output = ()> + Send;

    /// Hello arrived with this heartbeat interval
    fn shard_got_hello(
        &self,
        _shard_id: u32,
        _heartbeat_interval: Duration,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Trait that applications implement to receive gateway events.
///
/// The [`ShardManager`](crate::ShardManager) aggregates every shard into this
/// one handler: connection status arrives once for the whole shard set, and
/// dispatches arrive tagged with the shard that received them.
///
/// # Example
///
/// ```ignore
/// use ws_gateway::{DispatchEvent, GatewayHandler};
///
/// struct Bot;
///
/// impl GatewayHandler for Bot {
///     async fn on_event(&self, shard_id: u32, event: DispatchEvent) {
///         if let DispatchEvent::MessageCreate(message) = event {
///             println!("[{}] {}", shard_id, message.content);
///         }
///     }
/// }
/// ```
pub trait GatewayHandler: Send + Sync + 'static {
    /// Every shard established a session
    fn on_connect(&self, _connected: bool) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Every shard lost its connection. `closed` is true when none of them
    /// will reconnect on its own.
    fn on_disconnect(&self, _reason: CloseReason, _closed: bool) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A recognised dispatch arrived
    fn on_event(&self, shard_id: u32, event: DispatchEvent) -> impl Future<Output = ()> + Send;

    /// A dispatch outside the catalogue arrived
    fn on_unhandled_event(
        &self,
        _shard_id: u32,
        _name: &str,
        _data: &Value,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Whether a shard should reconnect after `reason`. Fatal reasons never
    /// ask; server reconnect requests never ask.
    fn should_attempt_resuming(
        &self,
        _reason: CloseReason,
        _closed: bool,
    ) -> impl Future<Output = bool> + Send {
        async { false }
    }

    /// A shard received hello
    fn on_hello(&self, _shard_id: u32, _heartbeat_interval: Duration) -> impl Future<Output = ()> + Send {
        async {}
    }
}
