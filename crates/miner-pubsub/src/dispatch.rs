//! Listener fan-out.
//!
//! Events are queued to a single worker task so listeners never run on the
//! socket reader. Each delivery is isolated with `catch_unwind`: a panicking
//! listener is logged and skipped, the rest still see the event, and later
//! events keep their order.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::codec::InboundFrame;
use crate::errors::PubSubError;

/// How a connection ended, as reported to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code (1006 when no close frame was exchanged).
    pub code: u16,
    /// Close reason or a description of the failure.
    pub reason: String,
    /// Whether the remote side initiated the close.
    pub remote: bool,
}

/// Observer of one client's lifecycle and traffic.
///
/// Every method has a no-op default so implementors only override what they
/// care about.
#[async_trait]
pub trait PubSubListener: Send + Sync {
    /// The socket is up and topics have been re-sent.
    async fn on_open(&self) {}

    /// A frame that no pending request consumed.
    async fn on_message(&self, _frame: &InboundFrame) {}

    /// An opened connection ended.
    async fn on_close(&self, _info: &CloseInfo) {}

    /// A non-request error: connect failure, undecodable frame, auth failure.
    async fn on_error(&self, _error: &PubSubError) {}
}

/// Event queued for delivery.
#[derive(Clone, Debug)]
pub enum ListenerEvent {
    /// Connection opened.
    Opened,
    /// Inbound frame for listeners.
    Message(Arc<InboundFrame>),
    /// Connection closed.
    Closed(CloseInfo),
    /// Observational error.
    Error(Arc<PubSubError>),
}

impl ListenerEvent {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Opened => "open",
            Self::Message(_) => "message",
            Self::Closed(_) => "close",
            Self::Error(_) => "error",
        }
    }
}

enum Job {
    Deliver {
        event: ListenerEvent,
        listeners: Vec<Arc<dyn PubSubListener>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the dispatch worker. The worker exits once every handle is gone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Start the worker. Must be called inside a Tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(run_worker(rx)));
        Self { tx }
    }

    /// Queue `event` for `listeners`, a snapshot taken by the caller.
    pub fn dispatch(&self, event: ListenerEvent, listeners: Vec<Arc<dyn PubSubListener>>) {
        if listeners.is_empty() {
            return;
        }
        if self.tx.send(Job::Deliver { event, listeners }).is_err() {
            warn!("dispatch worker is gone, event dropped");
        }
    }

    /// Wait until everything queued before this call has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Deliver { event, listeners } => {
                trace!(event = event.label(), listeners = listeners.len(), "dispatching");
                for (index, listener) in listeners.iter().enumerate() {
                    let delivery = AssertUnwindSafe(deliver(&event, listener.as_ref()));
                    if let Err(panic) = delivery.catch_unwind().await {
                        warn!(
                            listener = index,
                            event = event.label(),
                            panic = %panic_message(panic.as_ref()),
                            "listener panicked"
                        );
                    }
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn deliver(event: &ListenerEvent, listener: &dyn PubSubListener) {
    match event {
        ListenerEvent::Opened => listener.on_open().await,
        ListenerEvent::Message(frame) => listener.on_message(frame).await,
        ListenerEvent::Closed(info) => listener.on_close(info).await,
        ListenerEvent::Error(err) => listener.on_error(err).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PubSubListener for Recorder {
        async fn on_open(&self) {
            self.seen.lock().push("open".into());
        }
        async fn on_message(&self, frame: &InboundFrame) {
            self.seen.lock().push(frame.kind().to_owned());
        }
        async fn on_close(&self, info: &CloseInfo) {
            self.seen.lock().push(format!("close:{}", info.code));
        }
        async fn on_error(&self, _error: &PubSubError) {
            self.seen.lock().push("error".into());
        }
    }

    struct Panicker;

    #[async_trait]
    impl PubSubListener for Panicker {
        async fn on_message(&self, _frame: &InboundFrame) {
            panic!("listener blew up");
        }
    }

    struct Silent;

    impl PubSubListener for Silent {}

    #[tokio::test]
    async fn delivers_in_order() {
        let dispatcher = Dispatcher::spawn();
        let recorder = Arc::new(Recorder::default());
        let listeners: Vec<Arc<dyn PubSubListener>> = vec![recorder.clone()];

        dispatcher.dispatch(ListenerEvent::Opened, listeners.clone());
        dispatcher.dispatch(
            ListenerEvent::Message(Arc::new(InboundFrame::Pong)),
            listeners.clone(),
        );
        dispatcher.dispatch(
            ListenerEvent::Closed(CloseInfo {
                code: 1000,
                reason: String::new(),
                remote: true,
            }),
            listeners,
        );
        dispatcher.flush().await;

        assert_eq!(*recorder.seen.lock(), vec!["open", "PONG", "close:1000"]);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let dispatcher = Dispatcher::spawn();
        let before = Arc::new(Recorder::default());
        let after = Arc::new(Recorder::default());
        let listeners: Vec<Arc<dyn PubSubListener>> =
            vec![before.clone(), Arc::new(Panicker), after.clone()];

        for _ in 0..2 {
            dispatcher.dispatch(
                ListenerEvent::Message(Arc::new(InboundFrame::Reconnect)),
                listeners.clone(),
            );
        }
        dispatcher.dispatch(
            ListenerEvent::Error(Arc::new(PubSubError::Closed)),
            listeners,
        );
        dispatcher.flush().await;

        let expected = vec!["RECONNECT", "RECONNECT", "error"];
        assert_eq!(*before.seen.lock(), expected);
        assert_eq!(*after.seen.lock(), expected);
    }

    #[tokio::test]
    async fn default_methods_are_noops() {
        let dispatcher = Dispatcher::spawn();
        dispatcher.dispatch(ListenerEvent::Opened, vec![Arc::new(Silent)]);
        dispatcher.flush().await;
    }

    #[tokio::test]
    async fn empty_snapshot_is_skipped() {
        let dispatcher = Dispatcher::spawn();
        dispatcher.dispatch(ListenerEvent::Opened, Vec::new());
        dispatcher.flush().await;
    }

    #[test]
    fn panic_message_extracts_text() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(owned.as_ref()), "boom");
        let borrowed: Box<dyn Any + Send> = Box::new("static boom");
        assert_eq!(panic_message(borrowed.as_ref()), "static boom");
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn event_labels() {
        assert_eq!(ListenerEvent::Opened.label(), "open");
        assert_eq!(
            ListenerEvent::Error(Arc::new(PubSubError::Closed)).label(),
            "error"
        );
    }
}
