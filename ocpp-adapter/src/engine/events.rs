//! Observer fan-out for exchange milestones
//!
//! Observers are called in registration order on a detached task. A failing
//! or panicking observer is logged and skipped; the pipeline that emitted the
//! event never waits for, or hears from, its observers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::ocpp::{EventTrackingId, NetworkPath, RequestId};
use crate::transport::SendOutcome;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Milestones of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestSent,
    ResponseReceived,
    RequestErrorReceived,
    RequestReceived,
    ResponseSent,
    RequestErrorSent,
    ResponseErrorSent,
    ResponseErrorReceived,
}

/// One milestone, handed to every observer
#[derive(Debug, Clone)]
pub struct ExchangeEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub action: Option<String>,
    pub request_id: RequestId,
    pub event_tracking_id: EventTrackingId,
    pub connection_id: Option<String>,
    pub network_path: NetworkPath,
    pub payload: Value,
    pub send_outcome: Option<SendOutcome>,
    pub runtime: Option<Duration>,
}

impl ExchangeEvent {
    pub fn new(kind: EventKind, request_id: RequestId, event_tracking_id: EventTrackingId) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            action: None,
            request_id,
            event_tracking_id,
            connection_id: None,
            network_path: NetworkPath::new(),
            payload: Value::Null,
            send_outcome: None,
            runtime: None,
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn path(mut self, network_path: NetworkPath) -> Self {
        self.network_path = network_path;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn outcome(mut self, send_outcome: SendOutcome) -> Self {
        self.send_outcome = Some(send_outcome);
        self
    }

    pub fn runtime(mut self, runtime: Duration) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

pub type Observer = Arc<dyn Fn(ExchangeEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Ordered list of observers
#[derive(Default, Clone)]
pub struct EventFanout {
    observers: Arc<RwLock<Vec<Observer>>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer; it sees every event emitted after this call
    pub fn subscribe<F, Fut>(&self, observer: F)
    where
        F: Fn(ExchangeEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let observer: Observer = Arc::new(move |event| observer(event).boxed());
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Notify every observer without blocking the caller
    pub fn emit(&self, event: ExchangeEvent) {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        tokio::spawn(log_event(observers, event));
    }
}

/// Call each observer in order; failures are logged and do not stop the rest
pub async fn log_event(observers: Vec<Observer>, event: ExchangeEvent) {
    for (index, observer) in observers.iter().enumerate() {
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| observer(event.clone())));
        let result = match call {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Observer {} failed on {:?} for {}: {}",
                index, event.kind, event.request_id, e
            ),
            Err(_) => warn!(
                "Observer {} panicked on {:?} for {}",
                index, event.kind, event.request_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn ok() -> Result<(), BoxError> {
        Ok(())
    }

    fn event() -> ExchangeEvent {
        ExchangeEvent::new(EventKind::RequestSent, "r1".into(), EventTrackingId::new()).action("Reset")
    }

    #[tokio::test]
    async fn test_observers_run_in_order_despite_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fanout = EventFanout::new();

        let log = seen.clone();
        fanout.subscribe(move |_| {
            log.lock().push(1);
            async { ok() }
        });
        fanout.subscribe(|_| async { Err::<(), BoxError>("observer down".into()) });
        fanout.subscribe(|_| -> futures_util::future::Ready<Result<(), BoxError>> {
            panic!("observer bug")
        });
        fanout.subscribe(|_| async {
            if true {
                panic!("async observer bug");
            }
            ok()
        });
        let log = seen.clone();
        fanout.subscribe(move |event| {
            log.lock().push(if event.action.as_deref() == Some("Reset") { 5 } else { 0 });
            async { ok() }
        });

        let observers = fanout.observers.read().clone();
        log_event(observers, event()).await;

        assert_eq!(*seen.lock(), vec![1, 5]);
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_observers() {
        let fanout = EventFanout::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        fanout.subscribe(move |event| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(event.kind);
                }
                ok()
            }
        });

        fanout.emit(event());
        assert_eq!(rx.await.unwrap(), EventKind::RequestSent);
    }
}
