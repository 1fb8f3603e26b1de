//! Deterministic mock downstream backend for tests.
//!
//! Echoes each prompt back, records every request it sees, and can be
//! scripted to inject delays, transport faults, and remote errors.

use crate::adapter::{DownstreamBackend, TurnOutput, TurnRequest};
use crate::error::AdapterError;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

type Handler =
    Box<dyn Fn(&TurnRequest) -> std::result::Result<TurnOutput, AdapterError> + Send + Sync>;

/// Scripted downstream stand-in. The default script echoes the prompt and
/// hands out sequential continuation handles on `start`.
pub struct MockBackend {
    handler: Handler,
    delay: Mutex<Duration>,
    recorded: Mutex<Vec<TurnRequest>>,
    connected: AtomicBool,
    transport_failures: AtomicUsize,
    remote_failure: Mutex<Option<String>>,
    reconnects: AtomicUsize,
}

impl MockBackend {
    /// Echo backend: every turn answers `echo(<prompt>)`.
    pub fn echo() -> Self {
        let counter = AtomicU64::new(0);
        Self::with_handler(move |request| {
            let continuation = match request {
                TurnRequest::Start(_) => Some(format!(
                    "thread-{}",
                    counter.fetch_add(1, Ordering::SeqCst)
                )),
                TurnRequest::Reply(_) => None,
            };
            Ok(TurnOutput {
                continuation,
                text: format!("echo({})", request.prompt()),
            })
        })
    }

    /// Backend with a custom response script.
    pub fn with_handler(
        handler: impl Fn(&TurnRequest) -> std::result::Result<TurnOutput, AdapterError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Mutex::new(Duration::ZERO),
            recorded: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            transport_failures: AtomicUsize::new(0),
            remote_failure: Mutex::new(None),
            reconnects: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().expect("delay lock poisoned") = delay;
        self
    }

    /// Fail the next `count` calls with a transport error.
    pub fn fail_transport_times(self, count: usize) -> Self {
        self.transport_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail the next call with a downstream error envelope.
    pub fn fail_remote_once(&self, message: &str) {
        *self.remote_failure.lock().expect("remote failure lock poisoned") =
            Some(message.to_string());
    }

    /// Every request seen so far, in arrival order.
    pub fn recorded(&self) -> Vec<TurnRequest> {
        self.recorded.lock().expect("recorded lock poisoned").clone()
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DownstreamBackend for MockBackend {
    async fn call(&self, request: TurnRequest) -> std::result::Result<TurnOutput, AdapterError> {
        if self
            .transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            self.connected.store(false, Ordering::SeqCst);
            return Err(AdapterError::Transport("mock transport fault".to_string()));
        }

        if let Some(message) = self
            .remote_failure
            .lock()
            .expect("remote failure lock poisoned")
            .take()
        {
            return Err(AdapterError::Remote(message));
        }

        let delay = *self.delay.lock().expect("delay lock poisoned");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.recorded
            .lock()
            .expect("recorded lock poisoned")
            .push(request.clone());
        (self.handler)(&request)
    }

    async fn reconnect(&self) -> std::result::Result<(), AdapterError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
