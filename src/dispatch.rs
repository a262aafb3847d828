use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};

/// Request metadata the host dispatcher fixes when it starts a transaction.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub method: String,
    pub origin: String,
    pub path: String,
    pub headers: HeaderMap,
}

/// An upgraded connection handed through `on_request_upgrade`, passed to
/// the host handler untouched.
pub type UpgradeStream = Box<dyn AsyncStream>;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type AbortHook = Box<dyn FnMut(&str) + Send>;

/// Per-transaction control surface owned by the host dispatcher. The
/// interceptor installs an abort hook so host-side cancellation tears
/// down its mirror streams promptly.
#[derive(Default)]
pub struct DispatchController {
    abort_reason: Option<String>,
    abort_hooks: Vec<AbortHook>,
}

impl DispatchController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the transaction. Hooks run once, on the first call; later
    /// calls are ignored.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.abort_reason.is_some() {
            return;
        }
        let reason = reason.into();
        for hook in &mut self.abort_hooks {
            hook(&reason);
        }
        self.abort_reason = Some(reason);
    }

    pub fn on_abort(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.abort_hooks.push(Box::new(hook));
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }
}

/// The streaming lifecycle a host dispatcher drives, one transaction at a
/// time, callbacks strictly ordered: `on_request_start`, then optionally
/// `on_response_start`, zero or more `on_response_data` in FIFO order,
/// and finally `on_response_end` or `on_response_error`.
#[async_trait]
pub trait DispatchHandler: Send {
    async fn on_request_start(&mut self, controller: &mut DispatchController);

    async fn on_request_upgrade(
        &mut self,
        controller: &mut DispatchController,
        status: u16,
        headers: &HeaderMap,
        socket: UpgradeStream,
    );

    async fn on_response_start(
        &mut self,
        controller: &mut DispatchController,
        status: u16,
        headers: &HeaderMap,
        status_message: Option<&str>,
    );

    async fn on_response_data(&mut self, controller: &mut DispatchController, chunk: Bytes);

    async fn on_response_end(
        &mut self,
        controller: &mut DispatchController,
        trailers: Option<&HeaderMap>,
    );

    async fn on_response_error(
        &mut self,
        controller: &mut DispatchController,
        error: &anyhow::Error,
    );
}
