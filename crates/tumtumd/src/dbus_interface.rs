use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tumtum_core::{MessageLevel, Notifier};
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::config::{BackendKind, ConfigError};
use crate::controller::{ControllerError, ControllerHandle, ControllerStatus};

pub const BUS_NAME: &str = "org.tumtum.Challenge1";
pub const OBJECT_PATH: &str = "/org/tumtum/Challenge1";

/// D-Bus interface for the challenge daemon.
///
/// Bus name: org.tumtum.Challenge1
/// Object path: /org/tumtum/Challenge1
pub struct ChallengeService {
    handle: ControllerHandle,
}

impl ChallengeService {
    pub fn new(handle: ControllerHandle) -> Self {
        Self { handle }
    }
}

fn failed(op: &'static str) -> impl Fn(ControllerError) -> zbus::fdo::Error {
    move |e| {
        tracing::error!(error = %e, op, "request failed");
        zbus::fdo::Error::Failed(e.to_string())
    }
}

fn status_json(status: &ControllerStatus) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "challenge": status,
    }))
}

#[interface(name = "org.tumtum.Challenge1")]
impl ChallengeService {
    /// Start a new challenge on the current device and backend.
    async fn start(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start requested");
        self.handle.start().await.map_err(failed("start"))
    }

    /// Cancel the running challenge.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        self.handle.stop().await.map_err(failed("stop"))
    }

    async fn switch_device(&self, device: &str) -> zbus::fdo::Result<()> {
        tracing::info!(device, "switch_device requested");
        self.handle
            .switch_device(device.to_string())
            .await
            .map_err(failed("switch_device"))
    }

    async fn switch_backend(&self, backend: &str) -> zbus::fdo::Result<()> {
        tracing::info!(backend, "switch_backend requested");
        let kind: BackendKind = backend
            .parse()
            .map_err(|e: ConfigError| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        self.handle
            .switch_backend(kind)
            .await
            .map_err(failed("switch_backend"))
    }

    /// Current challenge status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        status_json(&self.handle.status()).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Guidance for whatever UI is attached. `level` is "info" or "error".
    #[zbus(signal)]
    async fn user_message(
        emitter: &SignalEmitter<'_>,
        message: &str,
        level: &str,
    ) -> zbus::Result<()>;
}

/// Forwards guidance messages to the bus.
///
/// Notifications are raised synchronously from the coordinator, so they are
/// queued here and emitted by [`forward_messages`].
#[derive(Debug, Clone)]
pub struct DbusNotifier {
    tx: mpsc::UnboundedSender<(String, MessageLevel)>,
}

impl DbusNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(String, MessageLevel)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for DbusNotifier {
    fn user_message(&self, message: &str, level: MessageLevel) {
        match level {
            MessageLevel::Info => tracing::info!(message, "user message"),
            MessageLevel::Error => tracing::warn!(message, "user message"),
        }
        let _ = self.tx.send((message.to_string(), level));
    }
}

/// Emit queued guidance as `UserMessage` signals until the notifier is dropped.
pub fn forward_messages(
    conn: zbus::Connection,
    mut messages: mpsc::UnboundedReceiver<(String, MessageLevel)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
            Ok(emitter) => emitter,
            Err(e) => {
                tracing::error!(error = %e, "cannot emit signals");
                return;
            }
        };
        while let Some((message, level)) = messages.recv().await {
            if let Err(e) =
                ChallengeService::user_message(&emitter, &message, level.as_str()).await
            {
                tracing::warn!(error = %e, "failed to emit UserMessage");
            }
        }
    })
}
