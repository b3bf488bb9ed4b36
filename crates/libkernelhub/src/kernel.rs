use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use kernelhub_protocol::{KernelId, KernelStatus, WireMessage};

use crate::error::HubError;

/// Callback a kernel uses to emit outbound messages. The broker serializes
/// and routes them (iopub fan-out, everything else unicast).
pub type SendMessage = Arc<dyn Fn(WireMessage) + Send + Sync>;

/// Arguments handed to a kernel factory. `name` is the resolved kernel-type
/// name, `location` the virtual-filesystem root the kernel starts against.
pub struct KernelStartArgs {
    pub id: KernelId,
    pub name: String,
    pub location: String,
    pub send_message: SendMessage,
}

/// Asynchronous kernel constructor. The sole construction path: no kernel
/// may come into existence any other way.
pub type KernelFactory =
    Arc<dyn Fn(KernelStartArgs) -> BoxFuture<'static, Result<Arc<dyn Kernel>, HubError>> + Send + Sync>;

/// A long-lived compute endpoint addressed by id.
pub trait Kernel: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn location(&self) -> &str;

    fn status(&self) -> KernelStatus;

    /// Resolves once the kernel can accept protocol messages.
    fn ready(&self) -> BoxFuture<'_, Result<(), HubError>>;

    /// Handle one inbound message. The broker guarantees at most one
    /// concurrent invocation per kernel; once entered, the call runs to
    /// completion.
    fn handle_message(&self, msg: WireMessage) -> BoxFuture<'_, Result<(), HubError>>;

    /// Tear the kernel down. The only teardown path; fires the disposal
    /// event exactly once.
    fn dispose(&self);

    /// Resolves when the kernel has been disposed.
    fn wait_disposed(&self) -> BoxFuture<'static, ()>;
}

/// One-shot disposal latch shared between a kernel and its observers.
/// Listeners registered before or after the ring all resolve.
pub struct DisposeBell {
    tx: watch::Sender<bool>,
}

impl DisposeBell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the latch. Returns true only for the call that fired it.
    pub fn ring(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_rung(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listen(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.tx.subscribe();
        Box::pin(async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

impl Default for DisposeBell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::DisposeBell;
    use std::time::Duration;

    #[tokio::test]
    async fn bell_rings_exactly_once() {
        let bell = DisposeBell::new();
        assert!(!bell.is_rung());
        assert!(bell.ring());
        assert!(!bell.ring());
        assert!(bell.is_rung());
    }

    #[tokio::test]
    async fn listeners_resolve_before_and_after_ring() {
        let bell = DisposeBell::new();
        let early = bell.listen();
        bell.ring();
        let late = bell.listen();

        tokio::time::timeout(Duration::from_secs(1), early)
            .await
            .expect("early listener resolved");
        tokio::time::timeout(Duration::from_secs(1), late)
            .await
            .expect("late listener resolved");
    }
}
