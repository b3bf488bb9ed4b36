use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use kernelhub_protocol::{Channel, KernelId, KernelStatus, PROTOCOL_VERSION, WireMessage};

use crate::error::HubError;
use crate::kernel::{DisposeBell, Kernel, KernelFactory, KernelStartArgs, SendMessage};

/// Kernel-type name the echo kernel registers under.
pub const ECHO_KERNEL_NAME: &str = "echo";

/// Built-in kernel that echoes submitted code back on the iopub channel.
///
/// Exercises the whole routing surface (busy/idle status signalling, iopub
/// fan-out, shell replies, stdin capture) without a language runtime behind
/// it; the front-end registers it as the default kernel type.
pub struct EchoKernel {
    id: KernelId,
    name: String,
    location: String,
    send: SendMessage,
    status: Mutex<KernelStatus>,
    bell: DisposeBell,
    execution_count: AtomicU64,
    last_input: Mutex<Option<String>>,
}

impl EchoKernel {
    pub fn factory() -> KernelFactory {
        Arc::new(|args: KernelStartArgs| -> BoxFuture<'static, Result<Arc<dyn Kernel>, HubError>> {
            Box::pin(async move { Ok(EchoKernel::start(args) as Arc<dyn Kernel>) })
        })
    }

    /// Typed construction path, for callers that wrap the stock factory.
    pub fn start(args: KernelStartArgs) -> Arc<Self> {
        Arc::new(Self::new(args))
    }

    fn new(args: KernelStartArgs) -> Self {
        Self {
            id: args.id,
            name: args.name,
            location: args.location,
            send: args.send_message,
            status: Mutex::new(KernelStatus::Idle),
            bell: DisposeBell::new(),
            execution_count: AtomicU64::new(0),
            last_input: Mutex::new(None),
        }
    }

    /// The value of the most recent `input_reply`, if any.
    pub fn last_input(&self) -> Option<String> {
        self.last_input.lock().expect("echo kernel lock poisoned").clone()
    }

    fn set_status(&self, status: KernelStatus, parent: &WireMessage) {
        *self.status.lock().expect("echo kernel lock poisoned") = status;
        (self.send)(WireMessage::reply(
            parent,
            Channel::Iopub,
            "status",
            json!({ "execution_state": status }),
        ));
    }

    fn handle_execute(&self, msg: &WireMessage) {
        self.set_status(KernelStatus::Busy, msg);

        let code = msg
            .content
            .get("code")
            .and_then(|code| code.as_str())
            .unwrap_or_default();
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;

        (self.send)(WireMessage::reply(
            msg,
            Channel::Iopub,
            "execute_input",
            json!({ "code": code, "execution_count": count }),
        ));
        (self.send)(WireMessage::reply(
            msg,
            Channel::Iopub,
            "stream",
            json!({ "name": "stdout", "text": code }),
        ));
        (self.send)(WireMessage::reply(
            msg,
            Channel::Shell,
            "execute_reply",
            json!({ "status": "ok", "execution_count": count }),
        ));

        self.set_status(KernelStatus::Idle, msg);
    }

    fn handle_kernel_info(&self, msg: &WireMessage) {
        self.set_status(KernelStatus::Busy, msg);
        (self.send)(WireMessage::reply(
            msg,
            Channel::Shell,
            "kernel_info_reply",
            json!({
                "status": "ok",
                "protocol_version": PROTOCOL_VERSION,
                "implementation": "echo",
                "implementation_version": env!("CARGO_PKG_VERSION"),
                "language_info": { "name": "echo" },
                "banner": "echo kernel",
            }),
        ));
        self.set_status(KernelStatus::Idle, msg);
    }
}

impl Kernel for EchoKernel {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn status(&self) -> KernelStatus {
        *self.status.lock().expect("echo kernel lock poisoned")
    }

    fn ready(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if self.status().is_terminal() {
                return Err(HubError::KernelDead(self.id.clone()));
            }
            Ok(())
        })
    }

    fn handle_message(&self, msg: WireMessage) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if self.status().is_terminal() {
                return Err(HubError::KernelDead(self.id.clone()));
            }
            match msg.header.msg_type.as_str() {
                "execute_request" => self.handle_execute(&msg),
                "kernel_info_request" => self.handle_kernel_info(&msg),
                kernelhub_protocol::INPUT_REPLY_MSG_TYPE => {
                    let value = msg
                        .content
                        .get("value")
                        .and_then(|value| value.as_str())
                        .map(str::to_string);
                    *self.last_input.lock().expect("echo kernel lock poisoned") = value;
                }
                other => {
                    debug!(kernel_id = %self.id, msg_type = other, "echo kernel ignoring message");
                }
            }
            Ok(())
        })
    }

    fn dispose(&self) {
        *self.status.lock().expect("echo kernel lock poisoned") = KernelStatus::Dead;
        self.bell.ring();
    }

    fn wait_disposed(&self) -> BoxFuture<'static, ()> {
        self.bell.listen()
    }
}
