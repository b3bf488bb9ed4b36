use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use kernelhub_protocol::{
    Channel, ClientId, Frame, KernelId, KernelModel, WIRE_SUBPROTOCOL, WireMessage, codec, paths,
};

use crate::error::HubError;
use crate::kernel::{Kernel, KernelStartArgs, SendMessage};
use crate::registry::KernelRegistry;

/// Change feed events for the kernel table.
#[derive(Debug, Clone)]
pub enum KernelChange {
    Added { model: KernelModel },
    Removed { model: KernelModel },
}

/// Options for `start_new`. A present `id` makes the call idempotent; an
/// absent `name` falls back to the registry default.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub id: Option<KernelId>,
    pub name: Option<String>,
    pub location: Option<String>,
}

/// Options for `connect`. When `handle_comms` is unset it defaults to true
/// unless another attached channel already handles comms for that kernel.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub kernel_id: KernelId,
    pub client_id: Option<ClientId>,
    pub handle_comms: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct KernelBrokerConfig {
    /// Base under which channel endpoints are addressed.
    pub base_url: String,
    pub change_feed_capacity: usize,
}

impl Default for KernelBrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "local://hub".to_string(),
            change_feed_capacity: 64,
        }
    }
}

struct KernelEntry {
    kernel: Arc<dyn Kernel>,
    model: KernelModel,
    location: String,
    /// Inbound side of the per-kernel exclusive processing path.
    work_tx: mpsc::UnboundedSender<WireMessage>,
}

struct ClientPort {
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
    handle_comms: bool,
}

/// The attached-client map and the per-kernel client sets, always mutated
/// together under one lock so neither goes stale relative to the other.
#[derive(Default)]
struct AttachmentTable {
    clients: HashMap<ClientId, ClientPort>,
    by_kernel: HashMap<KernelId, HashSet<ClientId>>,
}

impl AttachmentTable {
    fn attach(&mut self, kernel_id: &str, client_id: &str, port: ClientPort) {
        // a client id lives in at most one kernel's attachment set
        self.detach(client_id);
        self.clients.insert(client_id.to_string(), port);
        self.by_kernel
            .entry(kernel_id.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    fn detach(&mut self, client_id: &str) -> bool {
        let existed = self.clients.remove(client_id).is_some();
        if existed {
            for set in self.by_kernel.values_mut() {
                set.remove(client_id);
            }
        }
        existed
    }

    fn detach_kernel(&mut self, kernel_id: &str) -> Vec<ClientId> {
        let Some(set) = self.by_kernel.remove(kernel_id) else {
            return Vec::new();
        };
        let ids: Vec<ClientId> = set.into_iter().collect();
        for client_id in &ids {
            self.clients.remove(client_id);
        }
        ids
    }

    fn comms_handled(&self, kernel_id: &str) -> bool {
        self.by_kernel.get(kernel_id).is_some_and(|set| {
            set.iter()
                .any(|id| self.clients.get(id).is_some_and(|port| port.handle_comms))
        })
    }
}

/// A client's transport channel to one kernel: submit inbound frames,
/// receive outbound frames. Dropping the handle detaches the client.
pub struct ChannelHandle {
    kernel_id: KernelId,
    client_id: ClientId,
    handle_comms: bool,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelHandle {
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn handles_comms(&self) -> bool {
        self.handle_comms
    }

    /// Submit an inbound frame from the client side.
    pub fn send(&self, frame: Frame) -> Result<(), HubError> {
        self.inbound_tx
            .send(frame)
            .map_err(|_| HubError::ChannelClosed(self.client_id.clone()))
    }

    /// Serialize and submit a structured message.
    pub fn send_message(&self, msg: &WireMessage) -> Result<(), HubError> {
        self.send(Frame::Binary(codec::serialize(msg)?))
    }

    /// Next outbound frame, or None once detached.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.frames.recv().await
    }

    /// Next outbound frame decoded into a structured message.
    pub async fn recv_message(&mut self) -> Option<WireMessage> {
        self.recv().await.and_then(|frame| codec::deserialize(&frame).ok())
    }
}

/// Owns the registry of live kernels, attached client channels, per-kernel
/// exclusive processing, and iopub fan-out.
pub struct KernelBroker {
    registry: Arc<KernelRegistry>,
    config: KernelBrokerConfig,
    /// Handed to spawned watchers and pumps so they never outlive the broker.
    weak: Weak<Self>,
    kernels: RwLock<HashMap<KernelId, KernelEntry>>,
    attachments: Arc<Mutex<AttachmentTable>>,
    endpoints: RwLock<HashMap<String, KernelId>>,
    changes: broadcast::Sender<KernelChange>,
}

impl KernelBroker {
    pub fn new(registry: Arc<KernelRegistry>) -> Arc<Self> {
        Self::with_config(registry, KernelBrokerConfig::default())
    }

    pub fn with_config(registry: Arc<KernelRegistry>, config: KernelBrokerConfig) -> Arc<Self> {
        let (changes, _rx) = broadcast::channel(config.change_feed_capacity.max(1));
        Arc::new_cyclic(|weak| Self {
            registry,
            config,
            weak: weak.clone(),
            kernels: RwLock::new(HashMap::new()),
            attachments: Arc::new(Mutex::new(AttachmentTable::default())),
            endpoints: RwLock::new(HashMap::new()),
            changes,
        })
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    /// Subscribe to kernel add/remove events.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<KernelChange> {
        self.changes.subscribe()
    }

    /// The channel endpoint address a kernel is reachable under.
    pub fn endpoint_url(&self, kernel_id: &str) -> String {
        paths::channels_url(&self.config.base_url, kernel_id)
    }

    /// Start a new kernel, or return the model of the kernel already running
    /// under the requested id.
    pub async fn start_new(&self, options: StartOptions) -> Result<KernelModel, HubError> {
        let StartOptions { id, name, location } = options;

        if let Some(ref requested) = id
            && let Some(entry) = self.kernels.read().await.get(requested)
        {
            return Ok(entry.model.clone());
        }

        let kernel_name = match name {
            Some(name) => name,
            None => self
                .registry
                .default_name()
                .await
                .ok_or(HubError::NoDefaultKernel)?,
        };
        let factory = self
            .registry
            .factory(&kernel_name)
            .await
            .ok_or_else(|| HubError::UnregisteredKernelType(kernel_name.clone()))?;

        let kernel_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let location = location.unwrap_or_default();

        let kernel = factory(KernelStartArgs {
            id: kernel_id.clone(),
            name: kernel_name.clone(),
            location: location.clone(),
            send_message: self.make_send_message(kernel_id.clone()),
        })
        .await?;

        let model = KernelModel {
            id: kernel_id.clone(),
            name: kernel_name,
        };

        {
            let mut kernels = self.kernels.write().await;
            if let Some(existing) = kernels.get(&kernel_id) {
                // lost a start race for this id; ours never gets registered
                kernel.dispose();
                return Ok(existing.model.clone());
            }
            let (work_tx, work_rx) = mpsc::unbounded_channel();
            kernels.insert(
                kernel_id.clone(),
                KernelEntry {
                    kernel: Arc::clone(&kernel),
                    model: model.clone(),
                    location,
                    work_tx,
                },
            );
            spawn_worker(Arc::clone(&kernel), work_rx, kernel_id.clone());
        }

        self.table().by_kernel.entry(kernel_id.clone()).or_default();
        self.endpoints
            .write()
            .await
            .insert(self.endpoint_url(&kernel_id), kernel_id.clone());

        // full teardown once the kernel fires its disposal event
        let weak = self.weak.clone();
        let watched = Arc::clone(&kernel);
        let watched_id = kernel_id.clone();
        tokio::spawn(async move {
            watched.wait_disposed().await;
            if let Some(broker) = weak.upgrade() {
                broker.finalize_disposal(&watched_id, &watched).await;
            }
        });

        info!(kernel_id = %model.id, name = %model.name, "kernel started");
        let _ = self.changes.send(KernelChange::Added {
            model: model.clone(),
        });
        Ok(model)
    }

    /// Attach a client channel to a running kernel.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ChannelHandle, HubError> {
        let ConnectOptions {
            kernel_id,
            client_id,
            handle_comms,
        } = options;

        let kernel = {
            let kernels = self.kernels.read().await;
            let entry = kernels
                .get(&kernel_id)
                .ok_or_else(|| HubError::KernelNotFound(kernel_id.clone()))?;
            Arc::clone(&entry.kernel)
        };
        if kernel.status().is_terminal() {
            return Err(HubError::KernelDead(kernel_id));
        }

        let client_id = client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let handle_comms = {
            let mut table = self.table();
            let handle_comms = handle_comms.unwrap_or_else(|| !table.comms_handled(&kernel_id));
            table.attach(
                &kernel_id,
                &client_id,
                ClientPort {
                    frames_tx,
                    handle_comms,
                },
            );
            handle_comms
        };

        debug!(kernel_id = %kernel_id, client_id = %client_id, handle_comms, subprotocol = WIRE_SUBPROTOCOL, "client attached");
        spawn_channel_pump(self.weak.clone(), kernel_id.clone(), client_id.clone(), inbound_rx);

        Ok(ChannelHandle {
            kernel_id,
            client_id,
            handle_comms,
            inbound_tx,
            frames: frames_rx,
        })
    }

    /// Attach through a channel endpoint address
    /// (`<base>/api/kernels/<id>/channels?session_id=<clientId>`).
    pub async fn open_channel(&self, url: &str) -> Result<ChannelHandle, HubError> {
        let (path, client_id) = paths::split_client_id(url);
        let kernel_id = self
            .endpoints
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| HubError::EndpointNotFound(path.to_string()))?;
        self.connect(ConnectOptions {
            kernel_id,
            client_id: client_id.map(str::to_string),
            handle_comms: None,
        })
        .await
    }

    /// Detach one client channel. Returns whether it was attached.
    pub fn detach(&self, client_id: &str) -> bool {
        let detached = self.table().detach(client_id);
        if detached {
            debug!(client_id = %client_id, "client detached");
        }
        detached
    }

    /// Dispose a kernel and start a replacement under the same id, name and
    /// location. Existing attachments are invalidated and must reconnect.
    pub async fn restart(&self, kernel_id: &str) -> Result<KernelModel, HubError> {
        let (kernel, name, location) = {
            let kernels = self.kernels.read().await;
            let entry = kernels
                .get(kernel_id)
                .ok_or_else(|| HubError::KernelNotFound(kernel_id.to_string()))?;
            (
                Arc::clone(&entry.kernel),
                entry.model.name.clone(),
                entry.location.clone(),
            )
        };
        if kernel.status().is_terminal() {
            return Err(HubError::KernelDead(kernel_id.to_string()));
        }

        kernel.dispose();
        // finalize here rather than racing the disposal watcher, so the
        // replacement under the same id can never be torn down by it
        self.finalize_disposal(kernel_id, &kernel).await;

        self.start_new(StartOptions {
            id: Some(kernel_id.to_string()),
            name: Some(name),
            location: Some(location),
        })
        .await
    }

    /// Shut one kernel down. A missing id is a no-op.
    pub async fn shutdown(&self, kernel_id: &str) -> Result<(), HubError> {
        let Some(entry) = self.kernels.write().await.remove(kernel_id) else {
            return Ok(());
        };
        self.cleanup_after_remove(kernel_id, entry.model.clone()).await;
        entry.kernel.dispose();
        Ok(())
    }

    pub async fn shutdown_all(&self) -> Result<(), HubError> {
        let ids: Vec<KernelId> = self.kernels.read().await.keys().cloned().collect();
        for id in ids {
            self.shutdown(&id).await?;
        }
        Ok(())
    }

    pub async fn find_by_id(&self, kernel_id: &str) -> Option<KernelModel> {
        self.kernels
            .read()
            .await
            .get(kernel_id)
            .map(|entry| entry.model.clone())
    }

    /// The live kernel handle, if running.
    pub async fn get(&self, kernel_id: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels
            .read()
            .await
            .get(kernel_id)
            .map(|entry| Arc::clone(&entry.kernel))
    }

    /// Lightweight models of the running kernels.
    pub async fn running(&self) -> Vec<KernelModel> {
        self.kernels
            .read()
            .await
            .values()
            .map(|entry| entry.model.clone())
            .collect()
    }

    /// No-op: there is no external source of truth to reconcile against.
    pub async fn refresh_running(&self) {}

    /// Route one inbound frame from an attached client.
    async fn route_frame(&self, kernel_id: &str, client_id: &str, frame: Frame) {
        let msg = match codec::decode(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "dropping undecodable frame");
                return;
            }
        };

        let (kernel, work_tx) = {
            let kernels = self.kernels.read().await;
            match kernels.get(kernel_id) {
                Some(entry) => (Arc::clone(&entry.kernel), entry.work_tx.clone()),
                None => {
                    debug!(kernel_id = %kernel_id, "dropping frame for removed kernel");
                    return;
                }
            }
        };

        if msg.is_input_reply() {
            // interactive stdin completes work already in flight; it must not
            // queue behind the exclusive processing path
            if let Err(err) = kernel.handle_message(msg).await {
                warn!(kernel_id = %kernel_id, error = %err, "input reply rejected");
            }
            return;
        }

        if work_tx.send(msg).is_err() {
            debug!(kernel_id = %kernel_id, "dropping frame for kernel in teardown");
        }
    }

    /// Teardown driven by a kernel's disposal event. Guarded by instance
    /// identity so a stale watcher never tears down a regenerated kernel
    /// running under the same id.
    async fn finalize_disposal(&self, kernel_id: &str, instance: &Arc<dyn Kernel>) {
        let removed = {
            let mut kernels = self.kernels.write().await;
            match kernels.get(kernel_id) {
                Some(entry) if Arc::ptr_eq(&entry.kernel, instance) => kernels.remove(kernel_id),
                _ => None,
            }
        };
        let Some(entry) = removed else {
            return;
        };
        self.cleanup_after_remove(kernel_id, entry.model).await;
    }

    async fn cleanup_after_remove(&self, kernel_id: &str, model: KernelModel) {
        self.endpoints.write().await.retain(|_, id| id != kernel_id);
        let dropped = self.table().detach_kernel(kernel_id);
        if !dropped.is_empty() {
            debug!(kernel_id = %kernel_id, clients = dropped.len(), "dropped attached clients");
        }
        info!(kernel_id = %kernel_id, "kernel removed");
        let _ = self.changes.send(KernelChange::Removed { model });
    }

    /// Outbound path handed to each kernel: serialize, then fan out iopub to
    /// every client of this kernel and unicast everything else to the client
    /// named by the header's session field.
    fn make_send_message(&self, kernel_id: KernelId) -> SendMessage {
        let attachments = Arc::clone(&self.attachments);
        Arc::new(move |msg: WireMessage| {
            let frame = match codec::serialize(&msg) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(kernel_id = %kernel_id, error = %err, "failed to serialize outbound message");
                    return;
                }
            };

            let table = attachments.lock().expect("attachment table lock poisoned");
            if msg.channel == Channel::Iopub {
                if let Some(clients) = table.by_kernel.get(&kernel_id) {
                    for client_id in clients {
                        if let Some(port) = table.clients.get(client_id) {
                            let _ = port.frames_tx.send(frame.clone());
                        }
                    }
                }
                return;
            }

            let destination = &msg.header.session;
            match table.clients.get(destination) {
                Some(port) => {
                    let _ = port.frames_tx.send(frame);
                }
                None => {
                    warn!(kernel_id = %kernel_id, client_id = %destination, "dropping message for detached client");
                }
            }
        })
    }

    fn table(&self) -> MutexGuard<'_, AttachmentTable> {
        self.attachments.lock().expect("attachment table lock poisoned")
    }
}

/// The per-kernel exclusive processing path: a single consumer that awaits
/// readiness and then each handler call to completion, so no two
/// `handle_message` invocations for one kernel ever overlap.
fn spawn_worker(
    kernel: Arc<dyn Kernel>,
    mut work_rx: mpsc::UnboundedReceiver<WireMessage>,
    kernel_id: KernelId,
) {
    tokio::spawn(async move {
        while let Some(msg) = work_rx.recv().await {
            if let Err(err) = kernel.ready().await {
                warn!(kernel_id = %kernel_id, error = %err, "dropping message for unready kernel");
                continue;
            }
            let msg_type = msg.header.msg_type.clone();
            if let Err(err) = kernel.handle_message(msg).await {
                warn!(kernel_id = %kernel_id, msg_type = %msg_type, error = %err, "kernel rejected message");
            }
        }
    });
}

/// Per-channel inbound pump. Ends when the handle is dropped, detaching the
/// client from both attachment maps.
fn spawn_channel_pump(
    broker: Weak<KernelBroker>,
    kernel_id: KernelId,
    client_id: ClientId,
    mut inbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    tokio::spawn(async move {
        while let Some(frame) = inbound_rx.recv().await {
            let Some(broker) = broker.upgrade() else {
                return;
            };
            broker.route_frame(&kernel_id, &client_id, frame).await;
        }
        if let Some(broker) = broker.upgrade() {
            broker.detach(&client_id);
        }
    });
}
