use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use kernelhub_protocol::{KernelId, KernelRef, SessionId, SessionModel};

use crate::broker::{KernelBroker, KernelChange, StartOptions};
use crate::error::HubError;

/// How long a removed kernel may stay gone before its removal stops looking
/// like an in-flight restart and the owning session is shut down.
pub const RESTART_GRACE: Duration = Duration::from_millis(100);

/// Options for `start_new`. A present `name` makes the call idempotent by
/// display name.
#[derive(Debug, Clone, Default)]
pub struct SessionStartOptions {
    pub path: String,
    pub name: Option<String>,
    pub kernel: Option<KernelRef>,
}

/// Options for `patch`. Only non-null fields are merged; a `kernel.id`
/// rebinds to an existing kernel, a `kernel.name` starts a fresh one.
#[derive(Debug, Clone, Default)]
pub struct SessionPatchOptions {
    pub id: SessionId,
    pub path: Option<String>,
    pub name: Option<String>,
    pub kernel: Option<KernelRef>,
}

/// Owns the session records and reconciles their lifecycle with the kernel
/// broker's, including restart detection.
pub struct SessionBroker {
    kernels: Arc<KernelBroker>,
    sessions: RwLock<Vec<SessionModel>>,
    pending_restarts: Mutex<HashSet<KernelId>>,
}

impl SessionBroker {
    pub fn new(kernels: Arc<KernelBroker>) -> Arc<Self> {
        let broker = Arc::new(Self {
            kernels,
            sessions: RwLock::new(Vec::new()),
            pending_restarts: Mutex::new(HashSet::new()),
        });
        Self::spawn_reconciler(&broker);
        broker
    }

    pub fn kernels(&self) -> &Arc<KernelBroker> {
        &self.kernels
    }

    /// Start a session bound to a fresh kernel, or return the session that
    /// already carries the requested display name.
    pub async fn start_new(&self, options: SessionStartOptions) -> Result<SessionModel, HubError> {
        let SessionStartOptions { path, name, kernel } = options;

        if let Some(ref name) = name
            && let Some(existing) = self
                .sessions
                .read()
                .await
                .iter()
                .find(|session| session.name == *name)
        {
            return Ok(existing.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let location = derive_location(name.as_deref(), &path);
        let kernel = self
            .kernels
            .start_new(StartOptions {
                id: Some(id.clone()),
                name: kernel.and_then(|k| k.name),
                location: Some(location),
            })
            .await?;

        let session = SessionModel {
            id,
            name: name.unwrap_or_else(|| path.clone()),
            path,
            session_type: "notebook".to_string(),
            kernel: Some(kernel),
        };
        self.sessions.write().await.push(session.clone());
        info!(session_id = %session.id, path = %session.path, "session started");
        Ok(session)
    }

    /// Shut a session down along with its bound kernel.
    pub async fn shutdown(&self, id: &str) -> Result<(), HubError> {
        let session = self
            .sessions
            .read()
            .await
            .iter()
            .find(|session| session.id == id)
            .cloned()
            .ok_or_else(|| HubError::SessionNotFound(id.to_string()))?;

        if let Some(kernel) = session.kernel {
            self.kernels.shutdown(&kernel.id).await?;
        }
        self.sessions.write().await.retain(|session| session.id != id);
        info!(session_id = %id, "session shut down");
        Ok(())
    }

    pub async fn shutdown_all(&self) -> Result<(), HubError> {
        let ids: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|session| session.id.clone())
            .collect();
        for id in ids {
            match self.shutdown(&id).await {
                Ok(()) | Err(HubError::SessionNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Merge non-null fields into a session, rebinding its kernel when a
    /// kernel reference is supplied.
    pub async fn patch(&self, options: SessionPatchOptions) -> Result<SessionModel, HubError> {
        let SessionPatchOptions { id, path, name, kernel } = options;

        let current = self
            .sessions
            .read()
            .await
            .iter()
            .find(|session| session.id == id)
            .cloned()
            .ok_or_else(|| HubError::SessionNotFound(id.clone()))?;

        let mut patched = current;
        if let Some(path) = path {
            patched.path = path;
        }
        if let Some(name) = name {
            patched.name = name;
        }

        if let Some(kernel) = kernel {
            // an id takes precedence over a name
            if let Some(kernel_id) = kernel.id {
                let adopted = self
                    .sessions
                    .read()
                    .await
                    .iter()
                    .find(|session| {
                        session
                            .kernel
                            .as_ref()
                            .is_some_and(|bound| bound.id == kernel_id)
                    })
                    .and_then(|session| session.kernel.clone());
                if let Some(adopted) = adopted {
                    patched.kernel = Some(adopted);
                }
            } else if let Some(kernel_name) = kernel.name {
                // a brand-new kernel; the old one is left running
                let model = self
                    .kernels
                    .start_new(StartOptions {
                        id: Some(uuid::Uuid::new_v4().to_string()),
                        name: Some(kernel_name),
                        location: Some(dirname(&patched.path).to_string()),
                    })
                    .await?;
                patched.kernel = Some(model);
            }
        }

        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or_else(|| HubError::SessionNotFound(id.clone()))?;
        *slot = patched.clone();
        Ok(patched)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<SessionModel, HubError> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|session| session.id == id)
            .cloned()
            .ok_or_else(|| HubError::SessionNotFound(id.to_string()))
    }

    /// The live session records, in insertion order.
    pub async fn list(&self) -> Vec<SessionModel> {
        self.sessions.read().await.clone()
    }

    fn spawn_reconciler(broker: &Arc<Self>) {
        let mut changes = broker.kernels.subscribe_changes();
        let weak = Arc::downgrade(broker);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(KernelChange::Removed { model }) => {
                        let Some(broker) = weak.upgrade() else { break };
                        broker.note_kernel_removed(model.id).await;
                    }
                    Ok(KernelChange::Added { model }) => {
                        let Some(broker) = weak.upgrade() else { break };
                        // a re-add inside the grace window was a restart
                        broker.pending().remove(&model.id);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "kernel change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// A kernel vanished: presume restart, schedule the grace-period check,
    /// and cascade-shutdown the owning session only if it never comes back.
    async fn note_kernel_removed(self: Arc<Self>, kernel_id: KernelId) {
        let owning = self
            .sessions
            .read()
            .await
            .iter()
            .find(|session| {
                session
                    .kernel
                    .as_ref()
                    .is_some_and(|bound| bound.id == kernel_id)
            })
            .map(|session| session.id.clone());
        let Some(session_id) = owning else { return };

        self.pending().insert(kernel_id.clone());
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_GRACE).await;
            let expired = self.pending().remove(&kernel_id);
            if !expired {
                return;
            }
            debug!(kernel_id = %kernel_id, session_id = %session_id, "kernel did not come back, shutting session down");
            if let Err(err) = self.shutdown(&session_id).await {
                debug!(session_id = %session_id, error = %err, "session already gone during cascade");
            }
        });
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<KernelId>> {
        self.pending_restarts
            .lock()
            .expect("pending restart set lock poisoned")
    }
}

fn dirname(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Location token for a kernel started against `path`: the containing
/// directory, drive-qualified when the path names a drive and the directory
/// does not already carry it.
fn derive_location(name: Option<&str>, path: &str) -> String {
    let name_or_path = name.unwrap_or(path);
    let dir = match name.map(dirname) {
        Some(dir) if !dir.is_empty() => dir,
        _ => dirname(path),
    };
    let drive = name_or_path
        .split_once(':')
        .map(|(drive, _)| drive)
        .unwrap_or("");
    if dir.contains(drive) {
        dir.to_string()
    } else {
        format!("{drive}:{dir}")
    }
}
