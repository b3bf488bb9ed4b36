use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::HubError;
use crate::kernel::KernelFactory;

/// Registry mapping kernel-type names to their factories.
///
/// The first registered type becomes the default unless `set_default`
/// overrides it. Requesting an unregistered name is a caller error surfaced
/// by the kernel broker, never silently defaulted.
pub struct KernelRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    factories: HashMap<String, KernelFactory>,
    default_name: Option<String>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn register(&self, name: impl Into<String>, factory: KernelFactory) {
        let name = name.into();
        let mut inner = self.inner.write().await;
        inner.default_name.get_or_insert_with(|| name.clone());
        inner.factories.insert(name, factory);
    }

    pub async fn set_default(&self, name: &str) -> Result<(), HubError> {
        let mut inner = self.inner.write().await;
        if !inner.factories.contains_key(name) {
            return Err(HubError::UnregisteredKernelType(name.to_string()));
        }
        inner.default_name = Some(name.to_string());
        Ok(())
    }

    pub async fn factory(&self, name: &str) -> Option<KernelFactory> {
        self.inner.read().await.factories.get(name).cloned()
    }

    pub async fn default_name(&self) -> Option<String> {
        self.inner.read().await.default_name.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
