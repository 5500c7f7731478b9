use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{lock, ResourceManager};
use crate::error::{PipelineError, Result};
use crate::inference::{ModelHandle, ModelKind, ModelLoader, ModelRequest};

type ModelKey = (ModelKind, String);

/// Lazily instantiated collaborators shared by every worker of a run
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    resources: Arc<ResourceManager>,
    credential: Option<String>,
    /// One cell per (kind, variant); the cell serializes instantiation
    slots: Mutex<HashMap<ModelKey, Arc<OnceCell<ModelHandle>>>>,
    instantiations: AtomicUsize,
}

impl ModelCache {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        resources: Arc<ResourceManager>,
        credential: Option<String>,
    ) -> Self {
        Self {
            loader,
            resources,
            credential,
            slots: Mutex::new(HashMap::new()),
            instantiations: AtomicUsize::new(0),
        }
    }

    /// Get the handle for (kind, variant), instantiating it on first use.
    ///
    /// Concurrent callers for the same key wait for the single in-flight
    /// load. A failed load leaves the slot empty so a later call may retry.
    pub async fn get(&self, kind: ModelKind, variant: &str) -> Result<ModelHandle> {
        let slot = {
            let mut slots = lock(&self.slots);
            slots
                .entry((kind, variant.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let handle = slot.get_or_try_init(|| self.load(kind, variant)).await?;
        Ok(handle.clone())
    }

    async fn load(&self, kind: ModelKind, variant: &str) -> Result<ModelHandle> {
        self.resources.force_cleanup();

        let request = ModelRequest {
            kind,
            variant: variant.to_string(),
            device: self.resources.preferred_device(),
            credential: match kind {
                ModelKind::Diarization => self.credential.clone(),
                _ => None,
            },
        };
        let device = request.device;
        let loader = self.loader.clone();

        let handle = tokio::task::spawn_blocking(move || loader.load(&request))
            .await
            .map_err(|e| PipelineError::inference(kind.as_str(), e))?
            .map_err(|e| PipelineError::inference(kind.as_str(), e))?;

        if handle.kind() != kind {
            return Err(PipelineError::inference(
                kind.as_str(),
                format!("loader returned a {} model", handle.kind()),
            ));
        }

        self.instantiations.fetch_add(1, Ordering::SeqCst);
        info!("Loaded {} model '{}' on {:?}", kind, variant, device);
        Ok(handle)
    }

    /// Number of models currently held
    pub fn loaded(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Total loader invocations that produced a handle
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    /// Release every handle and force an accelerator cleanup.
    /// Unloading runs on the blocking pool.
    pub async fn teardown(&self) {
        let handles: Vec<ModelHandle> = lock(&self.slots)
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        let released = handles.len();

        let loader = self.loader.clone();
        let unloaded = tokio::task::spawn_blocking(move || {
            for handle in &handles {
                loader.unload(handle);
            }
        })
        .await;
        if let Err(e) = unloaded {
            warn!("Model unload aborted: {}", e);
        }

        self.resources.force_cleanup();
        info!("Model cache torn down ({} models released)", released);
    }
}
