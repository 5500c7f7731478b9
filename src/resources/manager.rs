use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::lock;
use crate::config::StageKind;
use crate::inference::Device;

/// Memory view of a shared accelerator
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;
    /// Total device memory in GB
    fn total_gb(&self) -> f64;
    /// Memory currently held by the process outside of leases, in GB
    fn allocated_gb(&self) -> f64;
    /// Return cached allocations to the device
    fn release_cached(&self);
}

/// Fixed-size accelerator with no allocations of its own
#[derive(Debug, Clone)]
pub struct StaticAccelerator {
    name: String,
    total_gb: f64,
}

impl StaticAccelerator {
    pub fn new(name: impl Into<String>, total_gb: f64) -> Self {
        Self {
            name: name.into(),
            total_gb,
        }
    }
}

impl Accelerator for StaticAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn total_gb(&self) -> f64 {
        self.total_gb
    }

    fn allocated_gb(&self) -> f64 {
        0.0
    }

    fn release_cached(&self) {}
}

/// Outcome of admission with one cleanup-and-retry
#[derive(Debug)]
pub enum Admission {
    Granted(ResourceLease),
    Denied { available_gb: f64 },
}

/// Bookkeeping grant that lets one stage proceed on the accelerator.
///
/// The reserved amount is returned to the manager when the lease drops.
#[derive(Debug)]
pub struct ResourceLease {
    ledger: Arc<Mutex<f64>>,
    amount_gb: f64,
    stage: StageKind,
}

impl ResourceLease {
    pub fn amount_gb(&self) -> f64 {
        self.amount_gb
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let mut reserved = lock(&self.ledger);
        *reserved = (*reserved - self.amount_gb).max(0.0);
    }
}

/// Tracks a fractional budget of accelerator memory
pub struct ResourceManager {
    accelerator: Option<Arc<dyn Accelerator>>,
    limit_fraction: f64,
    /// GB reserved by live leases
    ledger: Arc<Mutex<f64>>,
    cleanups: AtomicUsize,
}

impl ResourceManager {
    pub fn new(accelerator: Option<Arc<dyn Accelerator>>, limit_fraction: f64) -> Self {
        if let Some(device) = &accelerator {
            info!(
                "Accelerator {}: {:.1}GB -> {:.1}GB budget",
                device.name(),
                device.total_gb(),
                device.total_gb() * limit_fraction
            );
        }
        Self {
            accelerator,
            limit_fraction,
            ledger: Arc::new(Mutex::new(0.0)),
            cleanups: AtomicUsize::new(0),
        }
    }

    /// Manager for a machine without an accelerator
    pub fn host_only() -> Self {
        Self::new(None, 1.0)
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerator.is_some()
    }

    /// Device models should be loaded on
    pub fn preferred_device(&self) -> Device {
        if self.has_accelerator() {
            Device::Accelerator
        } else {
            Device::Host
        }
    }

    /// (used, total) in GB, where used includes live leases
    pub fn current_usage(&self) -> (f64, f64) {
        let reserved = *lock(&self.ledger);
        self.usage_with(reserved)
    }

    fn usage_with(&self, reserved: f64) -> (f64, f64) {
        match &self.accelerator {
            Some(device) => (device.allocated_gb() + reserved, device.total_gb()),
            None => (reserved, 0.0),
        }
    }

    fn available_with(&self, reserved: f64) -> f64 {
        let (used, total) = self.usage_with(reserved);
        total * self.limit_fraction - used
    }

    pub fn available(&self) -> f64 {
        let reserved = *lock(&self.ledger);
        self.available_with(reserved)
    }

    /// Whether `required_gb` fits in the remaining budget
    pub fn try_admit(&self, required_gb: f64) -> bool {
        self.available() >= required_gb
    }

    /// Ask the accelerator to return cached memory
    pub fn force_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if let Some(device) = &self.accelerator {
            device.release_cached();
            debug!(
                "Forced accelerator cleanup: {:.2}GB available",
                self.available()
            );
        }
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    /// Atomically check the budget and reserve `required_gb`
    fn reserve(&self, stage: StageKind, required_gb: f64) -> Option<ResourceLease> {
        let mut reserved = lock(&self.ledger);
        if self.available_with(*reserved) < required_gb {
            return None;
        }
        *reserved += required_gb;
        Some(ResourceLease {
            ledger: self.ledger.clone(),
            amount_gb: required_gb,
            stage,
        })
    }

    /// Admit a stage, forcing one cleanup and retrying once on denial
    pub fn admit(&self, stage: StageKind, required_gb: f64) -> Admission {
        if let Some(lease) = self.reserve(stage, required_gb) {
            return Admission::Granted(lease);
        }

        debug!(
            "{}: {:.2}GB not available, forcing cleanup before retry",
            stage, required_gb
        );
        self.force_cleanup();

        match self.reserve(stage, required_gb) {
            Some(lease) => Admission::Granted(lease),
            None => {
                let available_gb = self.available();
                warn!(
                    "{}: accelerator admission denied ({:.2}GB required, {:.2}GB available)",
                    stage, required_gb, available_gb
                );
                Admission::Denied { available_gb }
            }
        }
    }
}
