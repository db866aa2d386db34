//! VMM lifecycle controller.
//!
//! The controller owns the module registry and the driver's view of the VMM
//! state, and drives the hypervisor core through its transitions:
//!
//! ```text
//!   add_module           load               start
//!  ┌─────────┐ ┌──────────────────┐ ┌──────────────────┐
//!  │         ▼ │                  ▼ │                  ▼
//! ┌┴──────────┴┐              ┌────┴─────┐       ┌──────────┐
//! │  Unloaded  │◄─────────────│  Loaded  │◄──────│ Running  │
//! └────────────┘    unload    └──────────┘  stop └──────────┘
//! ```
//!
//! # Compensation
//!
//! Composite operations always leave a consistent state behind:
//!
//! - A failed **load** runs the full unload path: the core's unload is
//!   attempted, the registry is cleared and the state returns to Unloaded.
//! - A failed **start** runs the stop path and leaves the VMM Loaded.
//! - **unload** stops a running VMM first, then clears the registry and
//!   resets the state even when the core reports a failure, so module memory
//!   is never leaked.
//!
//! # Locking
//!
//! One mutex guards the registry and the state. Every operation holds it for
//! its whole duration, core calls included, so concurrent commands are
//! applied one at a time.

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::hypervisor::{HypervisorCore, VmmState, DESCRIPTOR_SIZE};
use crate::platform::MemoryServices;
use crate::registry::ModuleRegistry;
use log::{debug, error, info, warn};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// State guarded by the lifecycle lock.
struct Inner<M: MemoryServices> {
    registry: ModuleRegistry<M>,
    state: VmmState,
}

/// Serialized VMM lifecycle state machine.
pub struct Lifecycle<C: HypervisorCore, M: MemoryServices> {
    core: C,
    inner: Mutex<Inner<M>>,
}

impl<C: HypervisorCore, M: MemoryServices> Lifecycle<C, M> {
    /// Create a controller in the Unloaded state with an empty registry.
    pub fn new(core: C, memory: M, config: &DriverConfig) -> Self {
        Self {
            core,
            inner: Mutex::new(Inner {
                registry: ModuleRegistry::new(memory, config.max_modules),
                state: VmmState::Unloaded,
            }),
        }
    }

    /// The hypervisor core this controller drives.
    pub fn core(&self) -> &C {
        &self.core
    }

    // Every step leaves `Inner` consistent, so a panic on another thread
    // does not invalidate it.
    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy a module into executable memory and register it.
    ///
    /// Returns the number of registered modules.
    pub fn add_module(&self, module: &[u8]) -> Result<usize, DriverError> {
        self.lock().registry.add(module, &self.core)
    }

    /// Load the VMM from the registered modules.
    ///
    /// The core decides whether the transition is valid. On any failure,
    /// including a refusal because the VMM is already loaded, the unload
    /// path runs and the registry ends up empty.
    pub fn load(&self) -> Result<(), DriverError> {
        let mut inner = self.lock();

        match self.core.load_vmm() {
            Ok(()) => {
                inner.state = VmmState::Loaded;
                info!("load_vmm: succeeded ({} modules)", inner.registry.len());
                Ok(())
            }
            Err(e) => {
                error!("load_vmm: failed to load vmm: {}", e);
                // Unload failures are logged by the rollback itself
                let _ = self.unload_locked(&mut inner);
                Err(DriverError::LoadFailure(e))
            }
        }
    }

    /// Unload the VMM and release every module.
    ///
    /// A running VMM is stopped first. The core's unload is best-effort: if
    /// it fails the error is logged and returned, but the registry is still
    /// cleared and the state reset.
    pub fn unload(&self) -> Result<(), DriverError> {
        let mut inner = self.lock();
        self.unload_locked(&mut inner)
    }

    fn unload_locked(&self, inner: &mut Inner<M>) -> Result<(), DriverError> {
        if inner.state == VmmState::Running {
            let _ = self.stop_locked(inner);
        }

        let result = self.core.unload_vmm().map_err(|e| {
            error!("unload_vmm: failed to unload vmm: {}", e);
            DriverError::UnloadFailure(e)
        });

        inner.registry.clear();
        inner.state = VmmState::Unloaded;

        if result.is_ok() {
            debug!("unload_vmm: succeeded");
        }
        result
    }

    /// Start the VMM.
    ///
    /// The core decides whether the transition is valid. On any failure the
    /// stop path runs, so a VMM that was already running ends up Loaded.
    pub fn start(&self) -> Result<(), DriverError> {
        let mut inner = self.lock();

        match self.core.start_vmm() {
            Ok(()) => {
                inner.state = VmmState::Running;
                info!("start_vmm: succeeded");
                Ok(())
            }
            Err(e) => {
                error!("start_vmm: failed to start vmm: {}", e);
                let _ = self.stop_locked(&mut inner);
                Err(DriverError::StartFailure(e))
            }
        }
    }

    /// Stop the VMM.
    ///
    /// Never touches the registry. A core failure is reported as
    /// [`DriverError::StopFailure`] and leaves the state unchanged.
    pub fn stop(&self) -> Result<(), DriverError> {
        let mut inner = self.lock();
        self.stop_locked(&mut inner)
    }

    fn stop_locked(&self, inner: &mut Inner<M>) -> Result<(), DriverError> {
        match self.core.stop_vmm() {
            Ok(()) => {
                if inner.state == VmmState::Running {
                    inner.state = VmmState::Loaded;
                }
                debug!("stop_vmm: succeeded");
                Ok(())
            }
            Err(e) => {
                error!("stop_vmm: failed to stop vmm: {}", e);
                Err(DriverError::StopFailure(e))
            }
        }
    }

    /// Write the core's status code into `out`.
    ///
    /// Fails with [`DriverError::InvalidArgument`] if no slot is supplied.
    pub fn status(&self, out: Option<&mut i64>) -> Result<(), DriverError> {
        let Some(out) = out else {
            warn!("vmm_status: failed with no output slot");
            return Err(DriverError::InvalidArgument("vmm status output slot"));
        };

        let _inner = self.lock();
        *out = self.core.vmm_status();
        debug!("vmm_status: succeeded ({})", *out);
        Ok(())
    }

    /// Copy the diagnostic descriptor of `vcpuid` into `out`.
    ///
    /// `out` must hold at least [`DESCRIPTOR_SIZE`] bytes. Returns the
    /// number of bytes written.
    pub fn dump(&self, vcpuid: u64, out: &mut [u8]) -> Result<usize, DriverError> {
        if out.len() < DESCRIPTOR_SIZE {
            return Err(DriverError::InvalidArgument("dump output slot too small"));
        }

        // Held so the dump cannot interleave with a clear
        let _inner = self.lock();
        let descriptor = self.core.dump_vmm(vcpuid).map_err(|e| {
            warn!("dump_vmm: failed to dump vcpu {}: {}", vcpuid, e);
            DriverError::DumpUnavailable { vcpuid, source: e }
        })?;

        let written = descriptor.write_to(out);
        debug!("dump_vmm: succeeded (vcpu {})", vcpuid);
        Ok(written)
    }

    /// Stop and unload the VMM, as on driver teardown.
    ///
    /// Always ends Unloaded with an empty registry.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.state == VmmState::Unloaded && inner.registry.is_empty() {
            return;
        }

        info!("shutdown: tearing down {} VMM", inner.state);
        let _ = self.unload_locked(&mut inner);
    }

    /// The driver's view of the VMM state.
    pub fn state(&self) -> VmmState {
        self.lock().state
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Inspect the registry under the lifecycle lock.
    pub fn with_registry<R>(&self, f: impl FnOnce(&ModuleRegistry<M>) -> R) -> R {
        f(&self.lock().registry)
    }
}

impl<C: HypervisorCore, M: MemoryServices> Drop for Lifecycle<C, M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
