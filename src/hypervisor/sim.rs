//! In-process hypervisor core.
//!
//! [`SimulatedCore`] follows the status machine of a real hypervisor core
//! without touching hardware: it accepts modules only while unloaded, needs
//! at least one module to load, refuses to unload a running VMM, and keeps a
//! debug ring per vCPU that records every transition. It is what the `hvctl`
//! binary drives, and the collaborator the driver's own tests run against.
//!
//! # Fault Injection
//!
//! [`SimulatedCore::fail_next`] arms a one-shot failure for an operation. The
//! next call of that operation returns [`CoreError::Failed`] without changing
//! state; later calls behave normally again. Every call, failed or not, is
//! recorded in the journal.

use super::{CoreError, DiagnosticDescriptor, HypervisorCore, VmmState};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Error code returned for injected failures.
pub const INJECTED_FAILURE: i64 = -0x1000;

/// Module table size of the simulated core.
pub const SIM_MAX_MODULES: usize = 75;

/// Operations of the core, for fault injection and the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreOp {
    AddModule,
    Load,
    Unload,
    Start,
    Stop,
    Dump,
}

#[derive(Debug)]
struct SimState {
    status: VmmState,
    /// Sizes of the registered modules, in registration order.
    modules: Vec<usize>,
    /// Armed one-shot failures.
    faults: Vec<CoreOp>,
    /// Every call received, in order.
    journal: Vec<CoreOp>,
    /// One debug ring per vCPU, created on load.
    rings: Vec<DiagnosticDescriptor>,
}

/// A hypervisor core simulated in process memory.
#[derive(Debug)]
pub struct SimulatedCore {
    vcpus: u64,
    max_modules: usize,
    state: Mutex<SimState>,
}

impl SimulatedCore {
    /// Create a core that runs `vcpus` virtual CPUs.
    pub fn new(vcpus: u64) -> Self {
        Self::with_max_modules(vcpus, SIM_MAX_MODULES)
    }

    /// Create a core with a custom module table size.
    pub fn with_max_modules(vcpus: u64, max_modules: usize) -> Self {
        Self {
            vcpus,
            max_modules,
            state: Mutex::new(SimState {
                status: VmmState::Unloaded,
                modules: Vec::new(),
                faults: Vec::new(),
                journal: Vec::new(),
                rings: Vec::new(),
            }),
        }
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: CoreOp) {
        self.lock().faults.push(op);
    }

    /// Current state of the simulated VMM.
    pub fn state(&self) -> VmmState {
        self.lock().status
    }

    /// Number of modules currently registered.
    pub fn registered_modules(&self) -> usize {
        self.lock().modules.len()
    }

    /// Every call received so far, in order.
    pub fn journal(&self) -> Vec<CoreOp> {
        self.lock().journal.clone()
    }

    /// Number of calls of `op` received so far.
    pub fn calls(&self, op: CoreOp) -> usize {
        self.lock().journal.iter().filter(|&&o| o == op).count()
    }

    /// Number of vCPUs.
    pub fn vcpus(&self) -> u64 {
        self.vcpus
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Journal the call and consume an armed fault for it.
    fn enter(&self, op: CoreOp) -> Result<MutexGuard<'_, SimState>, CoreError> {
        let mut state = self.lock();
        state.journal.push(op);
        if let Some(index) = state.faults.iter().position(|&f| f == op) {
            state.faults.remove(index);
            log::debug!("sim: injected failure for {:?}", op);
            return Err(CoreError::Failed(INJECTED_FAILURE));
        }
        Ok(state)
    }
}

impl SimState {
    fn log_all(&mut self, message: &str) {
        for (vcpuid, ring) in self.rings.iter_mut().enumerate() {
            ring.append(format!("vcpu{}: {}\n", vcpuid, message).as_bytes());
        }
    }
}

impl HypervisorCore for SimulatedCore {
    fn add_module(&self, module: &[u8]) -> Result<(), CoreError> {
        let mut state = self.enter(CoreOp::AddModule)?;
        if state.status != VmmState::Unloaded {
            return Err(CoreError::InvalidState);
        }
        if state.modules.len() >= self.max_modules {
            return Err(CoreError::TooManyModules {
                max: self.max_modules,
            });
        }
        state.modules.push(module.len());
        Ok(())
    }

    fn load_vmm(&self) -> Result<(), CoreError> {
        let mut state = self.enter(CoreOp::Load)?;
        if state.status != VmmState::Unloaded {
            return Err(CoreError::InvalidState);
        }
        if state.modules.is_empty() {
            return Err(CoreError::NoModules);
        }

        let message = format!(
            "loaded {} modules ({} bytes)",
            state.modules.len(),
            state.modules.iter().sum::<usize>()
        );
        state.rings = (0..self.vcpus).map(|_| DiagnosticDescriptor::new()).collect();
        state.log_all(&message);
        state.status = VmmState::Loaded;
        Ok(())
    }

    fn unload_vmm(&self) -> Result<(), CoreError> {
        let mut state = self.enter(CoreOp::Unload)?;
        if state.status == VmmState::Running {
            return Err(CoreError::InvalidState);
        }
        state.modules.clear();
        state.rings.clear();
        state.status = VmmState::Unloaded;
        Ok(())
    }

    fn start_vmm(&self) -> Result<(), CoreError> {
        let mut state = self.enter(CoreOp::Start)?;
        if state.status != VmmState::Loaded {
            return Err(CoreError::InvalidState);
        }
        state.log_all("started");
        state.status = VmmState::Running;
        Ok(())
    }

    fn stop_vmm(&self) -> Result<(), CoreError> {
        let mut state = self.enter(CoreOp::Stop)?;
        // Stopping a VMM that is not running has nothing to do
        if state.status == VmmState::Running {
            state.log_all("stopped");
            state.status = VmmState::Loaded;
        }
        Ok(())
    }

    fn vmm_status(&self) -> i64 {
        self.lock().status.status_code()
    }

    fn dump_vmm(&self, vcpuid: u64) -> Result<DiagnosticDescriptor, CoreError> {
        let state = self.enter(CoreOp::Dump)?;
        if state.status == VmmState::Unloaded {
            return Err(CoreError::InvalidState);
        }
        usize::try_from(vcpuid)
            .ok()
            .and_then(|index| state.rings.get(index))
            .cloned()
            .ok_or(CoreError::InvalidVcpu(vcpuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{VMM_LOADED, VMM_RUNNING, VMM_UNLOADED};

    #[test]
    fn test_full_lifecycle() {
        let core = SimulatedCore::new(2);
        assert_eq!(core.vmm_status(), VMM_UNLOADED);

        core.add_module(&[1, 2, 3]).unwrap();
        core.load_vmm().unwrap();
        assert_eq!(core.vmm_status(), VMM_LOADED);

        core.start_vmm().unwrap();
        assert_eq!(core.vmm_status(), VMM_RUNNING);

        core.stop_vmm().unwrap();
        core.unload_vmm().unwrap();
        assert_eq!(core.vmm_status(), VMM_UNLOADED);
        assert_eq!(core.registered_modules(), 0);
        assert_eq!(
            core.journal(),
            vec![
                CoreOp::AddModule,
                CoreOp::Load,
                CoreOp::Start,
                CoreOp::Stop,
                CoreOp::Unload
            ]
        );
    }

    #[test]
    fn test_load_without_modules() {
        let core = SimulatedCore::new(1);
        assert_eq!(core.load_vmm(), Err(CoreError::NoModules));
        assert_eq!(core.state(), VmmState::Unloaded);
    }

    #[test]
    fn test_add_module_while_loaded() {
        let core = SimulatedCore::new(1);
        core.add_module(&[0x90]).unwrap();
        core.load_vmm().unwrap();
        assert_eq!(core.add_module(&[0x90]), Err(CoreError::InvalidState));
    }

    #[test]
    fn test_module_table_full() {
        let core = SimulatedCore::with_max_modules(1, 2);
        core.add_module(&[1]).unwrap();
        core.add_module(&[2]).unwrap();
        assert_eq!(
            core.add_module(&[3]),
            Err(CoreError::TooManyModules { max: 2 })
        );
    }

    #[test]
    fn test_unload_while_running() {
        let core = SimulatedCore::new(1);
        core.add_module(&[1]).unwrap();
        core.load_vmm().unwrap();
        core.start_vmm().unwrap();
        assert_eq!(core.unload_vmm(), Err(CoreError::InvalidState));
        assert_eq!(core.state(), VmmState::Running);
    }

    #[test]
    fn test_fault_is_one_shot() {
        let core = SimulatedCore::new(1);
        core.add_module(&[1]).unwrap();
        core.fail_next(CoreOp::Load);

        assert_eq!(core.load_vmm(), Err(CoreError::Failed(INJECTED_FAILURE)));
        assert_eq!(core.state(), VmmState::Unloaded);
        assert!(core.load_vmm().is_ok());
        assert_eq!(core.calls(CoreOp::Load), 2);
    }

    #[test]
    fn test_dump_rings() {
        let core = SimulatedCore::new(2);
        assert_eq!(core.dump_vmm(0), Err(CoreError::InvalidState));

        core.add_module(&[0; 10]).unwrap();
        core.load_vmm().unwrap();
        core.start_vmm().unwrap();

        let ring = core.dump_vmm(1).unwrap();
        let text = String::from_utf8(ring.contents()).unwrap();
        assert_eq!(text, "vcpu1: loaded 1 modules (10 bytes)\nvcpu1: started\n");

        assert_eq!(core.dump_vmm(2), Err(CoreError::InvalidVcpu(2)));
    }
}
