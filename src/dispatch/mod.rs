//! Command dispatcher.
//!
//! The dispatcher is the driver's only entry point. It is called from the
//! host's request queue, possibly on many threads at once, and turns each
//! request into one operation and one completion:
//!
//! ```text
//! control code ──► Command::from_code ──► unknown? ──► InvalidCommand
//!                          │
//!                          ▼
//!                  validate buffers ──► bad? ──► BufferValidationFailure
//!                          │
//!                          ▼
//!                  run the operation ──► Completion { status, bytes_written }
//! ```
//!
//! Validation happens before the operation runs, so a rejected request has
//! no side effects.
//!
//! # Control Codes
//!
//! Codes use the Windows `CTL_CODE` layout:
//!
//! ```text
//!  31            16 15  14 13           2 1    0
//! ┌────────────────┬──────┬──────────────┬──────┐
//! │  device type   │access│   function   │method│
//! └────────────────┴──────┴──────────────┴──────┘
//! ```
//!
//! | Command   | Function | Input       | Output            |
//! |-----------|----------|-------------|-------------------|
//! | AddModule | 0x801    | module bytes| -                 |
//! | LoadVmm   | 0x802    | -           | -                 |
//! | UnloadVmm | 0x803    | -           | -                 |
//! | StartVmm  | 0x804    | -           | -                 |
//! | StopVmm   | 0x805    | -           | -                 |
//! | DumpVmm   | 0x806    | -           | descriptor (4096) |
//! | VmmStatus | 0x807    | -           | i64 LE (8)        |
//! | SetVcpuId | 0x808    | u64 LE (8)  | -                 |

mod request;

pub use request::{BufferError, Completion, HostRequest, IoRequest, RequestBuffers};

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::hypervisor::{HypervisorCore, DESCRIPTOR_SIZE};
use crate::lifecycle::Lifecycle;
use crate::platform::MemoryServices;
use crate::vcpu::VcpuContext;
use log::{debug, warn};

/// Device type of the driver's control codes.
pub const DEVICE_TYPE: u32 = 0xF00D;

/// Transfer methods.
pub const METHOD_BUFFERED: u32 = 0;
pub const METHOD_IN_DIRECT: u32 = 1;
pub const METHOD_OUT_DIRECT: u32 = 2;

/// Required access.
pub const FILE_ANY_ACCESS: u32 = 0;
pub const FILE_READ_DATA: u32 = 1;
pub const FILE_WRITE_DATA: u32 = 2;

/// Build a control code.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

pub const IOCTL_ADD_MODULE: u32 = ctl_code(DEVICE_TYPE, 0x801, METHOD_IN_DIRECT, FILE_WRITE_DATA);
pub const IOCTL_LOAD_VMM: u32 = ctl_code(DEVICE_TYPE, 0x802, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_UNLOAD_VMM: u32 = ctl_code(DEVICE_TYPE, 0x803, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_START_VMM: u32 = ctl_code(DEVICE_TYPE, 0x804, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_STOP_VMM: u32 = ctl_code(DEVICE_TYPE, 0x805, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_DUMP_VMM: u32 = ctl_code(DEVICE_TYPE, 0x806, METHOD_OUT_DIRECT, FILE_READ_DATA);
pub const IOCTL_VMM_STATUS: u32 = ctl_code(DEVICE_TYPE, 0x807, METHOD_OUT_DIRECT, FILE_READ_DATA);
pub const IOCTL_SET_VCPUID: u32 = ctl_code(DEVICE_TYPE, 0x808, METHOD_IN_DIRECT, FILE_WRITE_DATA);

/// Commands understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    AddModule,
    LoadVmm,
    UnloadVmm,
    StartVmm,
    StopVmm,
    DumpVmm,
    VmmStatus,
    SetVcpuId,
}

impl Command {
    /// Every command, in function-code order.
    pub const ALL: [Command; 8] = [
        Command::AddModule,
        Command::LoadVmm,
        Command::UnloadVmm,
        Command::StartVmm,
        Command::StopVmm,
        Command::DumpVmm,
        Command::VmmStatus,
        Command::SetVcpuId,
    ];

    /// The command's control code.
    pub const fn code(self) -> u32 {
        match self {
            Command::AddModule => IOCTL_ADD_MODULE,
            Command::LoadVmm => IOCTL_LOAD_VMM,
            Command::UnloadVmm => IOCTL_UNLOAD_VMM,
            Command::StartVmm => IOCTL_START_VMM,
            Command::StopVmm => IOCTL_STOP_VMM,
            Command::DumpVmm => IOCTL_DUMP_VMM,
            Command::VmmStatus => IOCTL_VMM_STATUS,
            Command::SetVcpuId => IOCTL_SET_VCPUID,
        }
    }

    /// Look up the command for a control code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Command::AddModule => "add_module",
            Command::LoadVmm => "load_vmm",
            Command::UnloadVmm => "unload_vmm",
            Command::StartVmm => "start_vmm",
            Command::StopVmm => "stop_vmm",
            Command::DumpVmm => "dump_vmm",
            Command::VmmStatus => "vmm_status",
            Command::SetVcpuId => "set_vcpuid",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry point for host requests.
///
/// Safe to share between threads; see [`Lifecycle`] for how operations are
/// serialized.
pub struct Dispatcher<C: HypervisorCore, M: MemoryServices> {
    lifecycle: Lifecycle<C, M>,
    vcpu: VcpuContext,
}

impl<C: HypervisorCore, M: MemoryServices> Dispatcher<C, M> {
    /// Create a dispatcher over a fresh, unloaded driver.
    pub fn new(core: C, memory: M, config: &DriverConfig) -> Self {
        Self {
            lifecycle: Lifecycle::new(core, memory, config),
            vcpu: VcpuContext::new(),
        }
    }

    /// The lifecycle controller.
    pub fn lifecycle(&self) -> &Lifecycle<C, M> {
        &self.lifecycle
    }

    /// The selected-vCPU context.
    pub fn vcpu(&self) -> &VcpuContext {
        &self.vcpu
    }

    /// Handle a host request: fetch its buffers, dispatch it and complete it.
    pub fn handle<R: HostRequest + ?Sized>(&self, request: &mut R) {
        let code = request.control_code();
        let completion = match request.buffers() {
            Ok(buffers) => self.dispatch(code, buffers.input, buffers.output),
            Err(e) => {
                warn!("request {:#010x}: {}", code, e);
                Completion::failed(e.into())
            }
        };
        request.complete(completion);
    }

    /// Dispatch a control code with its buffers.
    pub fn dispatch(
        &self,
        code: u32,
        input: Option<&[u8]>,
        output: Option<&mut [u8]>,
    ) -> Completion {
        let Some(command) = Command::from_code(code) else {
            warn!("request {:#010x}: unrecognized control code", code);
            return Completion::failed(DriverError::InvalidCommand(code));
        };

        match self.execute(command, input, output) {
            Ok(written) => Completion::success(written),
            Err(e) => {
                debug!("{}: failed: {}", command, e);
                Completion::failed(e)
            }
        }
    }

    /// Validate buffers and run one command. Returns output bytes written.
    fn execute(
        &self,
        command: Command,
        input: Option<&[u8]>,
        output: Option<&mut [u8]>,
    ) -> Result<usize, DriverError> {
        match command {
            Command::AddModule => {
                let module = input
                    .filter(|bytes| !bytes.is_empty())
                    .ok_or(BufferError::MissingInput(command))?;
                self.lifecycle.add_module(module)?;
                Ok(0)
            }
            Command::LoadVmm => self.lifecycle.load().map(|()| 0),
            Command::UnloadVmm => self.lifecycle.unload().map(|()| 0),
            Command::StartVmm => self.lifecycle.start().map(|()| 0),
            Command::StopVmm => self.lifecycle.stop().map(|()| 0),
            Command::DumpVmm => {
                let out = output.ok_or(BufferError::MissingOutput(command))?;
                if out.len() != DESCRIPTOR_SIZE {
                    return Err(BufferError::OutputSize {
                        command,
                        expected: DESCRIPTOR_SIZE,
                        actual: out.len(),
                    }
                    .into());
                }
                self.lifecycle.dump(self.vcpu.current(), out)
            }
            Command::VmmStatus => {
                let Some(out) = output else {
                    return self.lifecycle.status(None).map(|()| 0);
                };
                let slot = output_slot::<8>(command, out)?;
                let mut status = 0;
                self.lifecycle.status(Some(&mut status))?;
                *slot = status.to_le_bytes();
                Ok(slot.len())
            }
            Command::SetVcpuId => {
                let id = input
                    .map(|bytes| input_value::<8>(command, bytes).map(u64::from_le_bytes))
                    .transpose()?;
                self.vcpu.set_current(id).map(|()| 0)
            }
        }
    }
}

fn input_value<const N: usize>(command: Command, bytes: &[u8]) -> Result<[u8; N], BufferError> {
    bytes.try_into().map_err(|_| BufferError::InputSize {
        command,
        expected: N,
        actual: bytes.len(),
    })
}

fn output_slot<const N: usize>(
    command: Command,
    out: &mut [u8],
) -> Result<&mut [u8; N], BufferError> {
    let actual = out.len();
    out.try_into().map_err(|_| BufferError::OutputSize {
        command,
        expected: N,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{
        CoreOp, DiagnosticDescriptor, SimulatedCore, VmmState, VMM_LOADED, VMM_RUNNING,
        VMM_UNLOADED,
    };
    use crate::platform::HeapMemory;
    use std::sync::Arc;
    use std::thread;

    type TestDispatcher = Dispatcher<Arc<SimulatedCore>, HeapMemory>;

    fn setup(max_modules: usize) -> (TestDispatcher, Arc<SimulatedCore>, HeapMemory) {
        let core = Arc::new(SimulatedCore::new(4));
        let memory = HeapMemory::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&core),
            memory.clone(),
            &DriverConfig::with_max_modules(max_modules),
        );
        (dispatcher, core, memory)
    }

    fn send(dispatcher: &TestDispatcher, mut request: IoRequest) -> IoRequest {
        dispatcher.handle(&mut request);
        request
    }

    fn status(dispatcher: &TestDispatcher) -> i64 {
        let request = send(dispatcher, IoRequest::new(IOCTL_VMM_STATUS).with_output(8));
        assert!(request.completion().unwrap().is_success());
        i64::from_le_bytes(request.output().try_into().unwrap())
    }

    fn run(dispatcher: &TestDispatcher, code: u32) -> Completion {
        send(dispatcher, IoRequest::new(code)).take_completion().unwrap()
    }

    fn add(dispatcher: &TestDispatcher, module: &[u8]) -> Completion {
        let request = IoRequest::new(IOCTL_ADD_MODULE).with_input(module);
        send(dispatcher, request).take_completion().unwrap()
    }

    #[test]
    fn test_control_codes() {
        assert_eq!(IOCTL_ADD_MODULE, 0xF00D_A005);
        assert_eq!(IOCTL_LOAD_VMM, 0xF00D_2008);
        assert_eq!(IOCTL_DUMP_VMM, 0xF00D_601A);
        for command in Command::ALL {
            assert_eq!(Command::from_code(command.code()), Some(command));
        }
    }

    #[test]
    fn test_full_session() {
        let (dispatcher, _, memory) = setup(4);
        assert_eq!(status(&dispatcher), VMM_UNLOADED);

        let completion = add(&dispatcher, &[0x90; 128]);
        assert_eq!(completion.status_code(), 0);
        assert_eq!(completion.bytes_written(), 0);

        assert!(run(&dispatcher, IOCTL_LOAD_VMM).is_success());
        assert_eq!(status(&dispatcher), VMM_LOADED);
        assert!(run(&dispatcher, IOCTL_START_VMM).is_success());
        assert_eq!(status(&dispatcher), VMM_RUNNING);
        assert!(run(&dispatcher, IOCTL_STOP_VMM).is_success());
        assert!(run(&dispatcher, IOCTL_UNLOAD_VMM).is_success());
        assert_eq!(status(&dispatcher), VMM_UNLOADED);
        assert_eq!(memory.live_regions(), 0);
    }

    #[test]
    fn test_capacity_scenario() {
        let (dispatcher, _, _) = setup(4);
        for count in 1..=4 {
            assert!(add(&dispatcher, &[count as u8; 32]).is_success());
            assert_eq!(dispatcher.lifecycle().module_count(), count);
        }

        let completion = add(&dispatcher, &[5; 32]);
        assert!(matches!(
            completion.error(),
            Some(DriverError::CapacityExceeded { max: 4 })
        ));
        assert_eq!(dispatcher.lifecycle().module_count(), 4);
    }

    #[test]
    fn test_start_failure_scenario() {
        let (dispatcher, core, _) = setup(4);
        add(&dispatcher, &[1; 8]);
        assert!(run(&dispatcher, IOCTL_LOAD_VMM).is_success());

        core.fail_next(CoreOp::Start);
        let completion = run(&dispatcher, IOCTL_START_VMM);
        assert!(matches!(completion.error(), Some(DriverError::StartFailure(_))));
        assert_eq!(core.calls(CoreOp::Stop), 1);
        assert_ne!(status(&dispatcher), VMM_RUNNING);
        assert_eq!(dispatcher.lifecycle().module_count(), 1);

        assert!(run(&dispatcher, IOCTL_START_VMM).is_success());
        assert_eq!(status(&dispatcher), VMM_RUNNING);
    }

    #[test]
    fn test_unload_empty_scenario() {
        let (dispatcher, _, _) = setup(4);
        assert!(run(&dispatcher, IOCTL_UNLOAD_VMM).is_success());
        assert_eq!(dispatcher.lifecycle().module_count(), 0);
        assert_eq!(dispatcher.lifecycle().state(), VmmState::Unloaded);
    }

    #[test]
    fn test_unknown_code_scenario() {
        let (dispatcher, core, memory) = setup(4);
        add(&dispatcher, &[1; 8]);
        let journal = core.journal();

        let request = send(
            &dispatcher,
            IoRequest::new(0xDEAD_BEEF).with_input(&[1; 8]).with_output(64),
        );
        let completion = request.completion().unwrap();
        assert!(matches!(
            completion.error(),
            Some(DriverError::InvalidCommand(0xDEAD_BEEF))
        ));
        assert_eq!(completion.bytes_written(), 0);
        assert!(request.output().is_empty());

        assert_eq!(core.journal(), journal);
        assert_eq!(dispatcher.lifecycle().module_count(), 1);
        assert_eq!(memory.total_allocs(), 1);
    }

    #[test]
    fn test_load_failure_clears_registry() {
        let (dispatcher, core, memory) = setup(8);
        for i in 0..5u8 {
            add(&dispatcher, &[i; 8]);
        }

        core.fail_next(CoreOp::Load);
        let completion = run(&dispatcher, IOCTL_LOAD_VMM);
        assert!(matches!(completion.error(), Some(DriverError::LoadFailure(_))));
        assert_eq!(dispatcher.lifecycle().module_count(), 0);
        assert_eq!(dispatcher.lifecycle().state(), VmmState::Unloaded);
        assert_eq!(memory.live_regions(), 0);
    }

    #[test]
    fn test_status_without_output() {
        let (dispatcher, core, _) = setup(4);
        let completion = run(&dispatcher, IOCTL_VMM_STATUS);
        assert!(matches!(
            completion.error(),
            Some(DriverError::InvalidArgument(_))
        ));
        assert!(core.journal().is_empty());
    }

    #[test]
    fn test_status_wrong_size() {
        let (dispatcher, _, _) = setup(4);
        let request = send(&dispatcher, IoRequest::new(IOCTL_VMM_STATUS).with_output(4));
        assert!(matches!(
            request.completion().unwrap().error(),
            Some(DriverError::BufferValidationFailure(BufferError::OutputSize {
                expected: 8,
                actual: 4,
                ..
            }))
        ));
    }

    #[test]
    fn test_add_module_without_input() {
        let (dispatcher, _, memory) = setup(4);
        let completion = run(&dispatcher, IOCTL_ADD_MODULE);
        assert!(matches!(
            completion.error(),
            Some(DriverError::BufferValidationFailure(BufferError::MissingInput(
                Command::AddModule
            )))
        ));
        assert_eq!(memory.total_allocs(), 0);
    }

    #[test]
    fn test_set_vcpuid_validation() {
        let (dispatcher, _, _) = setup(4);

        let completion = run(&dispatcher, IOCTL_SET_VCPUID);
        assert!(matches!(
            completion.error(),
            Some(DriverError::InvalidArgument(_))
        ));

        let request = IoRequest::new(IOCTL_SET_VCPUID).with_input(&[1, 2, 3]);
        let request = send(&dispatcher, request);
        assert!(matches!(
            request.completion().unwrap().error(),
            Some(DriverError::BufferValidationFailure(BufferError::InputSize {
                expected: 8,
                actual: 3,
                ..
            }))
        ));
        assert_eq!(dispatcher.vcpu().current(), 0);
    }

    #[test]
    fn test_dump_targets_latest_vcpu() {
        let (dispatcher, _, _) = setup(4);
        add(&dispatcher, &[1; 8]);
        run(&dispatcher, IOCTL_LOAD_VMM);
        run(&dispatcher, IOCTL_START_VMM);

        for vcpuid in [2u64, 1, 3] {
            let set = send(
                &dispatcher,
                IoRequest::new(IOCTL_SET_VCPUID).with_input(&vcpuid.to_le_bytes()),
            );
            assert!(set.completion().unwrap().is_success());

            let request = IoRequest::new(IOCTL_DUMP_VMM).with_output(DESCRIPTOR_SIZE);
            let dump = send(&dispatcher, request);
            assert_eq!(dump.completion().unwrap().bytes_written(), DESCRIPTOR_SIZE);

            let descriptor = DiagnosticDescriptor::from_bytes(dump.output()).unwrap();
            let text = String::from_utf8(descriptor.contents()).unwrap();
            let prefix = format!("vcpu{}: ", vcpuid);
            assert!(text.lines().all(|line| line.starts_with(&prefix)), "{}", text);
        }
    }

    #[test]
    fn test_dump_unavailable() {
        let (dispatcher, _, _) = setup(4);
        let request = IoRequest::new(IOCTL_DUMP_VMM).with_output(DESCRIPTOR_SIZE);
        let dump = send(&dispatcher, request);
        let completion = dump.completion().unwrap();
        assert!(matches!(
            completion.error(),
            Some(DriverError::DumpUnavailable { .. })
        ));
        assert_eq!(completion.bytes_written(), 0);

        let dump = send(&dispatcher, IoRequest::new(IOCTL_DUMP_VMM).with_output(16));
        assert!(matches!(
            dump.completion().unwrap().error(),
            Some(DriverError::BufferValidationFailure(_))
        ));
    }

    #[test]
    fn test_retrieval_failure() {
        let (dispatcher, core, _) = setup(4);
        let request = send(
            &dispatcher,
            IoRequest::new(IOCTL_ADD_MODULE)
                .with_input(&[1; 8])
                .with_retrieval_failure(),
        );
        assert!(matches!(
            request.completion().unwrap().error(),
            Some(DriverError::BufferValidationFailure(BufferError::Retrieval(_)))
        ));
        assert!(core.journal().is_empty());
    }

    #[test]
    fn test_concurrent_adds() {
        let (dispatcher, core, memory) = setup(16);
        let dispatcher = Arc::new(dispatcher);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    let mut accepted = 0usize;
                    for i in 0..4u8 {
                        if add(&dispatcher, &[t * 16 + i; 64]).is_success() {
                            accepted += 1;
                        }
                        send(&dispatcher, IoRequest::new(IOCTL_VMM_STATUS).with_output(8));
                    }
                    accepted
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 16);
        assert_eq!(dispatcher.lifecycle().module_count(), 16);
        assert_eq!(memory.live_regions(), 16);
        assert_eq!(core.registered_modules(), 16);

        // Every module is intact: each image is one repeated byte
        dispatcher.lifecycle().with_registry(|registry| {
            for module in registry.iter() {
                let bytes = module.as_bytes();
                assert!(bytes.iter().all(|&b| b == bytes[0]));
            }
        });
    }

    #[test]
    fn test_concurrent_lifecycle() {
        let (dispatcher, _, memory) = setup(8);
        let dispatcher = Arc::new(dispatcher);
        let codes = [IOCTL_LOAD_VMM, IOCTL_START_VMM, IOCTL_STOP_VMM, IOCTL_UNLOAD_VMM];

        let handles: Vec<_> = (0..4)
            .map(|t: u8| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    for round in 0..20 {
                        add(&dispatcher, &[t; 16]);
                        run(&dispatcher, codes[(round + t as usize) % codes.len()]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever interleaving happened, a final stop + unload leaves nothing behind
        run(&dispatcher, IOCTL_STOP_VMM);
        run(&dispatcher, IOCTL_UNLOAD_VMM);
        assert_eq!(dispatcher.lifecycle().state(), VmmState::Unloaded);
        assert_eq!(memory.live_regions(), 0);
    }
}
