//! hvdriver - control plane for an in-memory hypervisor driver.
//!
//! The driver sits between a host request queue and a hypervisor core. It
//! copies extension modules into executable memory, walks the VMM through its
//! load/start/stop/unload lifecycle, tracks which vCPU is selected for
//! diagnostics, and turns every request into exactly one completion.
//!
//! # Architecture
//!
//! ```text
//!   Host request queue (parallel dispatch)
//!          │  HostRequest: control code + buffers
//!          ▼
//! ┌──────────────────┐
//! │    Dispatcher    │  validates buffers, routes codes, completes once
//! └──┬────────────┬──┘
//!    │            │
//!    ▼            ▼
//! ┌──────────┐ ┌────────────────────────────────────┐
//! │  vCPU    │ │ Lifecycle (single lock)            │
//! │ context  │ │  ┌──────────────┐  state machine   │
//! └──────────┘ │  │ ModuleRegistry│  with rollback   │
//!              │  └──────┬───────┘                   │
//!              └─────────┼──────────────┬───────────┘
//!                        ▼              ▼
//!              MemoryServices     HypervisorCore
//!              (RWX regions)      (load/start/dump)
//! ```
//!
//! The memory service and the hypervisor core are traits. [`MmapMemory`]
//! backs modules with anonymous executable mappings; [`SimulatedCore`] stands
//! in for the real core when driving the control plane from user space.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod hypervisor;
pub mod lifecycle;
pub mod platform;
pub mod registry;
pub mod vcpu;

pub use config::DriverConfig;
pub use dispatch::{Command, Completion, Dispatcher, HostRequest, IoRequest};
pub use error::DriverError;
pub use hypervisor::{DiagnosticDescriptor, HypervisorCore, SimulatedCore, VmmState};
pub use lifecycle::Lifecycle;
pub use platform::{ExecRegion, HeapMemory, MemoryServices};
#[cfg(unix)]
pub use platform::MmapMemory;
pub use registry::ModuleRegistry;
pub use vcpu::VcpuContext;
