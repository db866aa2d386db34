//! hvctl - drive the hypervisor driver control plane from user space.
//!
//! Runs a list of driver commands, in order, through the same dispatcher the
//! host request queue uses. The hypervisor core is simulated in process, so
//! the full module/lifecycle/dump path can be exercised without privileges.

use clap::{Parser, ValueEnum};
use hvdriver::config::DEFAULT_MAX_MODULES;
use hvdriver::hypervisor::{
    CoreOp, DiagnosticDescriptor, SimulatedCore, VmmState, DESCRIPTOR_SIZE,
};
use hvdriver::{
    Command, Completion, Dispatcher, DriverConfig, HeapMemory, IoRequest, MemoryServices,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "hvctl")]
#[command(about = "Drive the hypervisor driver control plane against a simulated core")]
struct Args {
    /// Module image to add (repeatable, added in the order given)
    #[arg(short, long = "module")]
    modules: Vec<PathBuf>,

    /// Maximum number of modules the driver accepts
    #[arg(long, default_value_t = DEFAULT_MAX_MODULES)]
    max_modules: usize,

    /// Number of vCPUs the simulated core runs
    #[arg(long, default_value = "1")]
    vcpus: u64,

    /// vCPU selected by the `vcpu` step
    #[arg(long, default_value = "0")]
    vcpu: u64,

    /// Make the next call of this core operation fail (repeatable)
    #[arg(long, value_enum)]
    fail: Vec<Fault>,

    /// Back modules with heap memory instead of executable mappings
    #[arg(long)]
    heap: bool,

    /// Commands to run in order (default: add load start status dump stop unload)
    #[arg(value_enum)]
    steps: Vec<Step>,
}

/// One driver command.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Step {
    Add,
    Load,
    Start,
    Stop,
    Unload,
    Status,
    Vcpu,
    Dump,
}

/// Core operation to fail.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Fault {
    Add,
    Load,
    Unload,
    Start,
    Stop,
    Dump,
}

impl From<Fault> for CoreOp {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Add => CoreOp::AddModule,
            Fault::Load => CoreOp::Load,
            Fault::Unload => CoreOp::Unload,
            Fault::Start => CoreOp::Start,
            Fault::Stop => CoreOp::Stop,
            Fault::Dump => CoreOp::Dump,
        }
    }
}

const DEFAULT_STEPS: [Step; 7] = [
    Step::Add,
    Step::Load,
    Step::Start,
    Step::Status,
    Step::Dump,
    Step::Stop,
    Step::Unload,
];

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every command succeeded.
fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let mut modules = Vec::with_capacity(args.modules.len());
    for path in &args.modules {
        let bytes = std::fs::read(path)
            .map_err(|e| format!("Failed to read module {}: {}", path.display(), e))?;
        modules.push((path.clone(), bytes));
    }

    let core = Arc::new(SimulatedCore::new(args.vcpus));
    for &fault in &args.fail {
        core.fail_next(fault.into());
    }

    let config = DriverConfig::with_max_modules(args.max_modules);
    log::info!(
        "hvctl: {} modules, {} vCPUs, capacity {}",
        modules.len(),
        args.vcpus,
        config.max_modules
    );

    Ok(run_driver(&args, &modules, core, &config))
}

#[cfg(unix)]
fn run_driver(
    args: &Args,
    modules: &[(PathBuf, Vec<u8>)],
    core: Arc<SimulatedCore>,
    config: &DriverConfig,
) -> bool {
    if args.heap {
        execute(args, modules, &Dispatcher::new(core, HeapMemory::new(), config))
    } else {
        execute(
            args,
            modules,
            &Dispatcher::new(core, hvdriver::MmapMemory::new(), config),
        )
    }
}

#[cfg(not(unix))]
fn run_driver(
    args: &Args,
    modules: &[(PathBuf, Vec<u8>)],
    core: Arc<SimulatedCore>,
    config: &DriverConfig,
) -> bool {
    execute(args, modules, &Dispatcher::new(core, HeapMemory::new(), config))
}

fn execute<M: MemoryServices>(
    args: &Args,
    modules: &[(PathBuf, Vec<u8>)],
    dispatcher: &Dispatcher<Arc<SimulatedCore>, M>,
) -> bool {
    let steps: Vec<Step> = if args.steps.is_empty() {
        DEFAULT_STEPS.to_vec()
    } else {
        args.steps.clone()
    };

    let mut all_ok = true;
    for step in steps {
        let ok = match step {
            Step::Add => {
                if modules.is_empty() {
                    log::warn!("add: no modules given (use --module)");
                }
                let mut ok = true;
                for (path, bytes) in modules {
                    let request = IoRequest::new(Command::AddModule.code()).with_input(bytes);
                    let request = submit(dispatcher, request);
                    ok &= report(&format!("add {}", path.display()), &request);
                }
                ok
            }
            Step::Load => simple(dispatcher, "load", Command::LoadVmm),
            Step::Start => simple(dispatcher, "start", Command::StartVmm),
            Step::Stop => simple(dispatcher, "stop", Command::StopVmm),
            Step::Unload => simple(dispatcher, "unload", Command::UnloadVmm),
            Step::Status => {
                let request = IoRequest::new(Command::VmmStatus.code()).with_output(8);
                let request = submit(dispatcher, request);
                let ok = report("status", &request);
                if let Ok(bytes) = <[u8; 8]>::try_from(request.output()) {
                    let code = i64::from_le_bytes(bytes);
                    match VmmState::from_status_code(code) {
                        Some(state) => println!("  vmm is {}", state),
                        None => println!("  vmm status code {}", code),
                    }
                }
                ok
            }
            Step::Vcpu => {
                let request = IoRequest::new(Command::SetVcpuId.code())
                    .with_input(&args.vcpu.to_le_bytes());
                report(&format!("vcpu {}", args.vcpu), &submit(dispatcher, request))
            }
            Step::Dump => {
                let request = submit(
                    dispatcher,
                    IoRequest::new(Command::DumpVmm.code()).with_output(DESCRIPTOR_SIZE),
                );
                let ok = report("dump", &request);
                if let Some(descriptor) = DiagnosticDescriptor::from_bytes(request.output()) {
                    for line in String::from_utf8_lossy(&descriptor.contents()).lines() {
                        println!("  {}", line);
                    }
                }
                ok
            }
        };
        all_ok &= ok;
    }
    all_ok
}

fn simple<M: MemoryServices>(
    dispatcher: &Dispatcher<Arc<SimulatedCore>, M>,
    label: &str,
    command: Command,
) -> bool {
    report(label, &submit(dispatcher, IoRequest::new(command.code())))
}

fn submit<M: MemoryServices>(
    dispatcher: &Dispatcher<Arc<SimulatedCore>, M>,
    mut request: IoRequest,
) -> IoRequest {
    dispatcher.handle(&mut request);
    request
}

/// Print the outcome of a request and return whether it succeeded.
fn report(label: &str, request: &IoRequest) -> bool {
    match request.completion() {
        Some(completion) if completion.is_success() => {
            println!("{:<24} ok", label);
            true
        }
        Some(completion) => {
            println!("{:<24} {}", label, describe(completion));
            false
        }
        None => {
            println!("{:<24} not completed", label);
            false
        }
    }
}

fn describe(completion: &Completion) -> String {
    match completion.error() {
        Some(e) => format!("failed ({}): {}", completion.status_code(), e),
        None => "ok".to_string(),
    }
}
