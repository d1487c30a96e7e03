//! vmctl - manage one GPU VM per cloud provider from the command line.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use vmctl::descriptor::VmDescriptor;
use vmctl::providers::{self, InstanceSummary, ProviderKind};
use vmctl::state::DEFAULT_STATE_DIR;
use vmctl::{
    CommandLog, CommandRunner, JsonFileStore, LogConfig, Probe, RegionCache, ShellRunner,
    StateLayout, VmController, VmError,
};

/// vmctl - Create, start, stop and delete a GPU VM on AWS, Alibaba, GCP or Azure.
#[derive(Parser)]
#[command(name = "vmctl", version)]
#[command(about = "Manage the lifecycle of a single GPU VM across cloud providers")]
struct Cli {
    /// State root (descriptor, region cache, command log).
    #[arg(long, env = "VMCTL_STATE_DIR", default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    /// Override every provider wait ceiling, in seconds.
    #[arg(long, env = "VMCTL_TIMEOUT", global = true)]
    timeout: Option<u64>,

    /// Region (zone on GCP, location on Azure).
    #[arg(long, env = "VMCTL_REGION", global = true)]
    region: Option<String>,

    /// Machine size.
    #[arg(long, env = "VMCTL_INSTANCE_TYPE", global = true)]
    instance_type: Option<String>,

    /// Image name.
    #[arg(long, env = "VMCTL_IMAGE", global = true)]
    image: Option<String>,

    /// SSH login user.
    #[arg(long, env = "VMCTL_USER", global = true)]
    user: Option<String>,

    /// Key pair name.
    #[arg(long, env = "VMCTL_KEY_NAME", global = true)]
    key_name: Option<String>,

    /// Directory holding the key files (trailing slash included).
    #[arg(long, env = "VMCTL_KEY_PATH", global = true)]
    key_path: Option<String>,

    /// VM name.
    #[arg(long, env = "VMCTL_NAME", global = true)]
    name: Option<String>,

    /// Security group name.
    #[arg(long, env = "VMCTL_NSG_NAME", global = true)]
    nsg_name: Option<String>,

    /// Provider-specific option, repeatable (`--opt accelerator_count=1`).
    #[arg(long = "opt", value_name = "KEY=VALUE", value_parser = parse_option, global = true)]
    options: Vec<(String, String)>,

    /// Cloud provider.
    #[arg(value_enum)]
    provider: ProviderKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the VM and wait until it answers SSH.
    Create,

    /// Start a stopped VM.
    Start,

    /// Stop a running VM.
    Stop,

    /// Restart a running VM.
    Restart,

    /// Delete the VM.
    Delete {
        /// Also delete the security group (best-effort).
        #[arg(long)]
        with_nsg: bool,
    },

    /// Print the run state.
    Status,

    /// Print the recorded VM and security group.
    Show,

    /// Print the public address.
    #[command(name = "showip")]
    ShowIp,

    /// Run a command on the VM, or open a shell when none is given.
    Ssh {
        /// Remote command.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Ping the VM.
    Ping,

    /// Report kernel, userspace and total boot time.
    #[command(name = "boottime")]
    BootTime,

    /// List running instances in the account.
    #[command(name = "showrunning")]
    ShowRunning,

    /// List regions (cached until `clean`).
    #[command(name = "showregions")]
    ShowRegions,

    /// List security groups.
    #[command(name = "shownsg")]
    ShowNsg,

    /// Create the configured security group if absent.
    #[command(name = "creatensg")]
    CreateNsg,

    /// Delete the recorded security group.
    #[command(name = "deletensg")]
    DeleteNsg,

    /// Print the persisted descriptor.
    #[command(name = "showargs")]
    ShowArgs,

    /// Forget local state for this provider.
    Clean,
}

impl Commands {
    /// Commands that never contact the provider.
    fn is_local(&self) -> bool {
        matches!(self, Self::Show | Self::ShowArgs | Self::Clean)
    }
}

fn parse_option(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty option key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests succeed; usage errors are failures.
            let succeeded = !e.use_stderr();
            let _ = e.print();
            return if succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    let log = LogConfig {
        verbosity: cli.verbose,
        json: cli.json,
    };
    if let Err(e) = log.init() {
        eprintln!("WARNING: logging not initialized: {e}");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ERROR: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn overrides(cli: &Cli) -> VmDescriptor {
    let mut vm = VmDescriptor {
        name: cli.name.clone(),
        region: cli.region.clone(),
        instance_type: cli.instance_type.clone(),
        image_name: cli.image.clone(),
        key_name: cli.key_name.clone(),
        key_path: cli.key_path.clone(),
        user: cli.user.clone(),
        security_group_name: cli.nsg_name.clone(),
        ..Default::default()
    };
    for (key, value) in &cli.options {
        vm.set_option(key.clone(), value.clone());
    }
    vm
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let kind = cli.provider;
    let layout = StateLayout::new(&cli.state_dir, kind);

    let log = CommandLog::open(layout.command_log()).with_context(|| {
        format!(
            "Failed to open command log under {}",
            layout.dir().display()
        )
    })?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new(log));

    let provider = providers::build(kind, runner.clone());
    if !cli.command.is_local() && !provider.check_tooling() {
        return Err(VmError::ToolingMissing(kind.binary().to_string()))
            .with_context(|| format!("Install the {kind} CLI and make sure it is on PATH"));
    }

    let store = JsonFileStore::new(layout.descriptor_file());
    let controller = VmController::new(provider, Box::new(Probe::new(runner)), Box::new(store))
        .with_region_cache(RegionCache::new(layout.regions_file()))
        .with_overrides(overrides(&cli))
        .with_timeout(cli.timeout.map(Duration::from_secs));
    debug!(provider = %kind, state_dir = %layout.dir().display(), "Controller ready");

    match cli.command {
        Commands::Create => {
            let vm = with_spinner(format!("Creating {kind} VM"), controller.create()).await?;
            print_vm(&vm);
        }
        Commands::Start => {
            let vm = with_spinner(format!("Starting {kind} VM"), controller.start()).await?;
            print_vm(&vm);
        }
        Commands::Stop => {
            let vm = with_spinner(format!("Stopping {kind} VM"), controller.stop()).await?;
            println!("Stopped {}", vm.id().unwrap_or_default());
        }
        Commands::Restart => {
            let vm = with_spinner(format!("Restarting {kind} VM"), controller.restart()).await?;
            print_vm(&vm);
        }
        Commands::Delete { with_nsg } => {
            with_spinner(format!("Deleting {kind} VM"), controller.delete(with_nsg)).await?;
            println!("Deleted {kind} VM");
        }
        Commands::Status => {
            println!("{}", controller.status().await?);
        }
        Commands::Show => {
            let vm = controller.show()?;
            println!("VM:  {}  {}  {}", opt(vm.name()), opt(vm.id()), opt(vm.ip()));
            println!(
                "NSG: {}  {}",
                opt(vm.security_group_name()),
                opt(vm.security_group_id())
            );
        }
        Commands::ShowIp => {
            println!("{}", controller.show_ip().await?);
        }
        Commands::Ssh { command } => {
            let output = controller.ssh(&command).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            return Ok(exit_code(output.code));
        }
        Commands::Ping => {
            let output = controller.ping().await?;
            print!("{}", output.stdout);
            return Ok(exit_code(output.code));
        }
        Commands::BootTime => {
            let boot = controller.boot_time().await?;
            println!("kernel:    {}", boot.kernel);
            println!("userspace: {}", boot.userspace);
            println!("total:     {}", boot.total);
        }
        Commands::ShowRunning => {
            print_running(&controller.show_running().await?);
        }
        Commands::ShowRegions => {
            for region in controller.show_regions().await? {
                println!("{region}");
            }
        }
        Commands::ShowNsg => {
            for group in controller.show_security_groups().await? {
                println!(
                    "{:<24} {:<24} {}",
                    group.id,
                    group.name,
                    group.description.unwrap_or_default()
                );
                for rule in group.rules {
                    println!(
                        "    {:?} {} {} {} {}",
                        rule.direction,
                        rule.protocol,
                        rule.port_range(),
                        rule.cidr,
                        rule.description
                    );
                }
            }
        }
        Commands::CreateNsg => {
            println!("{}", controller.create_security_group().await?);
        }
        Commands::DeleteNsg => match controller.delete_security_group().await? {
            Some(id) => println!("Deleted {id}"),
            None => println!("No security group to delete"),
        },
        Commands::ShowArgs => match controller.show_args()? {
            Some(json) => println!("{json}"),
            None => println!("No {kind} VM arguments recorded"),
        },
        Commands::Clean => {
            controller.clean().await?;
            println!("Cleaned {kind} state");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Drive `fut` while a spinner ticks on stderr (hidden when not a terminal).
async fn with_spinner<T, F>(message: String, fut: F) -> Result<T, VmError>
where
    F: Future<Output = Result<T, VmError>>,
{
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]") {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = fut.await;
    spinner.finish_and_clear();
    result
}

fn opt(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

/// Remote exit statuses collapse to success or failure.
fn exit_code(code: i32) -> ExitCode {
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_vm(vm: &VmDescriptor) {
    println!("id:   {}", opt(vm.id()));
    println!("name: {}", opt(vm.name()));
    println!("ip:   {}", opt(vm.ip()));
    if let Some(dest) = vm.ssh_destination() {
        match vm.key_file() {
            Some(key) => println!("ssh:  ssh -i {key} {dest}"),
            None => println!("ssh:  ssh {dest}"),
        }
    }
}

fn print_running(instances: &[InstanceSummary]) {
    println!(
        "{:<24} {:<28} {:<20} {:<16} {:<10}",
        "ID", "NAME", "TYPE", "ZONE", "LAUNCHED"
    );
    println!("{}", "-".repeat(100));
    for i in instances {
        println!(
            "{:<24} {:<28} {:<20} {:<16} {:<10}",
            i.id, i.name, i.instance_type, i.zone, i.launched
        );
    }
}
