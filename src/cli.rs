use clap::{Args, Parser, Subcommand};

use crate::merge::VmOverrides;
use crate::validate;
use crate::workload::{Drive, Mount, PortMapping};

#[derive(Parser, Debug)]
#[command(name = "ccvm", about = "Single-instance development VMs on QEMU", version)]
pub struct Cli {
    /// Instance to operate on
    #[arg(long, global = true, default_value = "default", value_parser = validate::parse_name)]
    pub instance: String,

    /// Show debug output on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// VM settings that can be overridden on `create` and `start`.
#[derive(Args, Debug, Clone, Default)]
pub struct VmArgs {
    /// Memory in GiB (0 keeps the current value)
    #[arg(long, value_name = "GIB", default_value_t = 0)]
    pub mem: u32,

    /// Number of vCPUs (0 keeps the current value)
    #[arg(long, default_value_t = 0)]
    pub cpus: u32,

    /// Share a host directory: tag,security_model,path
    #[arg(long = "mount", value_name = "SPEC", value_parser = validate::parse_mount)]
    pub mounts: Vec<Mount>,

    /// Attach a host file as a disk: path,format[,option]*
    #[arg(long = "drive", value_name = "SPEC", value_parser = validate::parse_drive)]
    pub drives: Vec<Drive>,

    /// Forward a host port to the guest: host-guest
    #[arg(long = "port", value_name = "SPEC", value_parser = validate::parse_port)]
    pub ports: Vec<PortMapping>,

    /// Expose the guest serial console on this local TCP port
    #[arg(long = "qemuport", value_name = "PORT", default_value_t = 0)]
    pub qemu_log_port: u16,
}

impl From<VmArgs> for VmOverrides {
    fn from(args: VmArgs) -> Self {
        VmOverrides {
            mem_gib: args.mem,
            cpus: args.cpus,
            qemu_log_port: args.qemu_log_port,
            mounts: args.mounts,
            ports: args.ports,
            drives: args.drives,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and boot a new instance from a workload
    #[command(alias = "prepare")]
    Create {
        /// Workload name (built-in or from the workloads directory)
        #[arg(value_parser = validate::parse_name)]
        workload: String,

        #[command(flatten)]
        vm: VmArgs,

        /// Enable password login on the guest console
        #[arg(long)]
        debug: bool,

        /// Upgrade guest packages on first boot
        #[arg(long, value_name = "true|false", value_parser = validate::parse_package_upgrade)]
        package_upgrade: Option<bool>,
    },

    /// Boot an existing instance
    Start {
        #[command(flatten)]
        vm: VmArgs,
    },

    /// Ask the guest to power down
    Stop,

    /// Kill the VM immediately
    Quit,

    /// Show whether the instance is up and how to reach it
    Status,

    /// Wait for SSH and open a shell in the guest
    Connect,

    /// Stop the VM and remove the instance
    Delete,
}
