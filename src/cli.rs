use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cocoon", version, about = "Cocoon - MicroVM engine")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Commands,
}

/// Global configuration flags, each with a COCOON_* environment fallback.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Root data directory (blobs, indexes, firmware)
    #[arg(long, global = true, env = "COCOON_ROOT_DIR", default_value = "/var/lib/cocoon")]
    pub root_dir: PathBuf,

    /// Runtime directory (sockets, PID files, disks)
    #[arg(long, global = true, env = "COCOON_RUN_DIR", default_value = "/var/lib/cocoon/run")]
    pub run_dir: PathBuf,

    /// Log directory
    #[arg(long, global = true, env = "COCOON_LOG_DIR", default_value = "/var/log/cocoon")]
    pub log_dir: PathBuf,

    /// Path or name of the cloud-hypervisor binary
    #[arg(long, global = true, env = "COCOON_CH_BINARY", default_value = "cloud-hypervisor")]
    pub ch_binary: String,

    /// Seconds to wait for a guest to honor ACPI power-button
    #[arg(long, global = true, env = "COCOON_STOP_TIMEOUT", default_value_t = 30)]
    pub stop_timeout: u64,

    /// Worker pool size for image pulls (defaults to logical CPUs)
    #[arg(long, global = true, env = "COCOON_POOL_SIZE")]
    pub pool_size: Option<usize>,

    /// CNI plugin config directory
    #[arg(long, global = true, env = "COCOON_CNI_CONF_DIR", default_value = "/etc/cni/net.d")]
    pub cni_conf_dir: PathBuf,

    /// CNI plugin binary directory
    #[arg(long, global = true, env = "COCOON_CNI_BIN_DIR", default_value = "/opt/cni/bin")]
    pub cni_bin_dir: PathBuf,

    /// Root password injected into cloudimg VMs via cloud-init
    #[arg(long, global = true, env = "COCOON_ROOT_PASSWORD")]
    pub root_password: Option<String>,

    /// DNS servers for VMs, comma or semicolon separated
    #[arg(long, global = true, env = "COCOON_DNS", default_value = "8.8.8.8,1.1.1.1")]
    pub dns: String,
}

impl GlobalArgs {
    pub fn to_config(&self) -> crate::config::Config {
        let defaults = crate::config::Config::default();
        crate::config::Config {
            root_dir: self.root_dir.clone(),
            run_dir: self.run_dir.clone(),
            log_dir: self.log_dir.clone(),
            ch_binary: self.ch_binary.clone(),
            stop_timeout_secs: self.stop_timeout,
            pool_size: self.pool_size.unwrap_or(defaults.pool_size),
            cni_conf_dir: self.cni_conf_dir.clone(),
            cni_bin_dir: self.cni_bin_dir.clone(),
            root_password: self.root_password.clone(),
            dns: self.dns.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a VM from an image
    Create(CreateArgs),
    /// Create and start a VM from an image
    Run(CreateArgs),
    /// Start VM(s)
    Start(RefsArgs),
    /// Stop running VM(s)
    Stop(RefsArgs),
    /// Delete VM(s)
    Rm(RmArgs),
    /// List VMs with status
    Ps,
    /// Show one VM as JSON
    Inspect(RefArgs),
    /// Attach an interactive console to a running VM
    Console(ConsoleArgs),
    /// Pull OCI image(s) or cloud image URL(s)
    Pull(RefsArgs),
    /// List local images
    Images,
    /// Delete image(s) by ref or digest
    Rmi(RefsArgs),
    /// Remove unreferenced blobs, boot files, VM dirs, and netns
    Gc,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Image reference (OCI ref or cloud image URL)
    pub image: String,

    /// VM name (defaults to cocoon-IMAGE)
    #[arg(long)]
    pub name: Option<String>,

    /// Boot CPUs
    #[arg(long, default_value_t = 2)]
    pub cpu: u32,

    /// Memory size (e.g. 1G, 512M)
    #[arg(long, default_value = "1G")]
    pub memory: String,

    /// COW disk size
    #[arg(long, default_value = "10G")]
    pub storage: String,

    /// Number of NICs (0 disables networking)
    #[arg(long, default_value_t = 1)]
    pub nics: usize,
}

#[derive(Args, Debug)]
pub struct RefsArgs {
    /// VM or image references
    #[arg(required = true)]
    pub refs: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RefArgs {
    /// VM reference (id, name, or id prefix)
    pub vm: String,
}

#[derive(Args, Debug)]
pub struct RmArgs {
    /// VM references
    #[arg(required = true)]
    pub refs: Vec<String>,

    /// Stop running VMs before deleting them
    #[arg(long, short)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConsoleArgs {
    /// VM reference
    pub vm: String,

    /// Escape character (single char or ^X caret notation)
    #[arg(long, default_value = "^]")]
    pub escape_char: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_run_with_sizes() {
        let cli = Cli::parse_from([
            "cocoon", "run", "ubuntu:24.04", "--name", "web", "--cpu", "4", "--memory", "2G",
        ]);
        match cli.cmd {
            Commands::Run(args) => {
                assert_eq!(args.image, "ubuntu:24.04");
                assert_eq!(args.name.as_deref(), Some("web"));
                assert_eq!(args.cpu, 4);
                assert_eq!(args.memory, "2G");
                assert_eq!(args.storage, "10G");
                assert_eq!(args.nics, 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rm_force_flag() {
        let cli = Cli::parse_from(["cocoon", "rm", "-f", "web", "db"]);
        match cli.cmd {
            Commands::Rm(args) => {
                assert!(args.force);
                assert_eq!(args.refs, vec!["web", "db"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_reach_config() {
        let cli = Cli::parse_from(["cocoon", "--root-dir", "/data/cocoon", "ps"]);
        let conf = cli.global.to_config();
        assert_eq!(conf.root_dir, PathBuf::from("/data/cocoon"));
        assert_eq!(conf.stop_timeout_secs, 30);
    }

    #[test]
    fn refs_are_required() {
        assert!(Cli::try_parse_from(["cocoon", "stop"]).is_err());
        assert!(Cli::try_parse_from(["cocoon", "pull"]).is_err());
    }
}
