use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use utils::logging::LOG_DIR_ENV_VAR;
use utils::version;

use crate::lifecycle::DEFAULT_PACKER_TEMPLATE;
use crate::platform::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    #[arg(
        short,
        long,
        global = true,
        env = "CHASI_BOD_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the platform document"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        global = true,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubeconfig for the Host cluster; read from the first master when unset"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = LOG_DIR_ENV_VAR,
        value_hint = clap::ValueHint::DirPath,
        help = "Also write daily rolling log files into this directory"
    )]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the bootable platform image
    Build(BuildArgs),
    /// Provision the Host cluster and every configured vcluster
    Deploy,
    /// Roll the running platform forward to the platform document
    Upgrade(UpgradeArgs),
    /// Add and remove Host nodes to match the platform document
    Scale(ScaleArgs),
    /// Back up etcd and node configuration
    Backup,
    /// Restore etcd from the newest snapshot in a location
    Restore(RestoreArgs),
    /// Report platform health
    Healthz(HealthzArgs),
    /// Manage tenant vclusters
    #[command(subcommand)]
    Vcluster(VClusterCommands),
    /// Manage business applications
    #[command(subcommand)]
    App(AppCommands),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[arg(
        long,
        env = "CHASI_BOD_PACKER_TEMPLATE",
        default_value = DEFAULT_PACKER_TEMPLATE,
        value_hint = clap::ValueHint::FilePath,
        help = "Packer template describing the image build"
    )]
    pub template: PathBuf,
}

#[derive(Args, Debug)]
pub struct UpgradeArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Document describing the running platform, defaults to <config>.current.yaml"
    )]
    pub current: Option<PathBuf>,

    #[arg(
        long,
        env = "CHASI_BOD_PACKER_TEMPLATE",
        default_value = DEFAULT_PACKER_TEMPLATE,
        value_hint = clap::ValueHint::FilePath
    )]
    pub template: PathBuf,
}

#[derive(Args, Debug)]
pub struct ScaleArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Document describing the running platform, defaults to <config>.current.yaml"
    )]
    pub current: Option<PathBuf>,

    #[arg(long, help = "Leave the operating system of removed nodes untouched")]
    pub keep_os: bool,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Directory holding etcd snapshots
    pub location: String,
}

#[derive(Args, Debug)]
pub struct HealthzArgs {
    #[arg(
        long,
        value_name = "ADDR",
        help = "Keep serving /healthz on this address until interrupted"
    )]
    pub serve: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum VClusterCommands {
    /// Create a vcluster defined in the platform document
    Create { name: String },
    /// Delete a vcluster
    Delete { name: String },
    /// List the vclusters present on the Host cluster
    List,
    /// Print or write the kubeconfig of a vcluster
    Connect {
        name: String,
        #[arg(short, long, value_hint = clap::ValueHint::FilePath)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum AppCommands {
    /// Deploy an application into its vcluster
    Deploy { name: String },
    /// Upgrade a deployed application
    Upgrade { name: String },
    /// Delete an application
    Delete { name: String },
    /// Show the status of an application
    Status { name: String },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_config_flag_applies_after_subcommand() {
        let cli = Cli::try_parse_from(["chasi-bod", "deploy", "-c", "/tmp/platform.yaml"])
            .expect("should parse");

        assert_eq!(cli.global.config, PathBuf::from("/tmp/platform.yaml"));
        assert!(matches!(cli.command, Commands::Deploy));
    }

    #[test]
    fn scale_flags_parse() {
        let cli = Cli::try_parse_from([
            "chasi-bod",
            "scale",
            "--current",
            "/tmp/old.yaml",
            "--keep-os",
        ])
        .expect("should parse");

        let Commands::Scale(args) = cli.command else {
            panic!("should be scale");
        };
        assert_eq!(args.current, Some(PathBuf::from("/tmp/old.yaml")));
        assert!(args.keep_os);
    }

    #[test]
    fn nested_subcommands_parse() {
        let cli =
            Cli::try_parse_from(["chasi-bod", "vcluster", "connect", "biz-a", "-o", "kc.yaml"])
                .expect("should parse");
        assert!(matches!(
            cli.command,
            Commands::Vcluster(VClusterCommands::Connect { ref name, output: Some(_) }) if name == "biz-a"
        ));

        let cli = Cli::try_parse_from(["chasi-bod", "app", "status", "web"]).expect("should parse");
        assert!(matches!(
            cli.command,
            Commands::App(AppCommands::Status { ref name }) if name == "web"
        ));
    }

    #[test]
    fn restore_requires_location() {
        assert!(Cli::try_parse_from(["chasi-bod", "restore"]).is_err());
    }
}
