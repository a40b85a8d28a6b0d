//! egs-tool command line.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use egs_core::constants::SERVICE_ID;
use egs_core::transport::VmTarget;

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for egs_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => egs_core::LogFormat::Text,
            CliLogFormat::Json => egs_core::LogFormat::Json,
        }
    }
}

/// egs-tool - talk to eryph guest services from the host.
#[derive(Debug, Parser)]
#[command(
    name = "egs-tool",
    version,
    about = "egs-tool - talk to eryph guest services from the host"
)]
pub struct Cli {
    /// Target VM: a Hyper-V VM id or a vsock context id
    #[arg(long = "vm", value_name = "VM")]
    pub vm: VmTarget,

    /// Service id of the guest service
    #[arg(long = "service-id", default_value = SERVICE_ID, value_name = "UUID")]
    pub service_id: Uuid,

    /// Client key (OpenSSH private key)
    #[arg(short = 'k', long = "key", value_name = "FILE")]
    pub key: PathBuf,

    /// Expected guest host key (OpenSSH public key)
    #[arg(long = "host-key", value_name = "FILE")]
    pub host_key: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text", global = true)]
    pub log_format: CliLogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Copy a local file into the guest
    UploadFile {
        /// Local file
        source: PathBuf,
        /// Guest directory
        base_path: String,
        /// Path below the guest directory; defaults to the source file name
        path: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },

    /// Copy a guest file to the host
    DownloadFile {
        /// Guest file
        source: String,
        /// Local file
        target: PathBuf,
    },

    /// Copy a local directory into the guest
    UploadDirectory(DirectoryArgs),

    /// Copy a guest directory to the host
    DownloadDirectory(DirectoryArgs),

    /// List a guest directory
    List {
        path: String,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a command in the guest
    Exec {
        /// Command line
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Args)]
pub struct DirectoryArgs {
    pub source: String,
    pub target: String,
    #[arg(long)]
    pub overwrite: bool,
    /// Include subdirectories
    #[arg(short = 'r', long)]
    pub recursive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_file_defaults() {
        let cli = Cli::parse_from([
            "egs-tool", "--vm", "3", "--key", "id_egs", "upload-file", "a.txt", "/tmp",
        ]);
        assert_eq!(cli.vm, VmTarget::Cid(3));
        assert_eq!(cli.service_id, Uuid::parse_str(SERVICE_ID).unwrap());
        assert!(cli.host_key.is_none());
        match cli.command {
            Command::UploadFile {
                source,
                base_path,
                path,
                overwrite,
            } => {
                assert_eq!(source, PathBuf::from("a.txt"));
                assert_eq!(base_path, "/tmp");
                assert!(path.is_none());
                assert!(!overwrite);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn directory_flags_and_global_verbosity() {
        let vm = Uuid::new_v4().to_string();
        let cli = Cli::parse_from([
            "egs-tool",
            "--vm",
            &vm,
            "--key",
            "id_egs",
            "download-directory",
            "/var/log",
            "logs",
            "-r",
            "--overwrite",
            "-vv",
        ]);
        assert!(matches!(cli.vm, VmTarget::HyperV(_)));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::DownloadDirectory(args) => {
                assert!(args.recursive);
                assert!(args.overwrite);
                assert_eq!(args.target, "logs");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn exec_collects_trailing_words() {
        let cli = Cli::parse_from(["egs-tool", "--vm", "3", "--key", "k", "exec", "ls", "-la", "/"]);
        match cli.command {
            Command::Exec { command } => assert_eq!(command.join(" "), "ls -la /"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn key_is_required() {
        assert!(Cli::try_parse_from(["egs-tool", "--vm", "3", "list", "/"]).is_err());
    }
}
