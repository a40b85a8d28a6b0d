//! egs-tool binary entry point.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{debug, error};

use egs_core::auth::{LocalSigner, parse_public_key};
use egs_core::error::{Error, Result};
use egs_core::status;
use egs_client::{
    Cli, Command, DirectoryArgs, DirectoryTransferReport, GuestClient, Transfer, download_directory,
    download_file, exec, list_directory, upload_directory, upload_file,
};

fn main() {
    let cli = Cli::parse();

    let log_format = cli.log_format.into();
    if let Err(e) = egs_core::init_logging(cli.verbose, cli.log_file.as_deref(), log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    match rt.block_on(run(cli)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "Operation failed");
            eprintln!("egs-tool: {}", e);
            std::process::exit(1);
        }
    }
}

/// Run the selected command and return the process exit code.
async fn run(cli: Cli) -> Result<i32> {
    let signer = LocalSigner::from_file(&cli.key)?;
    let host_key = match &cli.host_key {
        Some(path) => Some(parse_public_key(&std::fs::read_to_string(path)?)?),
        None => None,
    };

    let client = GuestClient::connect(cli.vm, &cli.service_id, &signer, host_key.as_ref()).await?;
    let result = dispatch(&client, cli.command).await;
    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "Disconnect failed");
    }
    result
}

async fn dispatch(client: &GuestClient, command: Command) -> Result<i32> {
    let session = client.session();
    match command {
        Command::UploadFile {
            source,
            base_path,
            path,
            overwrite,
        } => {
            let path = match path {
                Some(path) => path,
                None => file_name(&source)?,
            };
            let transfer = upload_file(session, &source, &base_path, &path, overwrite).await?;
            Ok(report_transfer("upload", &transfer))
        }
        Command::DownloadFile { source, target } => {
            let transfer = download_file(session, &source, &target).await?;
            Ok(report_transfer("download", &transfer))
        }
        Command::UploadDirectory(DirectoryArgs {
            source,
            target,
            overwrite,
            recursive,
        }) => {
            let report = upload_directory(session, Path::new(&source), &target, overwrite, recursive).await?;
            Ok(report_directory(&report))
        }
        Command::DownloadDirectory(DirectoryArgs {
            source,
            target,
            overwrite,
            recursive,
        }) => {
            let report = download_directory(session, &source, &PathBuf::from(target), overwrite, recursive).await?;
            Ok(report_directory(&report))
        }
        Command::List { path, json } => {
            let listing = list_directory(session, &path).await?;
            if listing.status != status::SUCCESS {
                return Ok(report_status("list", listing.status));
            }
            if json {
                let text = serde_json::to_string_pretty(&listing.entries).map_err(|e| Error::Codec {
                    message: format!("failed to format listing: {e}"),
                })?;
                println!("{}", text);
            } else {
                for entry in &listing.entries {
                    let kind = if entry.is_directory { "d" } else { "-" };
                    println!(
                        "{} {:>12} {} {}",
                        kind,
                        entry.size,
                        entry.last_modified.format("%Y-%m-%d %H:%M:%S"),
                        entry.name
                    );
                }
            }
            Ok(0)
        }
        Command::Exec { command } => {
            let mut stdout = tokio::io::stdout();
            let code = exec(session, &command.join(" "), &mut stdout).await?;
            Ok(code as i32)
        }
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::FileTransfer {
            message: format!("{} has no file name", path.display()),
        })
}

fn report_status(operation: &str, code: u32) -> i32 {
    match status::describe(code) {
        Some(reason) => eprintln!("{} failed: {} ({:#x})", operation, reason, code),
        None => eprintln!("{} failed with status {:#x}", operation, code),
    }
    1
}

fn report_transfer(operation: &str, transfer: &Transfer) -> i32 {
    if transfer.is_success() {
        println!("{}: {} bytes", operation, transfer.bytes);
        0
    } else {
        report_status(operation, transfer.status)
    }
}

fn report_directory(report: &DirectoryTransferReport) -> i32 {
    println!(
        "{} transferred, {} skipped, {} subdirectories skipped, {} failed",
        report.transferred,
        report.skipped.len(),
        report.skipped_directories.len(),
        report.failed.len()
    );
    for path in &report.failed {
        eprintln!("failed: {}", path);
    }
    if report.is_success() { 0 } else { 1 }
}
