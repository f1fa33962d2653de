//! ACS tape operator command-line tool.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tapeacs::{
    ad_error, check_vid, logger_init, AcsError, AcsProxy, DriveAddr, LOG_NAME,
};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Tape daemon's listening address.
    #[arg(
        short,
        long,
        default_value_t = SocketAddr::from(([127, 0, 0, 1], 54521))
    )]
    server: SocketAddr,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Tape operation to run.
    #[command(subcommand)]
    command: AcsCommand,
}

/// Tape operations offered by the daemon.
#[derive(Subcommand, Debug)]
enum AcsCommand {
    /// Mount a volume onto a drive.
    Mount {
        /// Volume identifier, at most 6 characters.
        vid: String,
        /// Drive slot in ACS:LSM:PANEL:DRIVE notation.
        slot: DriveAddr,
        /// Mount the volume for reading only.
        #[arg(long)]
        read_only: bool,
    },
    /// Dismount a volume from a drive.
    Dismount {
        /// Volume identifier, at most 6 characters.
        vid: String,
        /// Drive slot in ACS:LSM:PANEL:DRIVE notation.
        slot: DriveAddr,
        /// Dismount regardless of the drive's current state.
        #[arg(long)]
        force: bool,
    },
    /// Report liveness and data movement to the daemon.
    Heartbeat {
        /// Number of bytes moved since the last heartbeat.
        #[arg(long, default_value_t = 0)]
        bytes_moved: u64,
    },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(AcsError)` on any error.
    fn sanitize(&self) -> Result<(), AcsError> {
        if self.threads < 2 {
            Err(AcsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            match &self.command {
                AcsCommand::Mount { vid, .. }
                | AcsCommand::Dismount { vid, .. } => check_vid(vid),
                AcsCommand::Heartbeat { .. } => Ok(()),
            }
        }
    }
}

/// Actual main function of the ACS tape client tool.
fn client_main() -> Result<(), AcsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, connect to the daemon, and run the requested
    // operation
    runtime.block_on(async move {
        let proxy = AcsProxy::new_and_setup(args.server).await?;

        match args.command {
            AcsCommand::Mount {
                vid,
                slot,
                read_only,
            } => {
                if read_only {
                    proxy.mount_tape_read_only(&vid, slot).await?;
                } else {
                    proxy.mount_tape_read_write(&vid, slot).await?;
                }
                println!("mounted volume {} on drive {}", vid, slot);
            }
            AcsCommand::Dismount { vid, slot, force } => {
                proxy.dismount_tape(&vid, slot, force).await?;
                println!("dismounted volume {} from drive {}", vid, slot);
            }
            AcsCommand::Heartbeat { bytes_moved } => {
                proxy.heartbeat(bytes_moved).await?;
                println!("heartbeat acknowledged");
            }
        }

        Ok::<(), AcsError>(()) // give type hint for this async closure
    })
}

/// Main function of the ACS tape client tool.
fn main() -> ExitCode {
    logger_init();
    LOG_NAME.get_or_init(|| "client".into());

    if let Err(ref e) = client_main() {
        ad_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn dismount_args(vid: &str, threads: usize) -> CliArgs {
        CliArgs {
            server: SocketAddr::from(([127, 0, 0, 1], 54521)),
            threads,
            command: AcsCommand::Dismount {
                vid: vid.into(),
                slot: DriveAddr::new(0, 1, 2, 3),
                force: false,
            },
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), AcsError> {
        dismount_args("T00001", 2).sanitize()
    }

    #[test]
    fn sanitize_invalid_vid() {
        assert!(dismount_args("", 2).sanitize().is_err());
        assert!(dismount_args("TOOLONG", 2).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        assert!(dismount_args("T00001", 1).sanitize().is_err());
    }
}
