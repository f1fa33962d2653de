//! ACS tape daemon executable.

use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use tapeacs::{
    ad_error, logger_init, AcsDaemon, AcsError, SimulatedLibrary, LOG_NAME,
};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Daemon configuration TOML string, e.g. 'listen_port = 54521'.
    /// Every '+' is treated as newline; unset fields keep their defaults.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Simulated library response latency in milliseconds.
    #[arg(long, default_value_t = 2000)]
    sim_latency_ms: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
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
            Ok(())
        }
    }
}

/// Actual main function of the ACS tape daemon.
fn daemon_main() -> Result<(), AcsError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            ad_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-acsd")
            .build()?;

        // enter tokio runtime, set up the daemon, and start the main event
        // loop logic
        runtime.block_on(async move {
            let library = Box::new(SimulatedLibrary::new(
                Duration::from_millis(args.sim_latency_ms),
            ));
            let mut daemon =
                AcsDaemon::new_and_setup(config_str, library).await?;

            daemon.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), AcsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the ACS tape daemon.
fn main() -> ExitCode {
    logger_init();
    LOG_NAME.get_or_init(|| "acsd".into());

    if let Err(ref e) = daemon_main() {
        ad_error!("daemon_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        // ad_warn!("daemon_main exited successfully");
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), AcsError> {
        let args = CliArgs {
            config: String::new(),
            sim_latency_ms: 2000,
            threads: 2,
        };
        args.sanitize()
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            config: String::new(),
            sim_latency_ms: 2000,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
    }
}
