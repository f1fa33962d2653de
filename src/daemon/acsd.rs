//! ACS tape daemon implementation: wires the router socket, reactor,
//! and pending request registry together and drives them in a bounded
//! poll loop until termination.

use std::net::SocketAddr;

use crate::daemon::handler::AcsMessageHandler;
use crate::daemon::library::AcsLibrary;
use crate::daemon::reactor::Reactor;
use crate::daemon::registry::PendingRequests;
use crate::daemon::router::RouterSocket;
use crate::utils::AcsError;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Deserialize)]
pub struct AcsdConfig {
    /// Client-facing listening port on loopback.
    pub listen_port: u16,

    /// Seconds between library polls while the library stays quiet.
    pub query_library_interval: u64,

    /// Seconds between library polls while responses keep arriving.
    pub response_timeout: u64,

    /// Seconds allowed for a mount or dismount to conclude before it is
    /// failed with a timeout.
    pub command_timeout: u64,

    /// Upper bound on one reactor wait in milliseconds.
    pub poll_timeout_ms: u64,
}

impl Default for AcsdConfig {
    fn default() -> Self {
        AcsdConfig {
            listen_port: 54521,
            query_library_interval: 10,
            response_timeout: 5,
            command_timeout: 600,
            poll_timeout_ms: 100,
        }
    }
}

/// The ACS tape daemon.
pub struct AcsDaemon {
    /// Configuration parameters struct.
    config: AcsdConfig,

    /// Reactor dispatching socket readiness to the message handler.
    reactor: Reactor<PendingRequests>,

    /// Registry of in-flight tape requests; the reactor's dispatch
    /// context.
    registry: PendingRequests,

    /// Upper bound on one reactor wait.
    poll_timeout: Duration,
}

impl AcsDaemon {
    /// Creates a new ACS daemon and sets up required functionality
    /// modules according to the given configuration string. Takes the
    /// vendor library handle the daemon will drive.
    pub async fn new_and_setup(
        config_str: Option<&str>,
        library: Box<dyn AcsLibrary>,
    ) -> Result<Self, AcsError> {
        let config = parsed_config!(config_str => AcsdConfig;
                                    listen_port, query_library_interval,
                                    response_timeout, command_timeout,
                                    poll_timeout_ms)?;
        if config.listen_port < 1024 {
            return logged_err!("invalid listen_port {}", config.listen_port);
        }
        if config.poll_timeout_ms == 0 {
            return logged_err!(
                "invalid poll_timeout_ms {}",
                config.poll_timeout_ms
            );
        }

        let listen_addr: SocketAddr =
            format!("127.0.0.1:{}", config.listen_port).parse()?;
        let socket = RouterSocket::new_and_setup(listen_addr).await?;

        let registry = PendingRequests::new_and_setup(
            library,
            socket.reply_sender(),
            Duration::from_secs(config.query_library_interval),
            Duration::from_secs(config.response_timeout),
            Duration::from_secs(config.command_timeout),
        )?;

        let mut reactor = Reactor::new();
        reactor.register_handler(Box::new(AcsMessageHandler::new(socket)));

        let poll_timeout = Duration::from_millis(config.poll_timeout_ms);
        Ok(AcsDaemon {
            config,
            reactor,
            registry,
            poll_timeout,
        })
    }

    /// Main event loop logic of the daemon. Each iteration waits at most
    /// `poll_timeout` for socket traffic, then advances the request
    /// registry and reaps terminal requests. Breaks out of the loop only
    /// upon catching a termination signal to the process.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), AcsError> {
        ad_info!(
            "daemon event loop starting (listen port {}, {} handler(s))",
            self.config.listen_port,
            self.reactor.num_handlers()
        );

        loop {
            if let Err(e) = self
                .reactor
                .handle_events(&mut self.registry, self.poll_timeout)
                .await
            {
                ad_error!("error handling reactor events: {}", e);
            }

            if let Err(e) = self.registry.tick() {
                ad_error!("error advancing request registry: {}", e);
            }
            if let Err(e) = self.registry.handle_completed_requests() {
                ad_error!("error sweeping completed requests: {}", e);
            }
            if let Err(e) = self.registry.handle_failed_requests() {
                ad_error!("error sweeping failed requests: {}", e);
            }
            self.registry.handle_to_delete_requests();

            // check for termination between iterations
            if *rx_term.borrow_and_update() {
                ad_warn!("daemon caught termination signal");
                break;
            }
        }

        self.reactor.clear();
        Ok(())
    }
}

#[cfg(test)]
mod acsd_tests {
    use super::*;
    use crate::client::AcsProxy;
    use crate::daemon::library::SimulatedLibrary;
    use crate::messages::{ecodes, DriveAddr};
    use std::sync::Arc;
    use tokio::time;

    /// Sets up a daemon and spawns its event loop. The returned termination
    /// sender must be kept alive for the duration of the test.
    async fn start_daemon(
        config_str: &str,
        library: SimulatedLibrary,
    ) -> Result<watch::Sender<bool>, AcsError> {
        let mut daemon =
            AcsDaemon::new_and_setup(Some(config_str), Box::new(library))
                .await?;
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move { daemon.run(rx_term).await });
        Ok(tx_term)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn dismount_end_to_end() -> Result<(), AcsError> {
        let _tx_term = start_daemon(
            "listen_port = 54631\n\
             query_library_interval = 0\n\
             response_timeout = 0\n\
             poll_timeout_ms = 10",
            SimulatedLibrary::new(Duration::from_millis(200)),
        )
        .await?;

        let drive = DriveAddr::new(0, 1, 2, 3);
        let proxy = Arc::new(
            AcsProxy::new_and_setup("127.0.0.1:54631".parse()?).await?,
        );
        let other_proxy =
            AcsProxy::new_and_setup("127.0.0.1:54631".parse()?).await?;

        // first dismount goes in flight
        let proxy_clone = proxy.clone();
        let first = tokio::spawn(async move {
            proxy_clone.dismount_tape("T00001", drive, false).await
        });
        time::sleep(Duration::from_millis(50)).await;

        // overlapping duplicate gets rejected while the first is tracked
        match other_proxy.dismount_tape("T00001", drive, false).await {
            Err(AcsError::Remote { message, .. }) => {
                assert!(message.contains("busy"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // the original concludes successfully
        first.await.unwrap()?;

        // after reaping, the same volume and drive are admitted again
        other_proxy.dismount_tape("T00001", drive, false).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn command_timeout_and_heartbeat() -> Result<(), AcsError> {
        // library whose responses never mature within the test
        let _tx_term = start_daemon(
            "listen_port = 54632\n\
             query_library_interval = 0\n\
             response_timeout = 0\n\
             command_timeout = 1\n\
             poll_timeout_ms = 10",
            SimulatedLibrary::new(Duration::from_secs(3600)),
        )
        .await?;

        let proxy =
            AcsProxy::new_and_setup("127.0.0.1:54632".parse()?).await?;
        proxy.heartbeat(42).await?;

        match proxy
            .mount_tape_read_write("T00002", DriveAddr::new(4, 4, 4, 4))
            .await
        {
            Err(AcsError::Remote { code, .. }) => {
                assert_eq!(code, ecodes::SETIMEDOUT);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn config_rejected() {
        assert!(AcsDaemon::new_and_setup(
            Some("listen_port = 80"),
            Box::new(SimulatedLibrary::new(Duration::ZERO)),
        )
        .await
        .is_err());
        assert!(AcsDaemon::new_and_setup(
            Some("no_such_knob = 1"),
            Box::new(SimulatedLibrary::new(Duration::ZERO)),
        )
        .await
        .is_err());
    }
}
