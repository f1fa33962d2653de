//! Tape library access module implementation. The vendor interface is
//! blocking, so every call runs on a dedicated worker thread behind
//! bounded channels and the daemon's event loop never touches it directly.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use crate::messages::DriveAddr;
use crate::utils::AcsError;

use tokio::sync::mpsc;

/// Capacity of the command and event channels to the worker thread.
const LIBRARY_CHAN_CAP: usize = 64;

/// Interface to the robotic tape library. One command may be in flight per
/// sequence number; outcomes of issued commands arrive asynchronously
/// through `poll_response`.
pub trait AcsLibrary: Send {
    /// Issues a mount of the given volume onto the given drive.
    fn mount(
        &mut self,
        seq_no: u16,
        vid: &str,
        drive: DriveAddr,
        read_only: bool,
    ) -> Result<(), AcsError>;

    /// Issues a dismount of the given volume from the given drive.
    fn dismount(
        &mut self,
        seq_no: u16,
        vid: &str,
        drive: DriveAddr,
        force: bool,
    ) -> Result<(), AcsError>;

    /// Waits up to `timeout` for the next command outcome. `Ok(None)` if
    /// none arrived within the timeout.
    fn poll_response(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<LibraryResponse>, AcsError>;
}

/// Final outcome of an issued library command.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LibraryResponse {
    /// Sequence number the command was issued under.
    pub seq_no: u16,

    /// Whether the command succeeded on the hardware.
    pub status: ResponseStatus,
}

/// Hardware-level command status.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ResponseStatus {
    /// Command completed successfully.
    Success,

    /// Command failed with a vendor status code.
    Failure { code: i32, message: String },
}

/// Command to the library worker thread.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum LibraryCommand {
    /// Issue a mount command.
    Mount {
        seq_no: u16,
        vid: String,
        drive: DriveAddr,
        read_only: bool,
    },

    /// Issue a dismount command.
    Dismount {
        seq_no: u16,
        vid: String,
        drive: DriveAddr,
        force: bool,
    },

    /// Poll for the next command outcome, blocking up to `timeout`.
    PollResponse { timeout: Duration },
}

/// Event returned by the library worker thread.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum LibraryEvent {
    /// A mount or dismount command was handed to the vendor library.
    /// `error` is `Some` if the issue itself failed.
    Issued { seq_no: u16, error: Option<String> },

    /// Result of one `PollResponse` command. `None` if no outcome arrived
    /// within the poll timeout.
    Polled { response: Option<LibraryResponse> },
}

/// Vendor tape library access module.
pub(crate) struct LibraryHub {
    /// Sender side of the command channel.
    tx_cmd: mpsc::Sender<LibraryCommand>,

    /// Receiver side of the event channel.
    rx_event: mpsc::Receiver<LibraryEvent>,

    /// Join handle of the worker thread.
    _worker_handle: thread::JoinHandle<()>,
}

// LibraryHub public API implementation
impl LibraryHub {
    /// Creates a new library access hub. Spawns the worker thread that owns
    /// the vendor library handle. Creates a command channel for submitting
    /// library commands and an event channel for getting outcomes.
    pub(crate) fn new_and_setup(
        library: Box<dyn AcsLibrary>,
    ) -> Result<Self, AcsError> {
        let (tx_cmd, rx_cmd) =
            mpsc::channel::<LibraryCommand>(LIBRARY_CHAN_CAP);
        let (tx_event, rx_event) = mpsc::channel(LIBRARY_CHAN_CAP);

        let worker_handle = thread::spawn(move || {
            Self::library_thread(library, rx_cmd, tx_event)
        });

        Ok(LibraryHub {
            tx_cmd,
            rx_event,
            _worker_handle: worker_handle,
        })
    }

    /// Submits a command by sending it to the command channel. Fails if the
    /// bounded channel is full.
    pub(crate) fn submit_command(
        &mut self,
        cmd: LibraryCommand,
    ) -> Result<(), AcsError> {
        self.tx_cmd.try_send(cmd)?;
        Ok(())
    }

    /// Waits for the next worker event by receiving from the event channel.
    #[allow(dead_code)]
    pub(crate) async fn get_event(&mut self) -> Result<LibraryEvent, AcsError> {
        match self.rx_event.recv().await {
            Some(event) => Ok(event),
            None => logged_err!("event channel has been closed"),
        }
    }

    /// Try to get the next worker event using `try_recv()`.
    pub(crate) fn try_get_event(
        &mut self,
    ) -> Result<Option<LibraryEvent>, AcsError> {
        match self.rx_event.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// LibraryHub worker thread implementation
impl LibraryHub {
    /// Carry out the given command on the vendor library.
    fn do_command(
        library: &mut dyn AcsLibrary,
        cmd: LibraryCommand,
    ) -> LibraryEvent {
        match cmd {
            LibraryCommand::Mount {
                seq_no,
                vid,
                drive,
                read_only,
            } => {
                let error = library
                    .mount(seq_no, &vid, drive, read_only)
                    .err()
                    .map(|e| e.to_string());
                LibraryEvent::Issued { seq_no, error }
            }
            LibraryCommand::Dismount {
                seq_no,
                vid,
                drive,
                force,
            } => {
                let error = library
                    .dismount(seq_no, &vid, drive, force)
                    .err()
                    .map(|e| e.to_string());
                LibraryEvent::Issued { seq_no, error }
            }
            LibraryCommand::PollResponse { timeout } => {
                match library.poll_response(timeout) {
                    Ok(response) => LibraryEvent::Polled { response },
                    Err(e) => {
                        ad_warn!("error polling library response: {}", e);
                        LibraryEvent::Polled { response: None }
                    }
                }
            }
        }
    }

    /// Library worker thread function.
    fn library_thread(
        mut library: Box<dyn AcsLibrary>,
        mut rx_cmd: mpsc::Receiver<LibraryCommand>,
        tx_event: mpsc::Sender<LibraryEvent>,
    ) {
        ad_debug!("library worker thread spawned");

        while let Some(cmd) = rx_cmd.blocking_recv() {
            let event = Self::do_command(library.as_mut(), cmd);
            if tx_event.blocking_send(event).is_err() {
                break; // event channel closed on the daemon side
            }
        }

        // channel gets closed and no commands remain
        ad_debug!("library worker thread exited");
    }
}

/// In-process stand-in for the vendor library. Every issued command
/// succeeds after a fixed latency.
pub struct SimulatedLibrary {
    /// Time from issue to response maturity.
    latency: Duration,

    /// Issued commands waiting to mature, in issue order.
    pending: VecDeque<(Instant, LibraryResponse)>,
}

impl SimulatedLibrary {
    pub fn new(latency: Duration) -> Self {
        SimulatedLibrary {
            latency,
            pending: VecDeque::new(),
        }
    }

    fn push_pending(&mut self, seq_no: u16) {
        self.pending.push_back((
            Instant::now() + self.latency,
            LibraryResponse {
                seq_no,
                status: ResponseStatus::Success,
            },
        ));
    }
}

impl AcsLibrary for SimulatedLibrary {
    fn mount(
        &mut self,
        seq_no: u16,
        _vid: &str,
        _drive: DriveAddr,
        _read_only: bool,
    ) -> Result<(), AcsError> {
        self.push_pending(seq_no);
        Ok(())
    }

    fn dismount(
        &mut self,
        seq_no: u16,
        _vid: &str,
        _drive: DriveAddr,
        _force: bool,
    ) -> Result<(), AcsError> {
        self.push_pending(seq_no);
        Ok(())
    }

    fn poll_response(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<LibraryResponse>, AcsError> {
        let deadline = Instant::now() + timeout;
        match self.pending.front().map(|(due, _)| *due) {
            Some(due) if due <= deadline => {
                let wait = due.saturating_duration_since(Instant::now());
                if !wait.is_zero() {
                    thread::sleep(wait);
                }
                Ok(self.pending.pop_front().map(|(_, response)| response))
            }
            Some(_) => {
                // next response matures after this poll's deadline
                thread::sleep(deadline.saturating_duration_since(
                    Instant::now(),
                ));
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Library stand-in with per-command scripted outcomes, for tests that
/// need failures or out-of-order responses.
#[cfg(test)]
pub(crate) struct ScriptedLibrary {
    /// Outcome for each issued command in issue order. `Ok(status)` queues
    /// a response with that status; `Err(msg)` fails the issue call itself.
    /// Commands beyond the script succeed.
    outcomes: VecDeque<Result<ResponseStatus, String>>,

    /// Matured responses awaiting a poll.
    responses: VecDeque<LibraryResponse>,

    /// Mount and dismount calls observed, in call order.
    issued: Arc<Mutex<Vec<LibraryCommand>>>,
}

#[cfg(test)]
impl ScriptedLibrary {
    pub(crate) fn new(
        outcomes: Vec<Result<ResponseStatus, String>>,
    ) -> Self {
        ScriptedLibrary {
            outcomes: outcomes.into(),
            responses: VecDeque::new(),
            issued: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Injects a raw response, e.g. one with an unknown sequence number.
    pub(crate) fn push_response(&mut self, response: LibraryResponse) {
        self.responses.push_back(response);
    }

    /// Handle to the log of observed mount/dismount calls. Stays valid
    /// after the library moves onto the worker thread.
    pub(crate) fn issued_commands(&self) -> Arc<Mutex<Vec<LibraryCommand>>> {
        self.issued.clone()
    }

    fn issue(&mut self, seq_no: u16) -> Result<(), AcsError> {
        match self.outcomes.pop_front() {
            Some(Ok(status)) => {
                self.responses.push_back(LibraryResponse { seq_no, status });
                Ok(())
            }
            Some(Err(msg)) => Err(AcsError::Library(msg)),
            None => {
                self.responses.push_back(LibraryResponse {
                    seq_no,
                    status: ResponseStatus::Success,
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
impl AcsLibrary for ScriptedLibrary {
    fn mount(
        &mut self,
        seq_no: u16,
        vid: &str,
        drive: DriveAddr,
        read_only: bool,
    ) -> Result<(), AcsError> {
        self.issued.lock().unwrap().push(LibraryCommand::Mount {
            seq_no,
            vid: vid.into(),
            drive,
            read_only,
        });
        self.issue(seq_no)
    }

    fn dismount(
        &mut self,
        seq_no: u16,
        vid: &str,
        drive: DriveAddr,
        force: bool,
    ) -> Result<(), AcsError> {
        self.issued.lock().unwrap().push(LibraryCommand::Dismount {
            seq_no,
            vid: vid.into(),
            drive,
            force,
        });
        self.issue(seq_no)
    }

    fn poll_response(
        &mut self,
        _timeout: Duration,
    ) -> Result<Option<LibraryResponse>, AcsError> {
        Ok(self.responses.pop_front())
    }
}
