//! Tracked tape mount/dismount request and its lifecycle state machine.

use std::fmt;
use std::time::{Duration, Instant};

use crate::daemon::router::{PeerId, ReplySender};
use crate::messages::{frames, DriveAddr, Frame};
use crate::utils::AcsError;

/// Request tracking sequence number type, also the correlation key for
/// vendor library responses.
pub type SeqNo = u16;

/// Kind of tape operation a tracked request performs.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum AcsOperation {
    /// Mount a volume for reading only.
    MountReadOnly,

    /// Mount a volume for reading and writing.
    MountReadWrite,

    /// Dismount a volume.
    Dismount,

    /// Dismount a volume even if the hardware believes it is in use.
    ForceDismount,
}

impl fmt::Display for AcsOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AcsOperation::MountReadOnly => write!(f, "mount (read-only)"),
            AcsOperation::MountReadWrite => write!(f, "mount (read/write)"),
            AcsOperation::Dismount => write!(f, "dismount"),
            AcsOperation::ForceDismount => write!(f, "force dismount"),
        }
    }
}

/// Lifecycle state of a tracked request. Transitions only ever move
/// forward in declaration order; failure may strike before or after the
/// command reached the hardware.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub(crate) enum RequestState {
    /// Accepted, not yet handed to the library worker.
    ToExecute,

    /// Handed to the library worker, awaiting its response.
    Running,

    /// Library reported success.
    Completed,

    /// Failed at issue time, on the hardware, or by timeout.
    Failed,

    /// Terminal; reaped by the next cleanup sweep.
    ToDelete,
}

impl RequestState {
    fn name(self) -> &'static str {
        match self {
            RequestState::ToExecute => "ToExecute",
            RequestState::Running => "Running",
            RequestState::Completed => "Completed",
            RequestState::Failed => "Failed",
            RequestState::ToDelete => "ToDelete",
        }
    }
}

/// One tracked asynchronous tape operation. The reply frame is built the
/// moment the outcome is known and delivered by a later cleanup sweep, at
/// most once.
pub(crate) struct AcsRequest {
    /// Allocated sequence number.
    pub(crate) seq_no: SeqNo,

    /// Which tape operation this request performs.
    pub(crate) operation: AcsOperation,

    /// Volume ID the operation works on.
    pub(crate) vid: String,

    /// Target drive slot.
    pub(crate) drive: DriveAddr,

    /// Peer the final reply goes back to.
    pub(crate) peer: PeerId,

    /// Current lifecycle state.
    state: RequestState,

    /// Reply frame, filled in when the outcome is known.
    reply: Option<Frame>,

    /// Whether the reply frame has been handed to the transport.
    reply_sent: bool,

    /// When the command was handed to the library worker.
    issued_at: Option<Instant>,
}

impl AcsRequest {
    /// Creates a new tracked request in the initial state.
    pub(crate) fn new(
        seq_no: SeqNo,
        operation: AcsOperation,
        vid: String,
        drive: DriveAddr,
        peer: PeerId,
    ) -> Self {
        AcsRequest {
            seq_no,
            operation,
            vid,
            drive,
            peer,
            state: RequestState::ToExecute,
            reply: None,
            reply_sent: false,
            issued_at: None,
        }
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == RequestState::Running
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state == RequestState::Completed
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.state == RequestState::Failed
    }

    pub(crate) fn is_to_delete(&self) -> bool {
        self.state == RequestState::ToDelete
    }

    /// Whether the request has been running for at least `timeout`.
    pub(crate) fn running_longer_than(&self, timeout: Duration) -> bool {
        self.state == RequestState::Running
            && self.issued_at.map_or(false, |at| at.elapsed() >= timeout)
    }

    fn transition_err(
        &self,
        to: RequestState,
    ) -> Result<(), AcsError> {
        Err(AcsError::InvalidTransition {
            from: self.state.name(),
            to: to.name(),
        })
    }

    /// Marks the request as handed to the library worker.
    pub(crate) fn set_running(&mut self) -> Result<(), AcsError> {
        if self.state != RequestState::ToExecute {
            return self.transition_err(RequestState::Running);
        }
        self.state = RequestState::Running;
        self.issued_at = Some(Instant::now());
        Ok(())
    }

    /// Marks the request as successfully completed and builds its success
    /// reply frame.
    pub(crate) fn set_completed(&mut self) -> Result<(), AcsError> {
        if self.state != RequestState::Running {
            return self.transition_err(RequestState::Completed);
        }
        self.reply = Some(frames::return_value_frame(0)?);
        self.state = RequestState::Completed;
        Ok(())
    }

    /// Marks the request as failed and builds its exception reply frame.
    pub(crate) fn set_failed(
        &mut self,
        code: i32,
        message: &str,
    ) -> Result<(), AcsError> {
        if self.state != RequestState::ToExecute
            && self.state != RequestState::Running
        {
            return self.transition_err(RequestState::Failed);
        }
        self.reply = Some(frames::exception_frame(code, message)?);
        self.state = RequestState::Failed;
        Ok(())
    }

    /// Marks the request as ready for reaping.
    pub(crate) fn set_to_delete(&mut self) -> Result<(), AcsError> {
        if self.state != RequestState::Completed
            && self.state != RequestState::Failed
        {
            return self.transition_err(RequestState::ToDelete);
        }
        self.state = RequestState::ToDelete;
        Ok(())
    }

    /// Hands the reply frame to the transport. Errors if called again
    /// after a successful send or before any outcome is known.
    pub(crate) fn send_reply_once(
        &mut self,
        reply_sender: &ReplySender,
    ) -> Result<(), AcsError> {
        if self.reply_sent {
            return Err(AcsError::ReplyAlreadySent {
                seq_no: self.seq_no,
            });
        }
        match &self.reply {
            Some(reply) => {
                reply_sender.send_to(self.peer, reply.clone())?;
                self.reply_sent = true;
                Ok(())
            }
            None => logged_err!(
                "no reply frame built for sequence number {}",
                self.seq_no
            ),
        }
    }
}
