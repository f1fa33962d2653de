//! Pending tape request registry implementation: single owner of all
//! in-flight mount/dismount operations and the only submitter of commands
//! to the library worker.

use std::time::{Duration, Instant};

use crate::daemon::library::{
    AcsLibrary, LibraryCommand, LibraryEvent, LibraryHub, LibraryResponse,
    ResponseStatus,
};
use crate::daemon::request::{AcsOperation, AcsRequest, RequestState, SeqNo};
use crate::daemon::router::{PeerId, ReplySender};
use crate::messages::{ecodes, DriveAddr};
use crate::utils::AcsError;

/// Highest allocatable sequence number; 0 is never handed out.
pub(crate) const ACS_MAX_SEQUENCE: SeqNo = u16::MAX;

/// Registry of in-flight tape requests. Advanced by the daemon loop in
/// strict phases: `tick` issues commands and drains library events, then
/// the three sweep methods deliver replies and reap terminal requests.
/// Nothing else mutates the request collection.
pub(crate) struct PendingRequests {
    /// All tracked requests, in arrival order.
    requests: Vec<AcsRequest>,

    /// Channel-based access to the vendor library worker.
    library: LibraryHub,

    /// Reply-addressing handle into the router socket.
    reply_sender: ReplySender,

    /// Poll gap while responses keep arriving.
    response_timeout: Duration,

    /// Poll gap while the library stays quiet.
    query_library_interval: Duration,

    /// Time allowed for an issued command to conclude.
    command_timeout: Duration,

    /// When the last poll outcome was consumed.
    last_response_used: Instant,

    /// Whether the last consumed poll carried a response.
    last_poll_yielded: bool,

    /// A poll command has been submitted and its outcome not yet drained.
    poll_in_flight: bool,
}

impl PendingRequests {
    /// Creates the registry and spawns the library worker around the given
    /// vendor library handle.
    pub(crate) fn new_and_setup(
        library: Box<dyn AcsLibrary>,
        reply_sender: ReplySender,
        query_library_interval: Duration,
        response_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, AcsError> {
        let library = LibraryHub::new_and_setup(library)?;
        Ok(PendingRequests {
            requests: Vec::new(),
            library,
            reply_sender,
            response_timeout,
            query_library_interval,
            command_timeout,
            last_response_used: Instant::now(),
            last_poll_yielded: true,
            poll_in_flight: false,
        })
    }

    /// Number of currently tracked requests in any state.
    #[allow(dead_code)]
    pub(crate) fn num_requests(&self) -> usize {
        self.requests.len()
    }

    /// Rejects a new request that collides with a tracked one, either on
    /// the exact drive slot or on an overlapping volume ID.
    fn check_request(
        &self,
        vid: &str,
        drive: DriveAddr,
    ) -> Result<(), AcsError> {
        for req in &self.requests {
            if req.drive == drive {
                return Err(AcsError::DuplicateRequest(format!(
                    "drive {} is already busy with a {} of volume {}",
                    drive, req.operation, req.vid
                )));
            }
            if req.vid.contains(vid) || vid.contains(&req.vid) {
                return Err(AcsError::DuplicateRequest(format!(
                    "volume {} is already busy with a {} on drive {}",
                    req.vid, req.operation, req.drive
                )));
            }
        }
        Ok(())
    }

    /// Admits a new request after the duplicate check, allocating its
    /// sequence number. The command itself is issued by the next `tick`.
    pub(crate) fn check_and_add_request(
        &mut self,
        operation: AcsOperation,
        vid: &str,
        drive: DriveAddr,
        peer: PeerId,
    ) -> Result<SeqNo, AcsError> {
        self.check_request(vid, drive)?;
        let seq_no = self.next_sequence_number()?;
        ad_info!(
            "tracking {} of volume {} on drive {} under seq {} for peer {}",
            operation,
            vid,
            drive,
            seq_no,
            peer
        );
        self.requests.push(AcsRequest::new(
            seq_no,
            operation,
            vid.into(),
            drive,
            peer,
        ));
        Ok(seq_no)
    }

    /// Allocates the next free sequence number from the ends of the
    /// currently occupied range.
    fn next_sequence_number(&self) -> Result<SeqNo, AcsError> {
        if self.requests.is_empty() {
            return Ok(1);
        }
        let min = self.requests.iter().map(|r| r.seq_no).min().unwrap();
        let max = self.requests.iter().map(|r| r.seq_no).max().unwrap();
        if min > 1 {
            Ok(min - 1)
        } else if max < ACS_MAX_SEQUENCE {
            Ok(max + 1)
        } else {
            Err(AcsError::SequenceExhausted)
        }
    }

    /// One registry advancement pass: hand accepted requests to the
    /// library worker, maybe submit one throttled response poll, then
    /// drain worker events and route responses by sequence number.
    pub(crate) fn tick(&mut self) -> Result<(), AcsError> {
        // issue commands for requests still waiting to execute
        for req in self.requests.iter_mut() {
            if req.state() != RequestState::ToExecute {
                continue;
            }
            let cmd = match req.operation {
                AcsOperation::MountReadOnly => LibraryCommand::Mount {
                    seq_no: req.seq_no,
                    vid: req.vid.clone(),
                    drive: req.drive,
                    read_only: true,
                },
                AcsOperation::MountReadWrite => LibraryCommand::Mount {
                    seq_no: req.seq_no,
                    vid: req.vid.clone(),
                    drive: req.drive,
                    read_only: false,
                },
                AcsOperation::Dismount => LibraryCommand::Dismount {
                    seq_no: req.seq_no,
                    vid: req.vid.clone(),
                    drive: req.drive,
                    force: false,
                },
                AcsOperation::ForceDismount => LibraryCommand::Dismount {
                    seq_no: req.seq_no,
                    vid: req.vid.clone(),
                    drive: req.drive,
                    force: true,
                },
            };
            if let Err(e) = self.library.submit_command(cmd) {
                // command channel full; leave in place and retry next tick
                ad_warn!(
                    "error submitting command for seq {}: {}",
                    req.seq_no,
                    e
                );
                break;
            }
            req.set_running()?;
        }

        // submit at most one response poll, throttled by how long ago the
        // last one was submitted
        let any_running = self.requests.iter().any(|r| r.is_running());
        if any_running && !self.poll_in_flight {
            let gap = if self.last_poll_yielded {
                self.response_timeout
            } else {
                self.query_library_interval
            };
            if self.last_response_used.elapsed() >= gap {
                match self.library.submit_command(
                    LibraryCommand::PollResponse {
                        timeout: Duration::ZERO,
                    },
                ) {
                    Ok(()) => {
                        // timestamp counts from submission, not from when
                        // the poll outcome is drained
                        self.last_response_used = Instant::now();
                        self.poll_in_flight = true;
                    }
                    Err(e) => {
                        ad_warn!("error submitting response poll: {}", e)
                    }
                }
            }
        }

        // drain whatever the worker produced since the last pass
        while let Some(event) = self.library.try_get_event()? {
            match event {
                LibraryEvent::Issued {
                    seq_no,
                    error: None,
                } => {
                    ad_trace!("library accepted command for seq {}", seq_no);
                }
                LibraryEvent::Issued {
                    seq_no,
                    error: Some(msg),
                } => {
                    self.fail_request(seq_no, ecodes::SEINTERNAL, &msg)?;
                }
                LibraryEvent::Polled { response } => {
                    self.poll_in_flight = false;
                    self.last_poll_yielded = response.is_some();
                    if let Some(response) = response {
                        self.route_response(response)?;
                    }
                }
            }
        }

        // fail requests that outlived the command timeout
        for req in self.requests.iter_mut() {
            if req.running_longer_than(self.command_timeout) {
                let msg = format!(
                    "{} of volume {} did not conclude within {} seconds",
                    req.operation,
                    req.vid,
                    self.command_timeout.as_secs()
                );
                ad_warn!("seq {} timed out: {}", req.seq_no, msg);
                req.set_failed(ecodes::SETIMEDOUT, &msg)?;
            }
        }

        Ok(())
    }

    /// Routes one polled response to the running request with the matching
    /// sequence number. Responses that match nothing are dropped.
    fn route_response(
        &mut self,
        response: LibraryResponse,
    ) -> Result<(), AcsError> {
        match self
            .requests
            .iter_mut()
            .find(|r| r.seq_no == response.seq_no && r.is_running())
        {
            Some(req) => match response.status {
                ResponseStatus::Success => {
                    ad_info!(
                        "{} of volume {} on drive {} completed (seq {})",
                        req.operation,
                        req.vid,
                        req.drive,
                        req.seq_no
                    );
                    req.set_completed()
                }
                ResponseStatus::Failure { code, message } => {
                    ad_warn!(
                        "{} of volume {} on drive {} failed (seq {}): {}",
                        req.operation,
                        req.vid,
                        req.drive,
                        req.seq_no,
                        message
                    );
                    req.set_failed(code, &message)
                }
            },
            None => {
                ad_warn!(
                    "dropping response with unmatched sequence number {}",
                    response.seq_no
                );
                Ok(())
            }
        }
    }

    /// Fails the running request with the given sequence number. Issue
    /// failures that match nothing running are dropped, like responses.
    fn fail_request(
        &mut self,
        seq_no: SeqNo,
        code: i32,
        message: &str,
    ) -> Result<(), AcsError> {
        match self
            .requests
            .iter_mut()
            .find(|r| r.seq_no == seq_no && r.is_running())
        {
            Some(req) => {
                ad_warn!("seq {} failed at issue: {}", seq_no, message);
                req.set_failed(code, message)
            }
            None => {
                ad_warn!(
                    "dropping issue failure with unmatched sequence number {}",
                    seq_no
                );
                Ok(())
            }
        }
    }

    /// Delivers replies for completed requests and schedules them for
    /// reaping.
    pub(crate) fn handle_completed_requests(&mut self) -> Result<(), AcsError> {
        for req in self.requests.iter_mut() {
            if req.is_completed() {
                if let Err(e) = req.send_reply_once(&self.reply_sender) {
                    ad_warn!(
                        "error sending reply for seq {}: {}",
                        req.seq_no,
                        e
                    );
                }
                req.set_to_delete()?;
            }
        }
        Ok(())
    }

    /// Delivers replies for failed requests and schedules them for
    /// reaping.
    pub(crate) fn handle_failed_requests(&mut self) -> Result<(), AcsError> {
        for req in self.requests.iter_mut() {
            if req.is_failed() {
                if let Err(e) = req.send_reply_once(&self.reply_sender) {
                    ad_warn!(
                        "error sending reply for seq {}: {}",
                        req.seq_no,
                        e
                    );
                }
                req.set_to_delete()?;
            }
        }
        Ok(())
    }

    /// Reaps requests scheduled for deletion. Uses a retain pass, so
    /// reaping never invalidates the traversal it is part of.
    pub(crate) fn handle_to_delete_requests(&mut self) {
        let before = self.requests.len();
        self.requests.retain(|r| !r.is_to_delete());
        let reaped = before - self.requests.len();
        if reaped > 0 {
            ad_debug!("reaped {} terminal request(s)", reaped);
        }
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::daemon::library::{ScriptedLibrary, SimulatedLibrary};
    use crate::messages::{Exception, Frame, MsgType, ReturnValue};
    use rand::Rng;
    use tokio::sync::mpsc;
    use tokio::time;

    fn test_registry(
        library: Box<dyn AcsLibrary>,
        command_timeout: Duration,
    ) -> Result<
        (
            PendingRequests,
            flashmap::WriteHandle<PeerId, mpsc::UnboundedSender<Frame>>,
            mpsc::UnboundedReceiver<Frame>,
        ),
        AcsError,
    > {
        let (reply_sender, tx_replies_write, rx_reply) =
            ReplySender::synthetic(1);
        let registry = PendingRequests::new_and_setup(
            library,
            reply_sender,
            Duration::ZERO,
            Duration::ZERO,
            command_timeout,
        )?;
        Ok((registry, tx_replies_write, rx_reply))
    }

    fn dummy_request(seq_no: SeqNo) -> AcsRequest {
        AcsRequest::new(
            seq_no,
            AcsOperation::Dismount,
            format!("T{:05}", seq_no),
            DriveAddr::new(0, 0, 0, seq_no as u32),
            1,
        )
    }

    /// Runs registry passes until the condition holds or attempts run out.
    async fn tick_until(
        registry: &mut PendingRequests,
        cond: impl Fn(&PendingRequests) -> bool,
    ) -> Result<(), AcsError> {
        for _ in 0..50 {
            registry.tick()?;
            registry.handle_completed_requests()?;
            registry.handle_failed_requests()?;
            registry.handle_to_delete_requests();
            if cond(registry) {
                return Ok(());
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        logged_err!("registry did not reach expected condition")
    }

    #[test]
    fn sequence_allocation_from_the_ends() -> Result<(), AcsError> {
        let (mut registry, _tx_replies_write, _rx_reply) = test_registry(
            Box::new(ScriptedLibrary::new(vec![])),
            Duration::from_secs(600),
        )?;
        assert_eq!(registry.next_sequence_number()?, 1);
        for seq_no in 1..=3 {
            registry.requests.push(dummy_request(seq_no));
        }
        assert_eq!(registry.next_sequence_number()?, 4);
        // low end freed up
        registry.requests.retain(|r| r.seq_no != 1);
        assert_eq!(registry.next_sequence_number()?, 1);
        // both ends saturated
        registry.requests.push(dummy_request(1));
        registry.requests.push(dummy_request(ACS_MAX_SEQUENCE));
        assert_eq!(
            registry.next_sequence_number(),
            Err(AcsError::SequenceExhausted)
        );
        Ok(())
    }

    #[test]
    fn sequence_allocation_randomized() -> Result<(), AcsError> {
        let mut rng = rand::thread_rng();
        let (mut registry, _tx_replies_write, _rx_reply) = test_registry(
            Box::new(ScriptedLibrary::new(vec![])),
            Duration::from_secs(600),
        )?;
        for _ in 0..200 {
            if registry.requests.is_empty() || rng.gen_bool(0.6) {
                let seq_no = registry.next_sequence_number()?;
                assert!(seq_no >= 1);
                assert!(!registry
                    .requests
                    .iter()
                    .any(|r| r.seq_no == seq_no));
                if !registry.requests.is_empty() {
                    let min = registry
                        .requests
                        .iter()
                        .map(|r| r.seq_no as u32)
                        .min()
                        .unwrap();
                    let max = registry
                        .requests
                        .iter()
                        .map(|r| r.seq_no as u32)
                        .max()
                        .unwrap();
                    assert!(
                        seq_no as u32 == min - 1 || seq_no as u32 == max + 1
                    );
                }
                registry.requests.push(dummy_request(seq_no));
            } else {
                let idx = rng.gen_range(0..registry.requests.len());
                registry.requests.remove(idx);
            }
        }
        Ok(())
    }

    #[test]
    fn duplicate_requests_rejected() -> Result<(), AcsError> {
        let (mut registry, _tx_replies_write, _rx_reply) = test_registry(
            Box::new(ScriptedLibrary::new(vec![])),
            Duration::from_secs(600),
        )?;
        let drive = DriveAddr::new(0, 1, 2, 3);
        let seq_no = registry.check_and_add_request(
            AcsOperation::Dismount,
            "T00001",
            drive,
            1,
        )?;
        assert_eq!(seq_no, 1);
        // same drive, different volume
        assert!(matches!(
            registry.check_and_add_request(
                AcsOperation::Dismount,
                "T00002",
                drive,
                1
            ),
            Err(AcsError::DuplicateRequest(_))
        ));
        // same volume, different drive
        assert!(matches!(
            registry.check_and_add_request(
                AcsOperation::MountReadWrite,
                "T00001",
                DriveAddr::new(0, 1, 2, 4),
                1
            ),
            Err(AcsError::DuplicateRequest(_))
        ));
        // volume overlapping a tracked one
        assert!(matches!(
            registry.check_and_add_request(
                AcsOperation::Dismount,
                "T0000",
                DriveAddr::new(0, 1, 2, 5),
                1
            ),
            Err(AcsError::DuplicateRequest(_))
        ));
        // unrelated request passes
        assert_eq!(
            registry.check_and_add_request(
                AcsOperation::MountReadOnly,
                "U99999",
                DriveAddr::new(7, 7, 7, 7),
                1
            )?,
            2
        );
        // overlap in the other direction, new volume contains tracked
        registry.check_and_add_request(
            AcsOperation::Dismount,
            "AB12",
            DriveAddr::new(5, 5, 5, 5),
            1,
        )?;
        assert!(matches!(
            registry.check_and_add_request(
                AcsOperation::Dismount,
                "AB123",
                DriveAddr::new(5, 5, 5, 6),
                1
            ),
            Err(AcsError::DuplicateRequest(_))
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_completed_and_reused() -> Result<(), AcsError> {
        let (mut registry, _tx_replies_write, mut rx_reply) = test_registry(
            Box::new(ScriptedLibrary::new(vec![])),
            Duration::from_secs(600),
        )?;
        let drive = DriveAddr::new(0, 1, 2, 3);
        registry.check_and_add_request(
            AcsOperation::Dismount,
            "T00001",
            drive,
            1,
        )?;
        // duplicate rejected while the first is still tracked
        assert!(matches!(
            registry.check_and_add_request(
                AcsOperation::Dismount,
                "T00001",
                drive,
                1
            ),
            Err(AcsError::DuplicateRequest(_))
        ));
        tick_until(&mut registry, |r| r.num_requests() == 0).await?;
        let reply = rx_reply.recv().await.unwrap();
        assert_eq!(reply.msg_type(), Some(MsgType::ReturnValue));
        assert_eq!(reply.parse_body::<ReturnValue>()?.value, 0);
        assert!(rx_reply.try_recv().is_err());
        // after reaping, the same volume and drive are admitted again
        assert_eq!(
            registry.check_and_add_request(
                AcsOperation::Dismount,
                "T00001",
                drive,
                1
            )?,
            1
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_failed_outcome() -> Result<(), AcsError> {
        let (mut registry, _tx_replies_write, mut rx_reply) = test_registry(
            Box::new(ScriptedLibrary::new(vec![Ok(
                ResponseStatus::Failure {
                    code: 42,
                    message: "drive jammed".into(),
                },
            )])),
            Duration::from_secs(600),
        )?;
        registry.check_and_add_request(
            AcsOperation::MountReadWrite,
            "T00002",
            DriveAddr::new(1, 2, 3, 4),
            1,
        )?;
        tick_until(&mut registry, |r| r.num_requests() == 0).await?;
        let reply = rx_reply.recv().await.unwrap();
        assert_eq!(reply.msg_type(), Some(MsgType::Exception));
        let body = reply.parse_body::<Exception>()?;
        assert_eq!(body.code, 42);
        assert!(body.message.contains("drive jammed"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn issue_error_fails_request() -> Result<(), AcsError> {
        let (mut registry, _tx_replies_write, mut rx_reply) = test_registry(
            Box::new(ScriptedLibrary::new(vec![Err(
                "vendor link down".into()
            )])),
            Duration::from_secs(600),
        )?;
        registry.check_and_add_request(
            AcsOperation::Dismount,
            "T00003",
            DriveAddr::new(0, 0, 1, 1),
            1,
        )?;
        tick_until(&mut registry, |r| r.num_requests() == 0).await?;
        let reply = rx_reply.recv().await.unwrap();
        let body = reply.parse_body::<Exception>()?;
        assert_eq!(body.code, ecodes::SEINTERNAL);
        assert!(body.message.contains("vendor link down"));
        Ok(())
    }

    #[test]
    fn stale_issue_failure_ignored() -> Result<(), AcsError> {
        let (mut registry, _tx_replies_write, _rx_reply) = test_registry(
            Box::new(ScriptedLibrary::new(vec![])),
            Duration::from_secs(600),
        )?;
        let drive = DriveAddr::new(0, 1, 2, 3);
        let seq_no = registry.check_and_add_request(
            AcsOperation::Dismount,
            "T00001",
            drive,
            1,
        )?;
        // the request gets reaped, then its number is reused
        registry.requests.retain(|r| r.seq_no != seq_no);
        assert_eq!(
            registry.check_and_add_request(
                AcsOperation::Dismount,
                "T00001",
                drive,
                1,
            )?,
            seq_no
        );
        // issue failure left over from the reaped request's lifetime must
        // not touch the fresh one
        registry.fail_request(seq_no, ecodes::SEINTERNAL, "vendor gone")?;
        assert_eq!(registry.requests[0].state(), RequestState::ToExecute);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_timeout_fails_request() -> Result<(), AcsError> {
        // library whose responses never mature within the test
        let (mut registry, _tx_replies_write, mut rx_reply) = test_registry(
            Box::new(SimulatedLibrary::new(Duration::from_secs(3600))),
            Duration::ZERO,
        )?;
        registry.check_and_add_request(
            AcsOperation::MountReadOnly,
            "T00004",
            DriveAddr::new(2, 2, 2, 2),
            1,
        )?;
        tick_until(&mut registry, |r| r.num_requests() == 0).await?;
        let reply = rx_reply.recv().await.unwrap();
        let body = reply.parse_body::<Exception>()?;
        assert_eq!(body.code, ecodes::SETIMEDOUT);
        assert!(body.message.contains("did not conclude"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unmatched_response_dropped() -> Result<(), AcsError> {
        let mut library = ScriptedLibrary::new(vec![]);
        library.push_response(LibraryResponse {
            seq_no: 999,
            status: ResponseStatus::Success,
        });
        let (mut registry, _tx_replies_write, mut rx_reply) =
            test_registry(Box::new(library), Duration::from_secs(600))?;
        registry.check_and_add_request(
            AcsOperation::Dismount,
            "T00005",
            DriveAddr::new(3, 3, 3, 3),
            1,
        )?;
        tick_until(&mut registry, |r| r.num_requests() == 0).await?;
        // only the matching response produced a reply
        let reply = rx_reply.recv().await.unwrap();
        assert_eq!(reply.msg_type(), Some(MsgType::ReturnValue));
        assert!(rx_reply.try_recv().is_err());
        Ok(())
    }
}
