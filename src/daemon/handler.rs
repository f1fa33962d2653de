//! Router socket message handler: validates incoming frames, dispatches
//! on message type, and admits tape requests into the pending registry.
//! Application-level failures always go back to the peer as exception
//! frames, never as dropped connections.

use async_trait::async_trait;

use crate::daemon::reactor::{EventHandler, PollItem};
use crate::daemon::registry::PendingRequests;
use crate::daemon::request::AcsOperation;
use crate::daemon::router::{PeerId, RouterSocket};
use crate::messages::{
    check_vid, ecodes, frames, AcsDismountTape, AcsForceDismountTape,
    AcsMountTapeReadOnly, AcsMountTapeReadWrite, DriveAddr, Frame, Heartbeat,
    MsgType,
};
use crate::utils::AcsError;

/// Handler for all client-facing message traffic of the daemon.
pub(crate) struct AcsMessageHandler {
    /// The daemon's router socket, owned by this handler.
    socket: RouterSocket,
}

impl AcsMessageHandler {
    pub(crate) fn new(socket: RouterSocket) -> Self {
        AcsMessageHandler { socket }
    }

    /// Admits one tape operation into the registry. The reply is produced
    /// later, once the operation concludes.
    fn admit_request(
        &mut self,
        registry: &mut PendingRequests,
        peer: PeerId,
        operation: AcsOperation,
        vid: &str,
        drive: DriveAddr,
    ) -> Result<(), AcsError> {
        check_vid(vid)?;
        registry.check_and_add_request(operation, vid, drive, peer)?;
        Ok(())
    }

    /// Validates and dispatches one received frame.
    fn handle_frame(
        &mut self,
        peer: PeerId,
        frame: &Frame,
        registry: &mut PendingRequests,
    ) -> Result<(), AcsError> {
        frame.check_header()?;
        frame.check_hash()?;

        match frame.msg_type() {
            Some(MsgType::Heartbeat) => {
                let heartbeat = frame.parse_body::<Heartbeat>()?;
                ad_debug!(
                    "heartbeat from peer {} ({} bytes moved)",
                    peer,
                    heartbeat.bytes_moved
                );
                self.socket.send_to(peer, frames::return_value_frame(0)?)
            }
            Some(MsgType::AcsMountTapeReadOnly) => {
                let body = frame.parse_body::<AcsMountTapeReadOnly>()?;
                self.admit_request(
                    registry,
                    peer,
                    AcsOperation::MountReadOnly,
                    &body.vid,
                    DriveAddr::new(body.acs, body.lsm, body.panel, body.drive),
                )
            }
            Some(MsgType::AcsMountTapeReadWrite) => {
                let body = frame.parse_body::<AcsMountTapeReadWrite>()?;
                self.admit_request(
                    registry,
                    peer,
                    AcsOperation::MountReadWrite,
                    &body.vid,
                    DriveAddr::new(body.acs, body.lsm, body.panel, body.drive),
                )
            }
            Some(MsgType::AcsDismountTape) => {
                let body = frame.parse_body::<AcsDismountTape>()?;
                self.admit_request(
                    registry,
                    peer,
                    AcsOperation::Dismount,
                    &body.vid,
                    DriveAddr::new(body.acs, body.lsm, body.panel, body.drive),
                )
            }
            Some(MsgType::AcsForceDismountTape) => {
                let body = frame.parse_body::<AcsForceDismountTape>()?;
                self.admit_request(
                    registry,
                    peer,
                    AcsOperation::ForceDismount,
                    &body.vid,
                    DriveAddr::new(body.acs, body.lsm, body.panel, body.drive),
                )
            }
            other => {
                // catch-all for types this daemon does not serve
                let msg = match other {
                    Some(msg_type) => {
                        format!("unsupported message type {:?}", msg_type)
                    }
                    None => format!(
                        "unknown message type {}",
                        frame.header.msgtype
                    ),
                };
                ad_warn!("rejecting frame from peer {}: {}", peer, msg);
                self.socket.send_to(
                    peer,
                    frames::exception_frame(ecodes::SEOPNOTSUP, &msg)?,
                )
            }
        }
    }
}

#[async_trait]
impl EventHandler<PendingRequests> for AcsMessageHandler {
    fn name(&self) -> &'static str {
        "acs_message_handler"
    }

    fn poll_item(&self) -> PollItem {
        self.socket.poll_item()
    }

    async fn handle_event(
        &mut self,
        registry: &mut PendingRequests,
    ) -> Result<bool, AcsError> {
        match self.socket.try_recv()? {
            Some((peer, frame)) => {
                if let Err(e) = self.handle_frame(peer, &frame, registry) {
                    ad_warn!(
                        "error handling frame from peer {}: {}",
                        peer,
                        e
                    );
                    let exception = frames::exception_frame_for(&e)?;
                    if let Err(e) = self.socket.send_to(peer, exception) {
                        ad_warn!(
                            "error sending exception to peer {}: {}",
                            peer,
                            e
                        );
                    }
                }
                Ok(false)
            }
            None => {
                ad_debug!("handler woken without a pending frame");
                Ok(false)
            }
        }
    }
}
