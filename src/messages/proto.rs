//! Protobuf wire message structs.
//!
//! The message set is small and frozen, so the structs carry hand-written
//! `prost` derive attributes (proto2 semantics, all fields required) instead
//! of going through a build-script code generator.

/// Frame header shared by every message in the fleet. The body hash fields
/// carry a base64 SHA1 digest of the body bytes; the signature fields are a
/// structural placeholder, not a security control.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(uint32, required, tag = "1")]
    pub magic: u32,
    #[prost(uint32, required, tag = "2")]
    pub protocoltype: u32,
    #[prost(uint32, required, tag = "3")]
    pub protocolversion: u32,
    #[prost(uint32, required, tag = "4")]
    pub msgtype: u32,
    #[prost(string, required, tag = "5")]
    pub bodyhashtype: String,
    #[prost(string, required, tag = "6")]
    pub bodyhashvalue: String,
    #[prost(string, required, tag = "7")]
    pub bodysignaturetype: String,
    #[prost(string, required, tag = "8")]
    pub bodysignature: String,
}

/// Generic success/failure reply carrying a bare return code (0 = success).
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReturnValue {
    #[prost(int32, required, tag = "1")]
    pub value: i32,
}

/// Error reply carrying a numeric code and human-readable text.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Exception {
    #[prost(int32, required, tag = "1")]
    pub code: i32,
    #[prost(string, required, tag = "2")]
    pub message: String,
}

/// Liveness probe request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(uint64, required, tag = "1")]
    pub bytes_moved: u64,
}

/// Request to mount the tape `vid` for reading into the drive at the given
/// library coordinates.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AcsMountTapeReadOnly {
    #[prost(string, required, tag = "1")]
    pub vid: String,
    #[prost(uint32, required, tag = "2")]
    pub acs: u32,
    #[prost(uint32, required, tag = "3")]
    pub lsm: u32,
    #[prost(uint32, required, tag = "4")]
    pub panel: u32,
    #[prost(uint32, required, tag = "5")]
    pub drive: u32,
}

/// Request to mount the tape `vid` for reading and writing.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AcsMountTapeReadWrite {
    #[prost(string, required, tag = "1")]
    pub vid: String,
    #[prost(uint32, required, tag = "2")]
    pub acs: u32,
    #[prost(uint32, required, tag = "3")]
    pub lsm: u32,
    #[prost(uint32, required, tag = "4")]
    pub panel: u32,
    #[prost(uint32, required, tag = "5")]
    pub drive: u32,
}

/// Request to dismount the tape `vid` from the given drive.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AcsDismountTape {
    #[prost(string, required, tag = "1")]
    pub vid: String,
    #[prost(uint32, required, tag = "2")]
    pub acs: u32,
    #[prost(uint32, required, tag = "3")]
    pub lsm: u32,
    #[prost(uint32, required, tag = "4")]
    pub panel: u32,
    #[prost(uint32, required, tag = "5")]
    pub drive: u32,
}

/// Request to dismount the tape `vid` even if the drive has not unloaded it.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AcsForceDismountTape {
    #[prost(string, required, tag = "1")]
    pub vid: String,
    #[prost(uint32, required, tag = "2")]
    pub acs: u32,
    #[prost(uint32, required, tag = "3")]
    pub lsm: u32,
    #[prost(uint32, required, tag = "4")]
    pub panel: u32,
    #[prost(uint32, required, tag = "5")]
    pub drive: u32,
}

/// Message type carried in `Header.msgtype`. Closed set; anything not
/// listed here is rejected at dispatch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    prost::Enumeration,
)]
#[repr(i32)]
pub enum MsgType {
    None = 0,
    Exception = 1,
    Heartbeat = 2,
    ReturnValue = 3,
    AcsMountTapeReadOnly = 4,
    AcsMountTapeReadWrite = 5,
    AcsDismountTape = 6,
    AcsForceDismountTape = 7,
}
