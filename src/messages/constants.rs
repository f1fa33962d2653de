//! Protocol constants shared by every frame on the wire.

/// Magic number stamped into every frame header.
pub const MSG_MAGIC: u32 = 0x0014_1001;

/// Protocol type of the tape domain.
pub const PROTOCOL_TYPE_TAPE: u32 = 1;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION_1: u32 = 1;

/// Hash and signature algorithm literal carried in headers.
pub const BODY_HASH_TYPE_SHA1: &str = "SHA1";

/// Placeholder body signature value carried for wire compatibility. No
/// endpoint verifies it; only the body hash is checked.
pub const BODY_SIGNATURE_PIPO: &str = "PIPO";

/// Historical numeric error codes carried in exception replies.
pub mod ecodes {
    /// Base offset of the code space.
    pub const SEBASEOFF: i32 = 1000;
    /// Has timed out.
    pub const SETIMEDOUT: i32 = SEBASEOFF + 4;
    /// Version mismatch.
    pub const SEBADVERSION: i32 = SEBASEOFF + 10;
    /// Entry not found.
    pub const SEENTRYNFND: i32 = SEBASEOFF + 14;
    /// Internal error.
    pub const SEINTERNAL: i32 = SEBASEOFF + 15;
    /// Connection closed by remote end.
    pub const SECONNDROP: i32 = SEBASEOFF + 16;
    /// Communication error.
    pub const SECOMERR: i32 = SEBASEOFF + 18;
    /// Operation not supported.
    pub const SEOPNOTSUP: i32 = SEBASEOFF + 22;
}
