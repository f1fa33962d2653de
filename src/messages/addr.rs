//! Drive addressing within a robotic tape library.

use std::fmt;
use std::str::FromStr;

use crate::utils::AcsError;

/// Longest legal volume identifier.
pub const VID_MAX_LEN: usize = 6;

/// Fully qualified drive location inside an automated cartridge system:
/// ACS number, library storage module, panel and drive slot.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct DriveAddr {
    pub acs: u32,
    pub lsm: u32,
    pub panel: u32,
    pub drive: u32,
}

impl DriveAddr {
    pub fn new(acs: u32, lsm: u32, panel: u32, drive: u32) -> Self {
        DriveAddr {
            acs,
            lsm,
            panel,
            drive,
        }
    }
}

impl fmt::Display for DriveAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.acs, self.lsm, self.panel, self.drive
        )
    }
}

impl FromStr for DriveAddr {
    type Err = AcsError;

    /// Parses the operator notation `ACS:LSM:PANEL:DRIVE`, four
    /// colon-separated unsigned integers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 4 {
            return Err(AcsError::Msg(format!(
                "invalid drive slot '{}': expected ACS:LSM:PANEL:DRIVE",
                s
            )));
        }
        Ok(DriveAddr {
            acs: fields[0].parse()?,
            lsm: fields[1].parse()?,
            panel: fields[2].parse()?,
            drive: fields[3].parse()?,
        })
    }
}

/// Validates a volume identifier: nonempty and at most `VID_MAX_LEN`
/// characters.
pub fn check_vid(vid: &str) -> Result<(), AcsError> {
    if vid.is_empty() {
        return Err(AcsError::Msg("volume identifier is empty".into()));
    }
    if vid.len() > VID_MAX_LEN {
        return Err(AcsError::Msg(format!(
            "volume identifier '{}' longer than {} characters",
            vid, VID_MAX_LEN
        )));
    }
    Ok(())
}
