//! LSN (Log Sequence Number) utilities for PostgreSQL replication.

use std::fmt;
use std::str::FromStr;

use crate::error::{PgError, PgResult};

/// Position in the server's write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_lsn(self.0))
    }
}

impl FromStr for Lsn {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        parse_lsn(s).map(Lsn)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// Parse LSN from "X/Y" format to u64.
pub fn parse_lsn(lsn: &str) -> PgResult<u64> {
    let (high, low) = lsn
        .split_once('/')
        .ok_or_else(|| PgError::InvalidLsn(lsn.to_string()))?;

    let high = u32::from_str_radix(high, 16).map_err(|_| PgError::InvalidLsn(lsn.to_string()))?;
    let low = u32::from_str_radix(low, 16).map_err(|_| PgError::InvalidLsn(lsn.to_string()))?;

    Ok((u64::from(high) << 32) | u64::from(low))
}

/// Format u64 LSN to "X/Y" format.
pub fn format_lsn(lsn: u64) -> String {
    let high = lsn >> 32;
    let low = lsn & 0xFFFFFFFF;
    format!("{:X}/{:X}", high, low)
}
