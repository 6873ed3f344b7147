use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DupError, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const UID_BYTES: usize = 16;

/// Kind of remote object; determines the filename suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteVolumeType {
    Blocks,
    Index,
    Files,
}

impl RemoteVolumeType {
    pub fn suffix(&self) -> &'static str {
        match self {
            RemoteVolumeType::Blocks => "dblock",
            RemoteVolumeType::Index => "dindex",
            RemoteVolumeType::Files => "dlist",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "dblock" => Some(RemoteVolumeType::Blocks),
            "dindex" => Some(RemoteVolumeType::Index),
            "dlist" => Some(RemoteVolumeType::Files),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteVolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Components of a remote volume filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVolumeName {
    pub prefix: String,
    pub file_type: RemoteVolumeType,
    pub uid: String,
    pub time: DateTime<Utc>,
    pub compression: String,
    pub encryption: Option<String>,
}

/// Fresh random unique id for a volume filename.
pub fn generate_uid() -> String {
    hex::encode(rand::random::<[u8; UID_BYTES]>())
}

/// Build a remote filename:
/// `{prefix}-{YYYYMMDDTHHMMSSZ}-{uid}.{dblock|dindex|dlist}.{compression}[.{encryption}]`.
///
/// Sub-second precision is dropped so that a parsed name regenerates byte-for-byte.
pub fn generate_filename(
    file_type: RemoteVolumeType,
    prefix: &str,
    uid: &str,
    time: DateTime<Utc>,
    compression: &str,
    encryption: Option<&str>,
) -> String {
    let mut name = format!(
        "{prefix}-{}-{uid}.{}.{compression}",
        time.format(TIMESTAMP_FORMAT),
        file_type.suffix()
    );
    if let Some(enc) = encryption {
        name.push('.');
        name.push_str(enc);
    }
    name
}

pub fn parse_filename(name: &str) -> Result<ParsedVolumeName> {
    let invalid = || DupError::InvalidFilename(name.to_string());

    let mut parts = name.split('.');
    let base = parts.next().ok_or_else(invalid)?;
    let file_type = parts
        .next()
        .and_then(RemoteVolumeType::from_suffix)
        .ok_or_else(invalid)?;
    let compression = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let encryption = parts.next().map(str::to_string);
    if parts.next().is_some() {
        return Err(invalid());
    }

    let mut fields = base.rsplitn(3, '-');
    let uid = fields.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let stamp = fields.next().ok_or_else(invalid)?;
    let prefix = fields.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|_| invalid())?;

    Ok(ParsedVolumeName {
        prefix: prefix.to_string(),
        file_type,
        uid: uid.to_string(),
        time: Utc.from_utc_datetime(&naive),
        compression: compression.to_string(),
        encryption,
    })
}

impl ParsedVolumeName {
    pub fn to_filename(&self) -> String {
        generate_filename(
            self.file_type,
            &self.prefix,
            &self.uid,
            self.time,
            &self.compression,
            self.encryption.as_deref(),
        )
    }
}
