// Licensed under the Apache-2.0 license

use core::cmp::Ordering;
use core::fmt;
use flash_layout::{VERSION_DEV_LEN, VERSION_JSON_OFFSET, VERSION_LEN, VERSION_OFFSET};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("development versions cannot be compared")]
    Incomparable,
    #[error("empty version")]
    Empty,
    #[error("unrecognized version {0:?}")]
    Unparseable(String),
}

/// A firmware version as stored in the version partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionTag {
    /// `vMAJOR.MINOR`
    LegacyNumeric(u32, u32),
    /// `YYYYMMDD`
    DateNumeric(u32),
    Dev,
    /// Erased flash, no version programmed.
    Blank,
}

impl VersionTag {
    pub fn parse(raw: &[u8]) -> Result<Self, VersionError> {
        if !raw.is_empty() && raw.iter().all(|&b| b == 0xff) {
            return Ok(VersionTag::Blank);
        }
        let end = raw
            .iter()
            .rposition(|&b| b != 0xff && b != 0 && !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        let text = &raw[..end];
        if text.is_empty() {
            return Err(VersionError::Empty);
        }
        let unparseable =
            || VersionError::Unparseable(String::from_utf8_lossy(text).into_owned());
        if text.starts_with(b"dev") {
            return Ok(VersionTag::Dev);
        }
        let text = core::str::from_utf8(text).map_err(|_| unparseable())?;

        if let Some(rest) = text.strip_prefix('v') {
            let (major, minor) = rest.split_once('.').ok_or_else(unparseable)?;
            let major = major.parse().map_err(|_| unparseable())?;
            let minor = minor.parse().map_err(|_| unparseable())?;
            return Ok(VersionTag::LegacyNumeric(major, minor));
        }
        if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
            let date = text.parse().map_err(|_| unparseable())?;
            return Ok(VersionTag::DateNumeric(date));
        }
        Err(unparseable())
    }

    /// Parses the version field of a version partition or `-ver.bin` file.
    pub fn from_version_blob(blob: &[u8]) -> Result<Self, VersionError> {
        let end = blob.len().min(VERSION_OFFSET + VERSION_LEN);
        let field = blob.get(VERSION_OFFSET..end).unwrap_or_default();
        if field.len() >= VERSION_DEV_LEN && &field[..VERSION_DEV_LEN] == b"dev" {
            return Ok(VersionTag::Dev);
        }
        Self::parse(field)
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionTag::LegacyNumeric(major, minor) => write!(f, "v{major}.{minor}"),
            VersionTag::DateNumeric(date) => write!(f, "{date:08}"),
            VersionTag::Dev => f.write_str("dev"),
            VersionTag::Blank => f.write_str("(blank)"),
        }
    }
}

/// Returns whether `candidate` is newer than `current`.
///
/// Blank sorts below everything, date versions sort above all legacy
/// versions. `Dev` builds have no position in the order.
pub fn is_newer(current: &VersionTag, candidate: &VersionTag) -> Result<bool, VersionError> {
    use VersionTag::*;
    let ord = match (current, candidate) {
        (Dev, _) | (_, Dev) => return Err(VersionError::Incomparable),
        (Blank, Blank) => Ordering::Equal,
        (Blank, _) => Ordering::Less,
        (_, Blank) => Ordering::Greater,
        (LegacyNumeric(a, b), LegacyNumeric(c, d)) => (a, b).cmp(&(c, d)),
        (DateNumeric(a), DateNumeric(b)) => a.cmp(b),
        (LegacyNumeric(..), DateNumeric(_)) => Ordering::Less,
        (DateNumeric(_), LegacyNumeric(..)) => Ordering::Greater,
    };
    Ok(ord == Ordering::Less)
}

/// The JSON description stored after the version field, if any.
pub fn version_json(blob: &[u8]) -> Option<&str> {
    let tail = blob.get(VERSION_JSON_OFFSET..)?;
    let end = tail
        .iter()
        .position(|&b| b == 0 || b == 0xff)
        .unwrap_or(tail.len());
    let json = core::str::from_utf8(&tail[..end]).ok()?.trim();
    (!json.is_empty()).then_some(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            VersionTag::parse(b"v0.2").unwrap(),
            VersionTag::LegacyNumeric(0, 2)
        );
        assert_eq!(
            VersionTag::parse(b"v1.12\xff\xff\xff").unwrap(),
            VersionTag::LegacyNumeric(1, 12)
        );
        assert_eq!(
            VersionTag::parse(b"20170901").unwrap(),
            VersionTag::DateNumeric(20170901)
        );
        assert_eq!(VersionTag::parse(b"dev\0\0").unwrap(), VersionTag::Dev);
        assert_eq!(VersionTag::parse(&[0xff; 8]).unwrap(), VersionTag::Blank);
        assert_eq!(VersionTag::parse(b""), Err(VersionError::Empty));
        assert_eq!(VersionTag::parse(b"\0\0\0"), Err(VersionError::Empty));
        assert!(matches!(
            VersionTag::parse(b"2017"),
            Err(VersionError::Unparseable(_))
        ));
        assert!(matches!(
            VersionTag::parse(b"v1"),
            Err(VersionError::Unparseable(_))
        ));
    }

    #[test]
    fn test_from_version_blob() {
        let mut blob = vec![0xff; 0x200];
        blob[..8].copy_from_slice(b"20180101");
        assert_eq!(
            VersionTag::from_version_blob(&blob).unwrap(),
            VersionTag::DateNumeric(20180101)
        );
        blob[..8].copy_from_slice(b"dev-1234");
        assert_eq!(VersionTag::from_version_blob(&blob).unwrap(), VersionTag::Dev);
        assert_eq!(
            VersionTag::from_version_blob(b"v0.3").unwrap(),
            VersionTag::LegacyNumeric(0, 3)
        );
    }

    #[test]
    fn test_dev_incomparable() {
        let date = VersionTag::DateNumeric(20170901);
        assert_eq!(
            is_newer(&VersionTag::Dev, &date),
            Err(VersionError::Incomparable)
        );
        assert_eq!(
            is_newer(&date, &VersionTag::Dev),
            Err(VersionError::Incomparable)
        );
    }

    #[test]
    fn test_equal_versions_not_newer() {
        let v = VersionTag::DateNumeric(20170901);
        assert!(!is_newer(&v, &v).unwrap());
        assert!(!is_newer(&VersionTag::Blank, &VersionTag::Blank).unwrap());
    }

    #[test]
    fn test_version_json() {
        let mut blob = vec![0xff; 0x200];
        assert_eq!(version_json(&blob), None);
        let json = br#"{"commit":"abc"}"#;
        blob[0x100..0x100 + json.len()].copy_from_slice(json);
        assert_eq!(version_json(&blob), Some(r#"{"commit":"abc"}"#));
        assert_eq!(version_json(b"short"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(VersionTag::LegacyNumeric(0, 3).to_string(), "v0.3");
        assert_eq!(VersionTag::DateNumeric(20170901).to_string(), "20170901");
    }
}
