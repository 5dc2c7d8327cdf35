//! Binlog coordinates

use std::cmp::Ordering;
use std::fmt;

use crate::error::{ProxyError, Result};

/// A binlog file name plus byte offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Position {
    pub name: String,
    pub pos: u32,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// Order by file name (see [`compare_binlog_file_name`]), then offset.
    pub fn compare(&self, other: &Position) -> Result<Ordering> {
        let by_name = compare_binlog_file_name(&self.name, &other.name)?;
        Ok(by_name.then(self.pos.cmp(&other.pos)))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

/// Compare two binlog file names such as `mysql-bin.000012`.
///
/// An empty name sorts before any other. Names compare by base name, then
/// by the numeric extension; a name without a `.` has sequence 0. A
/// non-numeric extension is an error.
pub fn compare_binlog_file_name(a: &str, b: &str) -> Result<Ordering> {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ok(Ordering::Equal),
        (true, false) => return Ok(Ordering::Less),
        (false, true) => return Ok(Ordering::Greater),
        (false, false) => {}
    }

    let (a_base, a_seq) = split_binlog_name(a)?;
    let (b_base, b_seq) = split_binlog_name(b)?;
    Ok(a_base.cmp(b_base).then(a_seq.cmp(&b_seq)))
}

fn split_binlog_name(name: &str) -> Result<(&str, u64)> {
    match name.rfind('.') {
        None => Ok((name, 0)),
        Some(i) => {
            let seq = name[i + 1..].parse::<u64>().map_err(|_| {
                ProxyError::Protocol(format!(
                    "binlog file {} doesn't contain numeric extension",
                    name
                ))
            })?;
            Ok((&name[..i], seq))
        }
    }
}
