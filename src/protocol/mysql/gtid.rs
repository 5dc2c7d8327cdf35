//! GTID sets for the two supported server flavors.
//!
//! MySQL sets are `uuid:interval[:interval...]` groups; MariaDB sets are
//! `domain-server-sequence` triples with one entry per replication domain.
//! Callers that do not care about the flavor work through [`GtidSet`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::error::{ProxyError, Result};

pub const MYSQL_FLAVOR: &str = "mysql";
pub const MARIADB_FLAVOR: &str = "mariadb";

/// Flavor-independent GTID set operations.
pub trait GtidSet: fmt::Display + fmt::Debug + Send + Sync {
    /// Binary form used in binlog dump commands.
    fn encode(&self) -> Vec<u8>;

    fn equal(&self, other: &dyn GtidSet) -> bool;

    /// Whether every transaction in `other` is also in `self`.
    fn contain(&self, other: &dyn GtidSet) -> bool;

    /// Merge the textual GTID set `gtid` into `self`.
    fn update(&mut self, gtid: &str) -> Result<()>;

    fn clone_box(&self) -> Box<dyn GtidSet>;

    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn GtidSet> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Parse `s` as a GTID set of the given flavor (`mysql` or `mariadb`).
pub fn parse_gtid_set(flavor: &str, s: &str) -> Result<Box<dyn GtidSet>> {
    match flavor {
        MYSQL_FLAVOR => Ok(Box::new(MysqlGtidSet::parse(s)?)),
        MARIADB_FLAVOR => Ok(Box::new(MariadbGtidSet::parse(s)?)),
        other => Err(ProxyError::Protocol(format!("invalid flavor {}", other))),
    }
}

fn invalid(what: &str, s: &str) -> ProxyError {
    ProxyError::Protocol(format!("invalid {} '{}'", what, s))
}

// ============================================================================
// MySQL
// ============================================================================

/// Half-open transaction range `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: i64,
    pub stop: i64,
}

impl Interval {
    /// Parse `n` or `a-b` (inclusive on the wire).
    pub fn parse(s: &str) -> Result<Self> {
        let number = |v: &str| v.trim().parse::<i64>().map_err(|_| invalid("interval", s));
        let past = |v: i64| v.checked_add(1).ok_or_else(|| invalid("interval", s));
        let (start, stop) = match s.split_once('-') {
            Some((a, b)) => (number(a)?, past(number(b)?)?),
            None => {
                let v = number(s)?;
                (v, past(v)?)
            }
        };
        if stop <= start {
            return Err(invalid("interval", s));
        }
        Ok(Self { start, stop })
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stop == self.start + 1 {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.stop - 1)
        }
    }
}

/// Sort and merge overlapping or adjacent intervals.
fn normalize(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start <= last.stop => last.stop = last.stop.max(interval.stop),
            _ => merged.push(interval),
        }
    }
    merged
}

/// All intervals executed for one server UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidSet {
    pub sid: Uuid,
    pub intervals: Vec<Interval>,
}

impl UuidSet {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(':');
        let sid = parts
            .next()
            .and_then(|p| Uuid::parse_str(p.trim()).ok())
            .ok_or_else(|| invalid("GTID uuid set", s))?;
        let intervals = parts.map(Interval::parse).collect::<Result<Vec<_>>>()?;
        if intervals.is_empty() {
            return Err(invalid("GTID uuid set", s));
        }
        Ok(Self {
            sid,
            intervals: normalize(intervals),
        })
    }

    fn add_intervals(&mut self, intervals: &[Interval]) {
        let mut all = std::mem::take(&mut self.intervals);
        all.extend_from_slice(intervals);
        self.intervals = normalize(all);
    }

    fn contains(&self, other: &UuidSet) -> bool {
        other.intervals.iter().all(|o| {
            self.intervals
                .iter()
                .any(|i| i.start <= o.start && o.stop <= i.stop)
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.sid.as_bytes());
        buf.extend_from_slice(&(self.intervals.len() as u64).to_le_bytes());
        for interval in &self.intervals {
            buf.extend_from_slice(&interval.start.to_le_bytes());
            buf.extend_from_slice(&interval.stop.to_le_bytes());
        }
    }
}

impl fmt::Display for UuidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid)?;
        for interval in &self.intervals {
            write!(f, ":{}", interval)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MysqlGtidSet {
    sets: BTreeMap<Uuid, UuidSet>,
}

impl MysqlGtidSet {
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = Self::default();
        set.merge_str(s)?;
        Ok(set)
    }

    pub fn add_set(&mut self, uuid_set: UuidSet) {
        match self.sets.get_mut(&uuid_set.sid) {
            Some(existing) => existing.add_intervals(&uuid_set.intervals),
            None => {
                self.sets.insert(uuid_set.sid, uuid_set);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn merge_str(&mut self, s: &str) -> Result<()> {
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            self.add_set(UuidSet::parse(part)?);
        }
        Ok(())
    }
}

impl fmt::Display for MysqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.sets.values().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl GtidSet for MysqlGtidSet {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.sets.len() * 40);
        buf.extend_from_slice(&(self.sets.len() as u64).to_le_bytes());
        for set in self.sets.values() {
            set.encode_into(&mut buf);
        }
        buf
    }

    fn equal(&self, other: &dyn GtidSet) -> bool {
        other
            .as_any()
            .downcast_ref::<MysqlGtidSet>()
            .is_some_and(|o| o == self)
    }

    fn contain(&self, other: &dyn GtidSet) -> bool {
        let Some(other) = other.as_any().downcast_ref::<MysqlGtidSet>() else {
            return false;
        };
        other.sets.values().all(|o| {
            self.sets
                .get(&o.sid)
                .is_some_and(|mine| mine.contains(o))
        })
    }

    fn update(&mut self, gtid: &str) -> Result<()> {
        self.merge_str(gtid)
    }

    fn clone_box(&self) -> Box<dyn GtidSet> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// MariaDB
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MariadbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence_number: u64,
}

impl MariadbGtid {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        if parts.len() != 3 {
            return Err(invalid("MariaDB GTID", s));
        }
        let domain_id = parts[0].parse().map_err(|_| invalid("MariaDB GTID", s))?;
        let server_id = parts[1].parse().map_err(|_| invalid("MariaDB GTID", s))?;
        let sequence_number = parts[2].parse().map_err(|_| invalid("MariaDB GTID", s))?;
        Ok(Self {
            domain_id,
            server_id,
            sequence_number,
        })
    }
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.domain_id, self.server_id, self.sequence_number
        )
    }
}

/// Latest GTID per replication domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MariadbGtidSet {
    sets: BTreeMap<u32, MariadbGtid>,
}

impl MariadbGtidSet {
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = Self::default();
        set.merge_str(s)?;
        Ok(set)
    }

    /// Record `gtid`, keeping the higher sequence number per domain.
    pub fn add(&mut self, gtid: MariadbGtid) {
        self.sets
            .entry(gtid.domain_id)
            .and_modify(|current| {
                if gtid.sequence_number > current.sequence_number {
                    *current = gtid;
                }
            })
            .or_insert(gtid);
    }

    pub fn get(&self, domain_id: u32) -> Option<&MariadbGtid> {
        self.sets.get(&domain_id)
    }

    fn merge_str(&mut self, s: &str) -> Result<()> {
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            self.add(MariadbGtid::parse(part)?);
        }
        Ok(())
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.sets.values().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl GtidSet for MariadbGtidSet {
    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn equal(&self, other: &dyn GtidSet) -> bool {
        other
            .as_any()
            .downcast_ref::<MariadbGtidSet>()
            .is_some_and(|o| o == self)
    }

    fn contain(&self, other: &dyn GtidSet) -> bool {
        let Some(other) = other.as_any().downcast_ref::<MariadbGtidSet>() else {
            return false;
        };
        other.sets.values().all(|o| {
            self.sets
                .get(&o.domain_id)
                .is_some_and(|mine| mine.sequence_number >= o.sequence_number)
        })
    }

    fn update(&mut self, gtid: &str) -> Result<()> {
        self.merge_str(gtid)
    }

    fn clone_box(&self) -> Box<dyn GtidSet> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn test_mysql_intervals_merge() {
        let set = MysqlGtidSet::parse(&format!("{SID}:1-5:6-7:10")).unwrap();
        assert_eq!(set.to_string(), format!("{SID}:1-7:10"));
    }

    #[test]
    fn test_mysql_contain_and_equal() {
        let big = parse_gtid_set(MYSQL_FLAVOR, &format!("{SID}:1-100")).unwrap();
        let small = parse_gtid_set(MYSQL_FLAVOR, &format!("{SID}:20-30:40")).unwrap();

        assert!(big.contain(small.as_ref()));
        assert!(!small.contain(big.as_ref()));
        assert!(!big.equal(small.as_ref()));
        assert!(big.equal(big.clone().as_ref()));
    }

    #[test]
    fn test_mysql_update() {
        let mut set = parse_gtid_set(MYSQL_FLAVOR, &format!("{SID}:1-5")).unwrap();
        set.update(&format!("{SID}:6-9")).unwrap();
        assert_eq!(set.to_string(), format!("{SID}:1-9"));
    }

    #[test]
    fn test_mysql_encode_layout() {
        let set = MysqlGtidSet::parse(&format!("{SID}:1-5")).unwrap();
        let encoded = set.encode();
        // count + sid + interval count + one interval
        assert_eq!(encoded.len(), 8 + 16 + 8 + 16);
        assert_eq!(&encoded[..8], &1u64.to_le_bytes());
        assert_eq!(&encoded[32..40], &1i64.to_le_bytes());
        assert_eq!(&encoded[40..48], &6i64.to_le_bytes());
    }

    #[test]
    fn test_mariadb_keeps_highest_sequence() {
        let mut set = MariadbGtidSet::parse("0-1-100,1-2-5").unwrap();
        set.update("0-3-50,1-2-9").unwrap();
        assert_eq!(set.get(0).unwrap().sequence_number, 100);
        assert_eq!(set.get(1).unwrap().sequence_number, 9);
        assert_eq!(set.to_string(), "0-1-100,1-2-9");
    }

    #[test]
    fn test_mariadb_contain() {
        let a = parse_gtid_set(MARIADB_FLAVOR, "0-1-100,1-2-5").unwrap();
        let b = parse_gtid_set(MARIADB_FLAVOR, "0-1-50").unwrap();
        assert!(a.contain(b.as_ref()));
        assert!(!b.contain(a.as_ref()));
    }

    #[test]
    fn test_flavors_do_not_mix() {
        let mysql = parse_gtid_set(MYSQL_FLAVOR, &format!("{SID}:1")).unwrap();
        let mariadb = parse_gtid_set(MARIADB_FLAVOR, "0-1-1").unwrap();
        assert!(!mysql.equal(mariadb.as_ref()));
        assert!(!mysql.contain(mariadb.as_ref()));
    }

    #[test]
    fn test_invalid_input() {
        assert!(parse_gtid_set("postgres", "").is_err());
        assert!(parse_gtid_set(MYSQL_FLAVOR, "not-a-uuid:1").is_err());
        assert!(parse_gtid_set(MYSQL_FLAVOR, &format!("{SID}:5-1")).is_err());
        assert!(parse_gtid_set(MARIADB_FLAVOR, "0-1").is_err());
    }

    #[test]
    fn test_interval_at_i64_max_is_rejected() {
        let max = i64::MAX;
        assert!(Interval::parse(&max.to_string()).is_err());
        assert!(Interval::parse(&format!("1-{max}")).is_err());
        assert!(parse_gtid_set(MYSQL_FLAVOR, &format!("{SID}:{max}")).is_err());

        let below = Interval::parse(&format!("{}", max - 1)).unwrap();
        assert_eq!(below.stop, max);
    }
}
