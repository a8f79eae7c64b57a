//! Message sequence sets such as `1:3,5,7:*`.

use crate::error::{Result, StoreError};

/// One end of a range: a message number or `*` (the last message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqNum {
    Number(u32),
    Last,
}

impl SeqNum {
    fn resolve(self, exists: u32) -> u32 {
        match self {
            SeqNum::Number(n) => n,
            SeqNum::Last => exists,
        }
    }
}

/// A parsed, not yet resolved, set of message numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: Vec<(SeqNum, SeqNum)>,
}

impl SequenceSet {
    /// A single message.
    pub fn single(msgno: u32) -> Self {
        Self {
            ranges: vec![(SeqNum::Number(msgno), SeqNum::Number(msgno))],
        }
    }

    /// Every message, `1:*`.
    pub fn all() -> Self {
        Self {
            ranges: vec![(SeqNum::Number(1), SeqNum::Last)],
        }
    }

    /// Parse comma-separated numbers and `a:b` ranges. Ranges may be given
    /// in either order.
    pub fn parse(input: &str) -> Result<Self> {
        let bad = || StoreError::BadSequence(input.to_string());
        let mut ranges = Vec::new();
        for item in input.trim().split(',') {
            let (lo, hi) = match item.split_once(':') {
                Some((a, b)) => (parse_num(a).ok_or_else(bad)?, parse_num(b).ok_or_else(bad)?),
                None => {
                    let n = parse_num(item).ok_or_else(bad)?;
                    (n, n)
                }
            };
            ranges.push((lo, hi));
        }
        Ok(Self { ranges })
    }

    /// Expand into sorted, de-duplicated message numbers.
    ///
    /// Any number outside `1..=exists` is an error, except that `*` in an
    /// empty mailbox simply matches nothing.
    pub fn resolve(&self, exists: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        for &(lo, hi) in &self.ranges {
            if exists == 0 && lo == SeqNum::Last && hi == SeqNum::Last {
                continue;
            }
            let (a, b) = (lo.resolve(exists), hi.resolve(exists));
            let (a, b) = if a <= b { (a, b) } else { (b, a) };
            if exists == 0 && a <= 1 && (lo == SeqNum::Last || hi == SeqNum::Last) {
                continue;
            }
            if b > exists {
                return Err(StoreError::NoSuchMessage(b));
            }
            out.extend(a..=b);
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }
}

impl std::str::FromStr for SequenceSet {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_num(s: &str) -> Option<SeqNum> {
    let s = s.trim();
    if s == "*" {
        return Some(SeqNum::Last);
    }
    match s.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(SeqNum::Number(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ranges() {
        let set = SequenceSet::parse("1:3,5,7:*").unwrap();
        assert_eq!(set.resolve(8).unwrap(), vec![1, 2, 3, 5, 7, 8]);
    }

    #[test]
    fn test_reversed_and_overlapping() {
        let set = SequenceSet::parse("4:2,3").unwrap();
        assert_eq!(set.resolve(5).unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_out_of_range() {
        let set = SequenceSet::parse("2:9").unwrap();
        assert!(matches!(set.resolve(3), Err(StoreError::NoSuchMessage(9))));
    }

    #[test]
    fn test_all_on_empty_mailbox() {
        assert!(SequenceSet::all().resolve(0).unwrap().is_empty());
        assert!(SequenceSet::parse("*").unwrap().resolve(0).unwrap().is_empty());
    }

    #[test]
    fn test_bad_syntax() {
        assert!(SequenceSet::parse("0").is_err());
        assert!(SequenceSet::parse("1,,2").is_err());
        assert!(SequenceSet::parse("a:b").is_err());
    }
}
