//! Message flags: the fixed system set plus named user keywords.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

bitflags! {
    /// System flags, with the bit values used in the record flag field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SystemFlags: u8 {
        const SEEN = 1;
        const DELETED = 2;
        const FLAGGED = 4;
        const ANSWERED = 8;
        /// The message has been seen by a previous session, so it is not recent.
        const OLD = 16;
        const DRAFT = 32;
    }
}

const NAMED: [(&str, SystemFlags); 5] = [
    ("\\Seen", SystemFlags::SEEN),
    ("\\Answered", SystemFlags::ANSWERED),
    ("\\Flagged", SystemFlags::FLAGGED),
    ("\\Deleted", SystemFlags::DELETED),
    ("\\Draft", SystemFlags::DRAFT),
];

impl SystemFlags {
    /// Look up a `\Name` system flag, case-insensitively. `\Old` is internal
    /// and `\Recent` is session state, so neither is accepted.
    pub fn from_flag_name(name: &str) -> Option<Self> {
        NAMED
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| *f)
    }

    /// `\Name` tokens for the user-visible flags that are set.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        NAMED
            .iter()
            .filter(move |(_, f)| self.contains(*f))
            .map(|(n, _)| *n)
    }
}

/// A flag list as supplied to set/clear/append: system flags plus keywords.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet {
    pub system: SystemFlags,
    pub keywords: Vec<String>,
}

impl FlagSet {
    pub fn new(system: SystemFlags) -> Self {
        Self {
            system,
            keywords: Vec::new(),
        }
    }

    /// Add a keyword unless an equal one (ignoring case) is already present.
    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        let keyword = keyword.into();
        if !self.keywords.iter().any(|k| k.eq_ignore_ascii_case(&keyword)) {
            self.keywords.push(keyword);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.keywords.is_empty()
    }

    /// Parse a flag list such as `(\Seen \Deleted $Forwarded)`.
    ///
    /// The parentheses are optional. Backslash names must be known system
    /// flags; everything else must be a valid keyword atom.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let inner = match trimmed.strip_prefix('(') {
            Some(rest) => rest
                .strip_suffix(')')
                .ok_or_else(|| StoreError::BadFlag(input.to_string()))?,
            None => trimmed,
        };

        let mut set = FlagSet::default();
        for token in inner.split_ascii_whitespace() {
            if token.starts_with('\\') {
                let flag = SystemFlags::from_flag_name(token)
                    .ok_or_else(|| StoreError::BadFlag(token.to_string()))?;
                set.system |= flag;
            } else if is_keyword_atom(token) {
                set = set.with_keyword(token);
            } else {
                return Err(StoreError::BadFlag(token.to_string()));
            }
        }
        Ok(set)
    }
}

impl std::fmt::Display for FlagSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sep = "";
        for name in self.system.names() {
            write!(f, "{sep}{name}")?;
            sep = " ";
        }
        for keyword in &self.keywords {
            write!(f, "{sep}{keyword}")?;
            sep = " ";
        }
        Ok(())
    }
}

/// Whether `token` can be used as a user keyword.
pub fn is_keyword_atom(token: &str) -> bool {
    !token.is_empty()
        && token.bytes().all(|b| {
            b.is_ascii_graphic() && !matches!(b, b'(' | b')' | b'{' | b'"' | b'\\' | b'%' | b'*' | b']')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag_list() {
        let set = FlagSet::parse("(\\Seen \\deleted $Forwarded Work)").unwrap();
        assert_eq!(set.system, SystemFlags::SEEN | SystemFlags::DELETED);
        assert_eq!(set.keywords, vec!["$Forwarded", "Work"]);
        assert_eq!(set.to_string(), "\\Seen \\Deleted $Forwarded Work");
    }

    #[test]
    fn test_parse_without_parens() {
        let set = FlagSet::parse("\\Flagged").unwrap();
        assert_eq!(set.system, SystemFlags::FLAGGED);
        assert!(set.keywords.is_empty());
    }

    #[test]
    fn test_duplicate_keywords_ignore_case() {
        let set = FlagSet::parse("Work work WORK").unwrap();
        assert_eq!(set.keywords, vec!["Work"]);
    }

    #[test]
    fn test_rejects_unknown_system_flag() {
        assert!(matches!(
            FlagSet::parse("\\Recent"),
            Err(StoreError::BadFlag(_))
        ));
        assert!(FlagSet::parse("\\Old").is_err());
        assert!(FlagSet::parse("(\\Seen").is_err());
        assert!(FlagSet::parse("bad\"kw").is_err());
    }

    #[test]
    fn test_flag_name_lookup() {
        assert_eq!(SystemFlags::from_flag_name("\\SEEN"), Some(SystemFlags::SEEN));
        assert_eq!(SystemFlags::from_flag_name("\\Recent"), None);
        assert_eq!(
            FlagSet::new(SystemFlags::FLAGGED).with_keyword("Work").to_string(),
            "\\Flagged Work"
        );
        assert_eq!(FlagSet::default().with_keyword("Later").to_string(), "Later");
    }

    #[test]
    fn test_record_bit_values() {
        assert_eq!(SystemFlags::SEEN.bits(), 1);
        assert_eq!(SystemFlags::DELETED.bits(), 2);
        assert_eq!(SystemFlags::FLAGGED.bits(), 4);
        assert_eq!(SystemFlags::ANSWERED.bits(), 8);
        assert_eq!(SystemFlags::OLD.bits(), 16);
        assert_eq!(SystemFlags::DRAFT.bits(), 32);
    }
}
