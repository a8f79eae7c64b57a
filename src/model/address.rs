//! RFC822 address (RFC 5322 §3.4 mailbox).

use serde::{Deserialize, Serialize};

/// A parsed mailbox address.
///
/// # Examples
/// - `"Juan García <juan@ejemplo.com>"` → `personal = Some("Juan García")`, `mailbox = "juan"`, `host = "ejemplo.com"`
/// - `"<@relay.net:user@example.com>"` → `adl = Some("@relay.net")`
/// - `"postmaster"` → `mailbox = "postmaster"`, `host` = the parser's default host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Display name, quotes removed.
    pub personal: Option<String>,
    /// Obsolete source route, e.g. `@a.net,@b.net`.
    pub adl: Option<String>,
    /// Local part.
    pub mailbox: String,
    /// Domain part.
    pub host: String,
}

impl Address {
    /// Build a plain `mailbox@host` address.
    pub fn new(mailbox: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            personal: None,
            adl: None,
            mailbox: mailbox.into(),
            host: host.into(),
        }
    }

    /// Attach a display name.
    pub fn with_personal(mut self, personal: impl Into<String>) -> Self {
        self.personal = Some(personal.into());
        self
    }

    /// The bare `mailbox@host` form.
    pub fn addr_spec(&self) -> String {
        let mut out = String::new();
        crate::parser::address::write_addr_spec(&mut out, self);
        out
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        crate::parser::address::write_address(&mut out, self);
        f.write_str(&out)
    }
}
