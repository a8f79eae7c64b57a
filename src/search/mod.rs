//! Search engine: criteria parsing and per-message evaluation.

pub mod eval;
pub mod query;

use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::MailboxStore;

use self::eval::{compile, matches_all, MessageView, Predicate};
use self::query::parse_criteria;

/// Message numbers of every message matching all of `criteria`, ascending.
///
/// The criteria are parsed in full before any message is looked at, so a
/// bad criterion never yields a partial result. A message that cannot be
/// parsed simply does not match.
pub fn search(store: &mut MailboxStore, criteria: &str) -> Result<Vec<u32>> {
    let predicates: Vec<Predicate> = parse_criteria(criteria)?
        .into_iter()
        .map(compile)
        .collect();

    let mut matches = Vec::new();
    for msgno in 1..=store.exists_count() {
        let mut view = MessageView::new(store, msgno);
        match matches_all(&predicates, &mut view) {
            Ok(true) => matches.push(msgno),
            Ok(false) => {}
            Err(StoreError::Parse(e)) => {
                warn!(msgno, error = %e, "Unparseable message skipped by search");
            }
            Err(e) => return Err(e),
        }
    }
    debug!(criteria, matched = matches.len(), "Search complete");
    Ok(matches)
}
