use std::collections::HashSet;

use tracing::{info, warn};

use crate::error::Result;
use crate::target::Target;

/// Mark/sweep classification of the object store against the live set.
///
/// `total = verified + orphaned + damaged` counts files on disk; `missing`
/// counts live keys with no object behind them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FsckTotals {
    pub total: u64,
    pub verified: u64,
    pub orphaned: u64,
    pub damaged: u64,
    pub missing: u64,
}

/// Cross-check manifests and the object store. Refuses to run while a
/// `.running` log exists (the live set would be incomplete).
pub fn run(target: &Target) -> Result<FsckTotals> {
    let live = target.live_set()?;
    let mut totals = FsckTotals::default();
    let mut seen: HashSet<_> = HashSet::new();

    for (path, key) in target.store().scan()? {
        totals.total += 1;
        let Some(key) = key else {
            warn!(path = %path.display(), "unrecognised file in object store");
            totals.orphaned += 1;
            continue;
        };
        if !live.contains_key(&key) {
            warn!(key = %key, "orphaned object");
            totals.orphaned += 1;
            seen.insert(key);
            continue;
        }
        match target.store().verify(&key) {
            Ok(()) => totals.verified += 1,
            Err(e) => {
                warn!(key = %key, "damaged object: {e}");
                totals.damaged += 1;
            }
        }
        seen.insert(key);
    }

    totals.missing = live.keys().filter(|k| !seen.contains(*k)).count() as u64;

    info!(
        total = totals.total,
        verified = totals.verified,
        orphaned = totals.orphaned,
        damaged = totals.damaged,
        missing = totals.missing,
        "fsck complete"
    );
    Ok(totals)
}
