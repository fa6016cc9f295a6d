use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{CaskError, Result};
use crate::manifest::format::{EntryKind, Record};
use crate::store::ObjectKey;
use crate::target::Target;

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub userid: Option<String>,
    pub set: String,
    pub when: String,
    /// Also compare object content against the live tree.
    pub compare: bool,
    /// Tree to compare against; when absent, the recorded SOURCE root.
    pub compare_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    /// Compare mode: the local file's content diverged.
    Changed,
    /// Compare mode: the local file is gone.
    Deleted,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub path: String,
    pub outcome: VerifyOutcome,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifyTotals {
    pub ok: u64,
    pub changed: u64,
    pub deleted: u64,
    pub errors: u64,
}

/// Check every F record of a run against the object store, and in compare
/// mode against a local tree. Per-file failures are reported, not fatal.
pub fn run(target: &Target, opts: &VerifyOptions) -> Result<(Vec<VerifyReport>, VerifyTotals)> {
    let log = target.log(opts.userid.as_deref(), &opts.set);
    let mut reports = Vec::new();
    let mut totals = VerifyTotals::default();
    let mut source = String::new();

    for record in log.iter(&opts.when)? {
        match record? {
            Record::Source { root } => source = root,
            Record::Entry(entry) if entry.kind == EntryKind::File => {
                let Some(hash) = entry.hash.clone() else {
                    continue;
                };
                let key = ObjectKey::new(hash, entry.size);
                let outcome = if opts.compare {
                    let base = opts
                        .compare_root
                        .clone()
                        .unwrap_or_else(|| PathBuf::from(&source));
                    let local = base.join(&entry.path);
                    if !local.exists() {
                        VerifyOutcome::Deleted
                    } else {
                        match target.store().verify_compare(&key, &local) {
                            Ok(()) => VerifyOutcome::Ok,
                            Err(CaskError::CompareMismatch(_)) => VerifyOutcome::Changed,
                            Err(e) => VerifyOutcome::Error(e.to_string()),
                        }
                    }
                } else {
                    match target.store().verify(&key) {
                        Ok(()) => VerifyOutcome::Ok,
                        Err(e) => VerifyOutcome::Error(e.to_string()),
                    }
                };

                match &outcome {
                    VerifyOutcome::Ok => totals.ok += 1,
                    VerifyOutcome::Changed => totals.changed += 1,
                    VerifyOutcome::Deleted => totals.deleted += 1,
                    VerifyOutcome::Error(message) => {
                        warn!(path = %entry.path, "verify failed: {message}");
                        totals.errors += 1;
                    }
                }
                reports.push(VerifyReport {
                    path: entry.path,
                    outcome,
                });
            }
            _ => {}
        }
    }

    info!(
        set = %opts.set,
        when = %opts.when,
        ok = totals.ok,
        changed = totals.changed,
        deleted = totals.deleted,
        errors = totals.errors,
        "verify complete"
    );
    Ok((reports, totals))
}
