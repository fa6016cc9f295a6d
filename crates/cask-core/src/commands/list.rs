use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Result;
use crate::manifest::format::{expand_when, FileEntry, Record, RunStats};
use crate::target::Target;

/// Narrowing criteria for run enumeration; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub userid: Option<String>,
    pub set: Option<String>,
    pub when: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// One finalised run, summarised from its STATUS line.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub userid: Option<String>,
    pub set: String,
    pub when: String,
    pub time: DateTime<Utc>,
    pub status: Option<String>,
    pub stats: Option<RunStats>,
}

/// Enumerate finalised runs matching the filter, oldest first.
pub fn runs(target: &Target, filter: &ListFilter) -> Result<Vec<RunSummary>> {
    let mut summaries = Vec::new();
    for log_ref in target.logs()? {
        if filter.userid.as_deref().is_some_and(|u| {
            log_ref.userid.as_deref() != Some(u)
        }) {
            continue;
        }
        if filter.set.as_deref().is_some_and(|s| log_ref.set != s) {
            continue;
        }
        if filter.when.as_deref().is_some_and(|w| log_ref.when != w) {
            continue;
        }
        let time = match expand_when(&log_ref.when) {
            Ok(time) => time,
            Err(e) => {
                warn!(set = %log_ref.set, when = %log_ref.when, "skipping log: {e}");
                continue;
            }
        };
        if filter.since.is_some_and(|since| time < since) {
            continue;
        }

        let log = target.log(log_ref.userid.as_deref(), &log_ref.set);
        let mut status = None;
        let mut stats = None;
        for record in log.iter(&log_ref.when)? {
            if let Record::Status {
                status: word,
                stats_json,
                ..
            } = record?
            {
                stats = serde_json::from_str(&stats_json).ok();
                status = Some(word);
            }
        }

        summaries.push(RunSummary {
            userid: log_ref.userid,
            set: log_ref.set,
            when: log_ref.when,
            time,
            status,
            stats,
        });
    }
    Ok(summaries)
}

/// Per-file detail of one run: its D/F entries in record order.
pub fn entries(
    target: &Target,
    userid: Option<&str>,
    set: &str,
    when: &str,
) -> Result<Vec<FileEntry>> {
    let log = target.log(userid, set);
    let mut entries = Vec::new();
    for record in log.iter(when)? {
        if let Record::Entry(entry) = record? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::backup::{self, BackupOptions, SourceSpec};
    use crate::testutil::{temp_target, write_source_file};

    fn backup_as(target: &Target, userid: Option<&str>, set: &str, src: &std::path::Path) {
        let mut opts = BackupOptions::new(set);
        opts.userid = userid.map(str::to_string);
        opts.sources.push(SourceSpec::new(src));
        backup::run(target, &opts).unwrap();
    }

    #[test]
    fn runs_report_status_and_stats() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        backup_as(&target, None, "set1", &src);

        let summaries = runs(&target, &ListFilter::default()).unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.set, "set1");
        assert_eq!(summary.status.as_deref(), Some("OK"));
        assert_eq!(summary.stats.as_ref().unwrap().files, 1);
    }

    #[test]
    fn filter_narrows_by_set_and_userid() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        backup_as(&target, None, "set1", &src);
        std::thread::sleep(std::time::Duration::from_millis(5));
        backup_as(&target, Some("u1"), "set2", &src);

        let all = runs(&target, &ListFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let only_set2 = runs(
            &target,
            &ListFilter {
                set: Some("set2".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(only_set2.len(), 1);
        assert_eq!(only_set2[0].userid.as_deref(), Some("u1"));
    }

    #[test]
    fn since_excludes_older_runs() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "a.txt", b"hello\n");
        backup_as(&target, None, "set1", &src);

        let future = Utc::now() + chrono::Duration::hours(1);
        let none = runs(
            &target,
            &ListFilter {
                since: Some(future),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn entries_return_per_file_detail() {
        let (tmp, target) = temp_target();
        let src = tmp.path().join("src");
        write_source_file(&src, "sub/a.txt", b"hello\n");
        backup_as(&target, None, "set1", &src);

        let detail = entries(&target, None, "set1", crate::manifest::CURRENT).unwrap();
        assert_eq!(detail.len(), 2); // D sub + F sub/a.txt
        assert!(detail.iter().any(|e| e.path == "sub/a.txt"));
    }
}
