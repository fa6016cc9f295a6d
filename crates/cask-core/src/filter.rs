//! Include/exclude path filters.
//!
//! Each pattern is `<type><glob>` with type `+` (include) or `-` (exclude).
//! `*` matches within one path component, `**` crosses separators, and a
//! leading `**/` also matches the bare remainder at the root. Ordering is
//! significant: the last matching pattern wins.

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{CaskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub action: FilterAction,
    pub pattern: String,
    matchers: Vec<GlobMatcher>,
}

impl Filter {
    pub fn parse(spec: &str) -> Result<Filter> {
        let (action, glob) = match spec.as_bytes().first() {
            Some(b'+') => (FilterAction::Include, &spec[1..]),
            Some(b'-') => (FilterAction::Exclude, &spec[1..]),
            _ => {
                return Err(CaskError::Config(format!(
                    "filter '{spec}' must start with '+' or '-'"
                )))
            }
        };
        let glob = normalize(glob);
        let mut matchers = vec![build_matcher(&glob)?];
        // `**/x` additionally matches bare `x` at the root.
        if let Some(bare) = glob.strip_prefix("**/") {
            matchers.push(build_matcher(bare)?);
        }
        Ok(Filter {
            action,
            pattern: glob,
            matchers,
        })
    }

    pub fn matches(&self, relpath: &str) -> bool {
        let path = normalize(relpath);
        self.matchers.iter().any(|m| m.is_match(path.as_str()))
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

fn build_matcher(glob: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(glob)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| CaskError::Config(format!("invalid filter glob '{glob}': {e}")))
}

/// An ordered list of filters with last-match-wins resolution.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    pub fn parse(specs: &[String]) -> Result<FilterSet> {
        let filters = specs
            .iter()
            .map(|s| Filter::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(FilterSet { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The last filter matching `relpath`, if any.
    pub fn matched(&self, relpath: &str) -> Option<&Filter> {
        self.filters.iter().rev().find(|f| f.matches(relpath))
    }

    /// The matched exclude filter, or `None` when the path is kept.
    pub fn ignores(&self, relpath: &str) -> Option<&Filter> {
        self.matched(relpath)
            .filter(|f| f.action == FilterAction::Exclude)
    }

    /// True when the last match explicitly re-includes the path.
    pub fn includes(&self, relpath: &str) -> bool {
        self.matched(relpath)
            .is_some_and(|f| f.action == FilterAction::Include)
    }
}
