use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::context::{ConditionContext, IncidentContext};

/// Include/exclude policy applied for a single run.
///
/// Scopes restrict providers up front by injecting path sets into the base
/// condition context, and defend after the fact by dropping incidents that
/// escaped anyway. Rule-level include paths override provider-config
/// includes; exclude paths are additive at every level.
pub trait Scope: Send + Sync {
    fn name(&self) -> &str;

    /// Inject this scope's restrictions into a run's base context before
    /// any rule is dispatched.
    fn add_to_context(&self, ctx: &mut ConditionContext);

    /// Returns `true` when the incident falls outside the scope and must
    /// be dropped.
    fn filter_incident(&self, incident: &IncidentContext) -> bool;
}

/// Ready-made [`Scope`] over include/exclude path lists.
///
/// An include entry accepts a path that equals it, descends from it,
/// matches it as a glob, or matches it as a regex (when the entry compiles
/// as one). Exclude entries match as path prefixes, globs, or regexes.
pub struct PathScope {
    include: Vec<PathMatcher>,
    exclude: Vec<PathMatcher>,
    include_paths: Vec<String>,
    exclude_paths: Vec<String>,
}

impl PathScope {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        let include_paths: Vec<String> =
            include.iter().map(|entry| entry.as_ref().to_string()).collect();
        let exclude_paths: Vec<String> =
            exclude.iter().map(|entry| entry.as_ref().to_string()).collect();
        Self {
            include: include_paths.iter().map(|entry| PathMatcher::new(entry)).collect(),
            exclude: exclude_paths.iter().map(|entry| PathMatcher::new(entry)).collect(),
            include_paths,
            exclude_paths,
        }
    }
}

impl Scope for PathScope {
    fn name(&self) -> &str {
        "include-exclude-paths"
    }

    fn add_to_context(&self, ctx: &mut ConditionContext) {
        ctx.include_paths.extend(self.include_paths.iter().cloned());
        ctx.exclude_paths.extend(self.exclude_paths.iter().cloned());
    }

    fn filter_incident(&self, incident: &IncidentContext) -> bool {
        let path = incident
            .file_uri
            .strip_prefix("file://")
            .unwrap_or(&incident.file_uri);
        if !self.include.is_empty()
            && !self.include.iter().any(|matcher| matcher.includes(path))
        {
            return true;
        }
        self.exclude.iter().any(|matcher| matcher.excludes(path))
    }
}

/// One include/exclude entry, matched as a literal path and, where the
/// entry compiles, as a glob or regex.
struct PathMatcher {
    literal: String,
    glob: Option<GlobMatcher>,
    regex: Option<Regex>,
}

impl PathMatcher {
    fn new(entry: &str) -> Self {
        let glob = entry
            .contains(['*', '?', '['])
            .then(|| Glob::new(entry).ok())
            .flatten()
            .map(|glob| glob.compile_matcher());
        Self {
            literal: entry.trim_end_matches('/').to_string(),
            glob,
            regex: Regex::new(entry).ok(),
        }
    }

    /// Equal, descendant, glob, or regex match.
    fn includes(&self, path: &str) -> bool {
        path == self.literal
            || path.starts_with(&format!("{}/", self.literal))
            || self.glob.as_ref().is_some_and(|glob| glob.is_match(path))
            || self.regex.as_ref().is_some_and(|regex| regex.is_match(path))
    }

    /// Prefix, glob, or regex match.
    fn excludes(&self, path: &str) -> bool {
        path.starts_with(&self.literal)
            || self.glob.as_ref().is_some_and(|glob| glob.is_match(path))
            || self.regex.as_ref().is_some_and(|regex| regex.is_match(path))
    }
}
