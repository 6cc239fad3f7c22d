//! Per-subscriber filtering of dispatch keys.

use std::{
    collections::HashSet,
    ops::Range,
    path::{Component, Path, PathBuf},
};

use globset::{Glob, GlobMatcher};
use regex::Regex;
use thiserror::Error;

use crate::dispatch_key::{DirectoryKey, DispatchKey};

#[derive(Debug, Error)]
pub enum RestrictionError {
    #[error("invalid glob pattern")]
    Glob(#[from] globset::Error),

    #[error("invalid regular expression")]
    Regex(#[from] regex::Error),

    #[error("segment range {start}..{end} is empty")]
    EmptyRange { start: usize, end: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Glob,
    Regex,
}

#[derive(Debug, Clone)]
enum Matcher {
    Glob(GlobMatcher),
    Regex(Regex),
}

#[derive(Debug, Clone)]
struct PathRule {
    segments: Option<Range<usize>>,
    matcher: Matcher,
}

impl PathRule {
    fn matches(&self, relative_path: &Path) -> bool {
        let candidate = match &self.segments {
            None => relative_path.to_path_buf(),
            Some(range) => match sub_path(relative_path, range) {
                Some(path) => path,
                None => return false,
            },
        };

        match &self.matcher {
            Matcher::Glob(glob) => glob.is_match(&candidate),
            Matcher::Regex(regex) => regex.is_match(&slash_separated(&candidate)),
        }
    }
}

fn sub_path(path: &Path, range: &Range<usize>) -> Option<PathBuf> {
    let segments: Vec<Component> = path.components().collect();
    if range.start >= segments.len() {
        return None;
    }
    let end = range.end.min(segments.len());
    Some(segments[range.start..end].iter().collect())
}

fn slash_separated(path: &Path) -> String {
    let segments: Vec<_> = path
        .components()
        .map(|segment| segment.as_os_str().to_string_lossy())
        .collect();
    segments.join("/")
}

/// Declares which keys a subscriber wants to hear about.
///
/// Directory keys can be accepted or ignored explicitly; an ignored key is
/// never delivered even when it is also accepted. Path rules are combined
/// with "any of", each optionally applied to a `[start, end)` range of the
/// relative path's segments. An empty restriction delivers everything.
#[derive(Debug, Clone, Default)]
pub struct DeliveryRestriction {
    accepted: HashSet<DirectoryKey>,
    ignored: HashSet<DirectoryKey>,
    rules: Vec<PathRule>,
}

impl DeliveryRestriction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept<I, K>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: Into<DirectoryKey>,
    {
        self.accepted.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn ignore<I, K>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: Into<DirectoryKey>,
    {
        self.ignored.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn add_glob(&mut self, patterns: &[&str]) -> Result<&mut Self, RestrictionError> {
        self.add(None, Syntax::Glob, patterns)
    }

    pub fn add_regex(&mut self, patterns: &[&str]) -> Result<&mut Self, RestrictionError> {
        self.add(None, Syntax::Regex, patterns)
    }

    /// Adds rules that only look at the segments in `segments` of the
    /// relative path. Keys with fewer segments than `segments.start` never
    /// match.
    pub fn add_in(
        &mut self,
        segments: Range<usize>,
        syntax: Syntax,
        patterns: &[&str],
    ) -> Result<&mut Self, RestrictionError> {
        if segments.is_empty() {
            return Err(RestrictionError::EmptyRange {
                start: segments.start,
                end: segments.end,
            });
        }
        self.add(Some(segments), syntax, patterns)
    }

    fn add(
        &mut self,
        segments: Option<Range<usize>>,
        syntax: Syntax,
        patterns: &[&str],
    ) -> Result<&mut Self, RestrictionError> {
        let mut rules = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let matcher = match syntax {
                Syntax::Glob => Matcher::Glob(Glob::new(pattern)?.compile_matcher()),
                Syntax::Regex => Matcher::Regex(Regex::new(pattern)?),
            };
            rules.push(PathRule {
                segments: segments.clone(),
                matcher,
            });
        }

        self.rules.extend(rules);
        Ok(self)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.accepted.is_empty() && self.ignored.is_empty() && self.rules.is_empty()
    }

    pub fn is_accepted(&self, key: &DispatchKey) -> bool {
        let directory_key = key.directory_key();

        if self.ignored.contains(directory_key) {
            return false;
        }

        if !self.accepted.is_empty() && !self.accepted.contains(directory_key) {
            return false;
        }

        self.rules.is_empty()
            || self
                .rules
                .iter()
                .any(|rule| rule.matches(key.relative_path()))
    }
}
