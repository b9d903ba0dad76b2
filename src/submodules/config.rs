//! submodules::config
//!
//! Parsing of `.gitmodules` and resolution of relative submodule URLs.
//!
//! # Format
//!
//! `.gitmodules` is a git-config-style file:
//!
//! ```text
//! [submodule "libs/foo"]
//!     path = libs/foo
//!     url = ../foo.git
//!     branch = main
//! ```
//!
//! Only the subset the resolver needs is understood: `submodule`
//! sections with `path`, `url` and `branch` keys. Unknown sections and
//! keys are ignored; comments (`#`, `;`) and quoting follow git-config
//! conventions.
//!
//! # Relative URLs
//!
//! URLs beginning with `.` are resolved against the mirror's recorded
//! canonical remote (`teamcity.remote`) by path normalization, so
//! `../sibling.git` against `https://host/team/proj.git` yields
//! `https://host/team/sibling.git`.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors from `.gitmodules` handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GitmodulesError {
    #[error(".gitmodules is not valid UTF-8")]
    NotUtf8,

    #[error("malformed .gitmodules line: {0}")]
    MalformedLine(String),
}

/// One `[submodule]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleEntry {
    /// The section name (often, but not necessarily, the path).
    pub name: String,
    /// Path of the submodule inside the superproject tree.
    pub path: String,
    /// Remote URL, possibly relative (starting with `.`).
    pub url: String,
    /// Tracking branch, when declared.
    pub branch: Option<String>,
}

/// Parsed `.gitmodules` of one commit, indexed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmodulesConfig {
    by_path: BTreeMap<String, SubmoduleEntry>,
}

impl SubmodulesConfig {
    /// Parse the blob content of `.gitmodules`.
    pub fn parse(blob: &[u8]) -> Result<Self, GitmodulesError> {
        let text = std::str::from_utf8(blob).map_err(|_| GitmodulesError::NotUtf8)?;

        let mut by_path = BTreeMap::new();
        let mut section: Option<String> = None;
        let mut path: Option<String> = None;
        let mut url: Option<String> = None;
        let mut branch: Option<String> = None;

        let mut flush = |section: &mut Option<String>,
                         path: &mut Option<String>,
                         url: &mut Option<String>,
                         branch: &mut Option<String>,
                         by_path: &mut BTreeMap<String, SubmoduleEntry>| {
            if let (Some(name), Some(p), Some(u)) = (section.take(), path.take(), url.take()) {
                by_path.insert(
                    p.clone(),
                    SubmoduleEntry {
                        name,
                        path: p,
                        url: u,
                        branch: branch.take(),
                    },
                );
            } else {
                path.take();
                url.take();
                branch.take();
            }
        };

        for raw_line in text.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') {
                flush(&mut section, &mut path, &mut url, &mut branch, &mut by_path);
                section = parse_section_header(line)?;
                continue;
            }
            if section.is_none() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| GitmodulesError::MalformedLine(raw_line.to_string()))?;
            let value = unquote(value.trim());
            match key.trim().to_ascii_lowercase().as_str() {
                "path" => path = Some(value),
                "url" => url = Some(value),
                "branch" => branch = Some(value),
                _ => {}
            }
        }
        flush(&mut section, &mut path, &mut url, &mut branch, &mut by_path);

        Ok(Self { by_path })
    }

    /// The entry registered at `path`, if any.
    pub fn find_submodule(&self, path: &str) -> Option<&SubmoduleEntry> {
        self.by_path.get(path)
    }

    /// Whether `dir` is a proper prefix of some submodule path.
    pub fn is_submodule_prefix(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.by_path.keys().any(|p| p.starts_with(&prefix))
    }

    /// All entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = &SubmoduleEntry> {
        self.by_path.values()
    }

    /// Number of registered submodules.
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Whether no submodules are registered.
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// Returns `Some(name)` for `[submodule "name"]`, `None` for any other
/// section.
fn parse_section_header(line: &str) -> Result<Option<String>, GitmodulesError> {
    let inner = line
        .strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .ok_or_else(|| GitmodulesError::MalformedLine(line.to_string()))?
        .trim();
    let Some(rest) = inner.strip_prefix("submodule") else {
        return Ok(None);
    };
    let name = unquote(rest.trim());
    if name.is_empty() {
        return Ok(None);
    }
    Ok(Some(name))
}

fn strip_comment(line: &str) -> &str {
    // Comment markers inside quotes are rare enough in .gitmodules that
    // the original tooling ignores the case too.
    match line.find(['#', ';']) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        value.to_string()
    }
}

/// Whether a submodule URL is relative to its superproject.
pub fn is_relative_url(url: &str) -> bool {
    url.starts_with('.')
}

/// Resolve a relative submodule URL against the superproject remote.
///
/// The relative part is appended to the base path and normalized, so
/// `..` climbs out of the repository name.
pub fn resolve_relative_url(base: &str, relative: &str) -> String {
    if !is_relative_url(relative) {
        return relative.to_string();
    }

    let (prefix, base_path) = split_authority(base);
    let joined = if base_path.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", base_path, relative)
    };
    format!("{}{}", prefix, normalize_path(&joined))
}

/// Split `scheme://authority` off a URL, returning it and the path part.
fn split_authority(url: &str) -> (&str, &str) {
    match url.find("://") {
        Some(scheme_end) => {
            let after = &url[scheme_end + 3..];
            match after.find('/') {
                Some(path_start) => url.split_at(scheme_end + 3 + path_start),
                None => (url, ""),
            }
        }
        None => ("", url),
    }
}

/// Collapse `.` and `..` segments; keeps a leading slash.
fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}
