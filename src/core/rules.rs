//! core::rules
//!
//! Checkout rules: a path-inclusion/exclusion predicate applied during
//! walks.
//!
//! # Semantics
//!
//! Rules are an ordered list of `+:prefix` (include) and `-:prefix`
//! (exclude) entries; a bare line means include. Matching is by path
//! component prefix: `+:src` matches `src` and `src/main.rs` but not
//! `src2/lib.rs`. For a given path the longest matching prefix decides.
//! With no include rules everything not excluded is visible; once an
//! include rule narrows scope, only included subtrees are visible.
//!
//! The change collector uses rules to filter file changes; the rules
//! walker uses them to decide whether a commit "matches". Rules never
//! cause history to be omitted.
//!
//! # Example
//!
//! ```
//! use mirrorpool::core::rules::CheckoutRules;
//!
//! let rules = CheckoutRules::parse("+:src\n-:src/generated").unwrap();
//! assert!(rules.accepts("src/main.rs"));
//! assert!(!rules.accepts("src/generated/code.rs"));
//! assert!(!rules.accepts("docs/readme.md"));
//! ```

use thiserror::Error;

/// Errors from rule parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RulesError {
    #[error("invalid checkout rule: {0}")]
    InvalidRule(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    prefix: String,
    include: bool,
}

/// An ordered include/exclude path predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRules {
    rules: Vec<Rule>,
    has_includes: bool,
}

impl CheckoutRules {
    /// Rules that accept every path.
    pub fn accept_all() -> Self {
        Self {
            rules: Vec::new(),
            has_includes: false,
        }
    }

    /// Parse newline-separated rule lines.
    ///
    /// Empty lines and `#` comments are skipped. `+:.` and `+:` include
    /// everything.
    pub fn parse(text: &str) -> Result<Self, RulesError> {
        let mut rules = Vec::new();
        let mut has_includes = false;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (include, prefix) = if let Some(rest) = line.strip_prefix("+:") {
                (true, rest)
            } else if let Some(rest) = line.strip_prefix("-:") {
                (false, rest)
            } else if line.starts_with('-') || line.starts_with('+') {
                return Err(RulesError::InvalidRule(line.to_string()));
            } else {
                (true, line)
            };
            let prefix = normalize_prefix(prefix);
            if include && !prefix.is_empty() {
                has_includes = true;
            }
            rules.push(Rule {
                prefix,
                include,
            });
        }
        Ok(Self { rules, has_includes })
    }

    /// Whether a path is visible under these rules.
    pub fn accepts(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        let mut decision = !self.has_includes;
        let mut decided_len: Option<usize> = None;
        for rule in &self.rules {
            if !prefix_matches(&rule.prefix, path) {
                continue;
            }
            let len = rule.prefix.len();
            // Longest matching prefix wins; on a tie the later rule wins.
            if decided_len.map_or(true, |d| len >= d) {
                decision = rule.include;
                decided_len = Some(len);
            }
        }
        decision
    }

    /// Whether any of the paths is visible.
    pub fn accepts_any<'a, I: IntoIterator<Item = &'a str>>(&self, paths: I) -> bool {
        paths.into_iter().any(|p| self.accepts(p))
    }

    /// Whether these rules accept every path unconditionally.
    pub fn is_accept_all(&self) -> bool {
        self.rules.iter().all(|r| r.include) && !self.has_includes
    }
}

impl Default for CheckoutRules {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl std::fmt::Display for CheckoutRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.rules.is_empty() {
            return f.write_str("+:.");
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            let sign = if rule.include { '+' } else { '-' };
            let prefix = if rule.prefix.is_empty() { "." } else { &rule.prefix };
            write!(f, "{}:{}", sign, prefix)?;
        }
        Ok(())
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim().trim_matches('/');
    if prefix == "." {
        String::new()
    } else {
        prefix.to_string()
    }
}

/// Component-wise prefix match: `src` matches `src` and `src/x`, not `srcx`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
