//! AdBlock-Plus-style domain rule matcher.
//!
//! A `RuleSet` is the compiled form of one rule source: an exact-match table
//! from normalized domain to block/allow plus two ordered wildcard pattern
//! lists. Lookup walks domain suffixes from most to least specific, so a rule
//! for a subdomain overrides a rule for its parent.

use base64::Engine;
use regex::Regex;
use rustc_hash::FxHashMap;
use shunt_dns_domain::RuleError;
use std::sync::LazyLock;
use tracing::debug;

/// Valid top-level label: two or more alphabetic characters.
static TLD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]{2,}$").expect("static pattern"));

/// Valid IDN top-level label: `xn--` followed by three or more alphanumerics.
static IDN_TLD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^xn--[a-zA-Z0-9]{3,}$").expect("static pattern"));

// The one regex-rule form honored for compatibility with a well-known rule
// list: `/^https?:\/\/<expr>\/.*/`. Every other `/`-leading line is an
// unsupported regex dialect and is ignored.
const BLOCK_REGEX_PREFIX: &str = r"/^https?:\/\/";
const BLOCK_REGEX_SUFFIX: &str = r"\/.*/";

/// Verdict of a rule lookup. Absence of a verdict means "no rule applies" and
/// the caller decides the default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Block,
    Allow,
}

/// Compiled rule source. Immutable after compilation except through
/// [`RuleSet::extend`], so it can be shared across unlimited concurrent
/// readers without locking.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    exact: FxHashMap<String, bool>,
    blocked_patterns: Vec<Regex>,
    allowed_patterns: Vec<Regex>,
}

impl RuleSet {
    /// Compiles rule text, one rule per line. Malformed lines are skipped,
    /// never surfaced: one bad line must not abort loading the rest of a
    /// third-party list.
    pub fn compile(text: &str) -> RuleSet {
        let mut set = RuleSet::default();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
                continue;
            }
            if line.starts_with('/') {
                set.compile_regex_rule(line);
                continue;
            }
            let line = line.replace("%2F", "/");
            let token = extract_domain(&line);
            let allow = line.starts_with("@@");

            if token.contains('*') {
                let pattern = format!("^{}$", token.replace('.', r"\.").replace('*', ".*"));
                match Regex::new(&pattern) {
                    Ok(regex) => {
                        if allow {
                            set.allowed_patterns.push(regex);
                        } else {
                            set.blocked_patterns.push(regex);
                        }
                    }
                    Err(error) => {
                        debug!(rule = %line, %error, "Skipping unparsable wildcard rule");
                    }
                }
                continue;
            }

            let Some((_, tld)) = token.rsplit_once('.') else {
                continue; // no top-level label
            };
            if !TLD_PATTERN.is_match(tld) && !IDN_TLD_PATTERN.is_match(tld) {
                continue; // invalid domain, dropped at parse time
            }
            set.exact.insert(token.to_ascii_lowercase(), !allow);
        }
        set
    }

    fn compile_regex_rule(&mut self, line: &str) {
        let inner = line
            .strip_prefix(BLOCK_REGEX_PREFIX)
            .and_then(|rest| rest.strip_suffix(BLOCK_REGEX_SUFFIX));
        let Some(inner) = inner else {
            return; // unsupported regex dialect
        };
        match Regex::new(inner) {
            Ok(regex) => self.blocked_patterns.push(regex),
            Err(error) => {
                debug!(rule = %line, %error, "Skipping unparsable regex rule");
            }
        }
    }

    /// Loads a rule source from a file, optionally base64-decoding the whole
    /// payload first. An empty path is a valid no-op source; an unreadable
    /// file is an error.
    pub fn load(path: &str, b64decode: bool) -> Result<RuleSet, RuleError> {
        if path.is_empty() {
            return Ok(RuleSet::default());
        }
        let raw = std::fs::read(path).map_err(|e| RuleError::Io {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let raw = if b64decode {
            base64::engine::general_purpose::STANDARD
                .decode(&raw)
                .map_err(|e| RuleError::Base64 {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?
        } else {
            raw
        };
        Ok(Self::compile(&String::from_utf8_lossy(&raw)))
    }

    /// Looks up the verdict for a domain. `None` means no rule applies.
    ///
    /// Exact rules win over patterns, and among exact rules the longest
    /// matching suffix wins: the walk starts at the full domain and drops one
    /// label at a time, returning on the first hit. Blocked patterns are
    /// tested before allowed patterns, each list in parse order.
    pub fn decide(&self, domain: &str) -> Option<RuleAction> {
        if domain.is_empty() {
            return None;
        }
        let domain = domain.to_ascii_lowercase();
        let domain = domain.strip_suffix('.').unwrap_or(&domain);

        let mut suffix = domain;
        while suffix.contains('.') {
            if let Some(&blocked) = self.exact.get(suffix) {
                return Some(if blocked {
                    RuleAction::Block
                } else {
                    RuleAction::Allow
                });
            }
            suffix = if let Some(rest) = suffix.strip_prefix('.') {
                rest
            } else if let Some(i) = suffix.find('.') {
                &suffix[i..]
            } else {
                break;
            };
        }

        for regex in &self.blocked_patterns {
            if regex.is_match(domain) {
                return Some(RuleAction::Block);
            }
        }
        for regex in &self.allowed_patterns {
            if regex.is_match(domain) {
                return Some(RuleAction::Allow);
            }
        }
        None
    }

    /// Merges `other` into this set: exact entries are copied over with
    /// `other`'s value winning on key collisions, and `other`'s pattern lists
    /// are appended after this set's own, so this set's patterns keep
    /// priority. Must not run concurrently with reads (enforced by `&mut`).
    pub fn extend(&mut self, other: RuleSet) {
        self.exact.extend(other.exact);
        self.blocked_patterns.extend(other.blocked_patterns);
        self.allowed_patterns.extend(other.allowed_patterns);
    }

    /// Number of compiled rules (exact entries plus patterns).
    pub fn len(&self) -> usize {
        self.exact.len() + self.blocked_patterns.len() + self.allowed_patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extracts the domain/pattern token from an ABP rule body: strips the domain
/// anchor `||`, the address anchor `|`, the scheme separator, the URL path and
/// the end-of-rule marker `^`, in that order.
fn extract_domain(rule: &str) -> &str {
    let mut rule = rule;
    if let Some(i) = rule.find("||") {
        rule = &rule[i + 2..];
    }
    if let Some(i) = rule.find('|') {
        rule = &rule[i + 1..];
    }
    if let Some(i) = rule.find("://") {
        rule = &rule[i + 3..];
    }
    if let Some(i) = rule.find('/') {
        rule = &rule[..i];
    }
    if let Some(i) = rule.find('^') {
        rule = &rule[..i];
    }
    rule
}
