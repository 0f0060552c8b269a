//! The config-file loader (external collaborator per spec.md §1/§6): search
//! path, line grammar, and the generic/named option layering of §4.9 step 5.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::DaemonError;
use crate::expand;
use crate::safety;

/// The five options spec.md §4.9 step 2 allows only on the command line,
/// never in a config file.
const FIRST_PASS_ONLY_KEYS: [&str; 5] = ["chroot", "user", "config", "noconfig", "name"];

fn reject_first_pass_only(map: &OptionMap, path: &Path) -> Result<(), DaemonError> {
    for key in FIRST_PASS_ONLY_KEYS {
        if map.contains_key(key) {
            return Err(DaemonError::Usage(format!(
                "{}: `{key}` is only valid on the command line, not in a config file",
                path.display()
            )));
        }
    }
    Ok(())
}

/// One `NAME_OR_STAR opt1,opt2=val,...` line's parsed options, keyed by
/// long-option name (without the leading `--`).
pub type OptionMap = HashMap<String, Option<String>>;

#[derive(Debug, Default)]
pub struct ParsedConfig {
    /// `*` entries, applied before name-keyed ones.
    pub generic: OptionMap,
    /// Entries keyed by client name.
    pub named: HashMap<String, OptionMap>,
}

impl ParsedConfig {
    fn merge(&mut self, other: ParsedConfig) {
        self.generic.extend(other.generic);
        for (name, opts) in other.named {
            self.named.entry(name).or_default().extend(opts);
        }
    }

    /// Returns the layered option map for `name`: generic entries first,
    /// then entries keyed by `name` overriding them.
    pub fn resolved_for(&self, name: Option<&str>) -> OptionMap {
        let mut out = self.generic.clone();
        if let Some(name) = name {
            if let Some(named) = self.named.get(name) {
                out.extend(named.clone());
            }
        }
        out
    }
}

/// Default search path: system files then user files, generic then
/// per-program, matching spec.md §6 (platform prefix fixed to Linux/`/etc`).
pub fn default_search_path(home_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut v = vec![PathBuf::from("/etc/daemon.conf")];
    if let Ok(entries) = fs::read_dir("/etc/daemon.conf.d") {
        let mut files: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        files.sort();
        v.extend(files);
    }
    if let Some(home) = home_dir {
        v.push(home.join(".daemonrc"));
        if let Ok(entries) = fs::read_dir(home.join(".daemonrc.d")) {
            let mut files: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            files.sort();
            v.extend(files);
        }
    }
    v
}

/// Loads and merges every file in `paths`, in order, applying safety
/// enforcement and hidden-file skipping per spec.md §6. Fails with
/// `DaemonError::Usage` if any file sets one of the command-line-only
/// options (spec.md §4.9 step 2, §7's "option in wrong context").
pub fn load_all(paths: &[PathBuf], enforce_safety: bool, euid: u32, allow_vars: bool) -> Result<ParsedConfig, DaemonError> {
    let mut merged = ParsedConfig::default();
    for path in paths {
        if is_hidden(path) {
            continue;
        }
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config file");
                continue;
            }
        };
        if enforce_safety {
            match safety::path_is_safe(path) {
                Ok(safety::Verdict::Unsafe(reason)) => {
                    warn!(path = %path.display(), reason, "skipping unsafe config file");
                    continue;
                }
                Ok(safety::Verdict::Safe) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to classify config file, skipping");
                    continue;
                }
            }
        }
        let parsed = parse(&text, allow_vars, euid);
        reject_first_pass_only(&parsed.generic, path)?;
        for opts in parsed.named.values() {
            reject_first_pass_only(opts, path)?;
        }
        merged.merge(parsed);
    }
    Ok(merged)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Joins backslash-newline-continued lines, honoring backslash-escapes of
/// the newline itself (spec.md §6: "a backslash before a newline continues
/// the line").
fn join_continuations(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut cur = String::new();
    for raw in text.lines() {
        if let Some(stripped) = raw.strip_suffix('\\') {
            cur.push_str(stripped);
        } else {
            cur.push_str(raw);
            lines.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() {
        lines.push(cur);
    }
    lines
}

/// Strips an unescaped `#`-to-end-of-line comment.
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                out.push(next);
                chars.next();
                continue;
            }
        }
        if c == '#' {
            break;
        }
        out.push(c);
    }
    out
}

/// Splits `opt1,opt2=val,opt3` on unescaped commas into `(name, value)`
/// pairs, trimming surrounding whitespace per spec.md §6.
fn split_options(rest: &str) -> OptionMap {
    let mut map = OptionMap::new();
    let mut field = String::new();
    let mut fields = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                field.push(next);
                chars.next();
                continue;
            }
        }
        if c == ',' {
            fields.push(std::mem::take(&mut field));
        } else {
            field.push(c);
        }
    }
    fields.push(field);

    for f in fields {
        let f = f.trim();
        if f.is_empty() {
            continue;
        }
        match f.split_once('=') {
            Some((k, v)) => {
                map.insert(k.trim().to_string(), Some(v.trim().to_string()));
            }
            None => {
                map.insert(f.to_string(), None);
            }
        }
    }
    map
}

/// Parses one config file's text into generic/named option layers plus
/// applying `VAR=VALUE` lines to the process environment immediately (the
/// original's `putenv` semantics: later lines see earlier ones' variables).
pub fn parse(text: &str, allow_vars: bool, _euid: u32) -> ParsedConfig {
    let mut out = ParsedConfig::default();

    for raw in join_continuations(text) {
        let line = strip_comment(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some((var, val)) = is_var_assignment(line) {
            let expanded = expand::expand(&val, allow_vars);
            std::env::set_var(var, expanded);
            continue;
        }

        let mut parts = line.splitn(2, |c: char| c.is_whitespace());
        let key = parts.next().unwrap_or("").to_string();
        let rest = parts.next().unwrap_or("").trim_start();
        let mut opts = split_options(rest);
        for v in opts.values_mut() {
            if let Some(s) = v {
                *s = expand::expand(s, allow_vars);
            }
        }

        if key == "*" {
            out.generic.extend(opts);
        } else {
            out.named.entry(key).or_default().extend(opts);
        }
    }

    out
}

fn is_var_assignment(line: &str) -> Option<(&str, String)> {
    let (name, value) = line.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    // Distinguish from `NAME opt=val` lines: a bare `VAR=VALUE` line has no
    // whitespace before the `=`.
    if name.contains(char::is_whitespace) {
        return None;
    }
    Some((name, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generic_and_named_sections() {
        let text = "* respawn,acceptable=10\nt1 attempts=3,delay=10\n";
        let cfg = parse(text, true, 1000);
        assert!(cfg.generic.contains_key("respawn"));
        assert_eq!(cfg.generic.get("acceptable"), Some(&Some("10".to_string())));
        assert_eq!(cfg.named["t1"].get("attempts"), Some(&Some("3".to_string())));
    }

    #[test]
    fn named_overrides_generic_on_resolve() {
        let text = "* acceptable=10\nt1 acceptable=99\n";
        let cfg = parse(text, true, 1000);
        let resolved = cfg.resolved_for(Some("t1"));
        assert_eq!(resolved.get("acceptable"), Some(&Some("99".to_string())));
    }

    #[test]
    fn comment_and_continuation_handled() {
        let text = "# comment line\n* respawn \\\n,acceptable=10 # trailing\n";
        let cfg = parse(text, true, 1000);
        assert!(cfg.generic.contains_key("respawn"));
        assert!(cfg.generic.contains_key("acceptable"));
    }

    #[test]
    fn var_assignment_sets_env() {
        std::env::remove_var("DAEMON_CFG_TEST_VAR");
        let text = "DAEMON_CFG_TEST_VAR=hello\n";
        parse(text, true, 1000);
        assert_eq!(std::env::var("DAEMON_CFG_TEST_VAR").unwrap(), "hello");
    }
}
