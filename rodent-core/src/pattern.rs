//! Snapshot-name pattern grammar: placeholder + strftime expansion, and
//! the derived matching regex used for both retention pruning and
//! "newest/oldest matching snapshot" discovery.

use chrono::{DateTime, Utc};
use regex::{escape, Regex};
use rodent_common::{Error, PolicyId, Result};

/// Expands `pattern` at `now` for the given policy and schedule index,
/// then appends the disambiguating `-{schedule_index}-{policy_id_suffix}`
/// suffix.
pub fn expand_name(
    pattern: &str,
    now: DateTime<Utc>,
    policy_id: &PolicyId,
    policy_name: &str,
    schedule_index: usize,
) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        closed = true;
                        break;
                    }
                    key.push(c2);
                }
                if closed {
                    out.push_str(&expand_placeholder(&key, now, policy_id, policy_name));
                } else {
                    out.push('{');
                    out.push_str(&key);
                }
            }
            '%' => match chars.peek().copied() {
                Some(spec @ ('Y' | 'm' | 'd' | 'H' | 'M' | 'S')) => {
                    chars.next();
                    out.push_str(&expand_strftime(spec, now));
                }
                _ => out.push('%'),
            },
            other => out.push(other),
        }
    }
    out.push('-');
    out.push_str(&schedule_index.to_string());
    out.push('-');
    out.push_str(policy_id.suffix());
    out
}

fn expand_placeholder(key: &str, now: DateTime<Utc>, policy_id: &PolicyId, policy_name: &str) -> String {
    match key {
        "timestamp" => now.format("%Y-%m-%d-%H%M%S").to_string(),
        "date" => now.format("%Y-%m-%d").to_string(),
        "time" => now.format("%H%M%S").to_string(),
        "policy_id" => policy_id.as_str().to_string(),
        "policy_name" => policy_name.to_string(),
        "sequence" => now.timestamp().to_string(),
        other => format!("{{{other}}}"),
    }
}

fn expand_strftime(spec: char, now: DateTime<Utc>) -> String {
    match spec {
        'Y' => now.format("%Y").to_string(),
        'm' => now.format("%m").to_string(),
        'd' => now.format("%d").to_string(),
        'H' => now.format("%H").to_string(),
        'M' => now.format("%M").to_string(),
        'S' => now.format("%S").to_string(),
        _ => unreachable!("caller only dispatches recognized specs"),
    }
}

/// Compiles the matching regex for `pattern`, per the digit-width-class
/// substitution rules. The result anchors with `^...$` and accepts the
/// appended `-<schedule_index>-<policy_id_suffix>` suffix.
pub fn compile_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        closed = true;
                        break;
                    }
                    key.push(c2);
                }
                if closed {
                    out.push_str(placeholder_class(&key));
                } else {
                    out.push_str(&escape("{"));
                    out.push_str(&escape(&key));
                }
            }
            '%' => match chars.peek().copied() {
                Some(spec @ ('Y' | 'm' | 'd' | 'H' | 'M' | 'S')) => {
                    chars.next();
                    out.push_str(strftime_class(spec));
                }
                _ => out.push_str(&escape("%")),
            },
            other => out.push_str(&escape(&other.to_string())),
        }
    }
    out.push_str(r"-\d+-[a-f0-9]+$");
    Regex::new(&out).map_err(|err| Error::request_validation(format!("invalid snap_name_pattern: {err}")))
}

fn placeholder_class(key: &str) -> &'static str {
    match key {
        "timestamp" => r"\d{4}-\d{2}-\d{2}-\d{6}",
        "date" => r"\d{4}-\d{2}-\d{2}",
        "time" => r"\d{6}",
        "policy_id" => r"[a-f0-9\-]+",
        "policy_name" => r"[a-zA-Z0-9\-_]+",
        "sequence" => r"\d+",
        _ => r"[a-zA-Z0-9\-_]+",
    }
}

fn strftime_class(spec: char) -> &'static str {
    match spec {
        'Y' => r"\d{4}",
        'm' | 'd' | 'H' | 'M' | 'S' => r"\d{2}",
        _ => unreachable!("caller only dispatches recognized specs"),
    }
}
