//! Template: a lazy Stream factory bound to a subject pattern. The first
//! publish matching the pattern with no existing concrete Stream
//! synthesizes one under a deterministic name (spec.md §4.7).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{err, Result};
use crate::stream::StreamConfig;
use crate::subject;

/// `{name, streamConfigTemplate, maxStreams}` plus the bound subject
/// pattern that triggers derivation. `-1` for `max_streams` means
/// unlimited, matching the account-limit convention elsewhere.
pub struct Template {
    name: String,
    subject_pattern: String,
    config_template: StreamConfig,
    max_streams: i64,
    // subject -> derived stream name, to make repeat publishes on the
    // same concrete subject idempotent and to drive cascading delete.
    derived: Mutex<HashMap<String, String>>,
}

/// Canonical stream name for `subject` under `pattern`: the subject's
/// token at the position of `pattern`'s first wildcard (`*` or `>`). A
/// pattern with no wildcard (a template bound to a single literal
/// subject) derives the name from the whole subject instead.
fn canonical_name(pattern: &str, subject: &str) -> String {
    let wildcard_index = pattern.split('.').position(|t| t == "*" || t == ">");
    match wildcard_index {
        Some(idx) => subject
            .split('.')
            .nth(idx)
            .map(|t| t.to_string())
            .unwrap_or_else(|| subject.replace('.', "-")),
        None => subject.replace('.', "-"),
    }
}

impl Template {
    pub fn new(name: String, subject_pattern: String, config_template: StreamConfig, max_streams: i64) -> Result<Template> {
        subject::validate_pattern(&subject_pattern)?;
        Ok(Template {
            name,
            subject_pattern,
            config_template,
            max_streams,
            derived: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject_pattern(&self) -> &str {
        &self.subject_pattern
    }

    pub fn max_streams(&self) -> i64 {
        self.max_streams
    }

    pub fn matches(&self, subject: &str) -> bool {
        subject::subject_matches_pattern(subject, &self.subject_pattern)
    }

    pub fn derived_stream_names(&self) -> Vec<String> {
        self.derived.lock().values().cloned().collect()
    }

    /// Returns the StreamConfig to create for `subject`, reserving a slot
    /// against `max_streams` if this subject hasn't been seen before.
    /// Idempotent: a subject that already derived a Stream returns the
    /// same config again without consuming another slot.
    pub fn reserve_stream(&self, subject: &str) -> Result<StreamConfig> {
        let mut derived = self.derived.lock();
        let name = canonical_name(&self.subject_pattern, subject);
        if !derived.contains_key(&name) {
            if self.max_streams >= 0 && derived.len() as i64 >= self.max_streams {
                return Err(err!(
                    AccountResourceExhausted,
                    "template '{}' has reached its maximum of {} derived streams",
                    self.name,
                    self.max_streams
                ));
            }
            derived.insert(name.clone(), subject.to_string());
        }
        let mut cfg = self.config_template.clone();
        cfg.name = name;
        cfg.subjects = vec![subject.to_string()];
        cfg.template_owner = Some(self.name.clone());
        Ok(cfg)
    }

    /// Forgets a derived stream name, e.g. after the underlying Stream
    /// was deleted directly (not via template deletion).
    pub fn forget(&self, stream_name: &str) {
        self.derived.lock().retain(|_, v| v != stream_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_name_from_wildcard_token() {
        let tmpl = Template::new(
            "orders-by-region".to_string(),
            "orders.*".to_string(),
            StreamConfig::default(),
            -1,
        )
        .unwrap();
        let cfg = tmpl.reserve_stream("orders.west").unwrap();
        assert_eq!(cfg.name, "west");
        assert_eq!(cfg.subjects, vec!["orders.west".to_string()]);
        assert_eq!(cfg.template_owner.as_deref(), Some("orders-by-region"));
    }

    #[test]
    fn repeat_subject_is_idempotent_against_the_cap() {
        let tmpl = Template::new("t".to_string(), "orders.*".to_string(), StreamConfig::default(), 1).unwrap();
        tmpl.reserve_stream("orders.west").unwrap();
        tmpl.reserve_stream("orders.west").unwrap();
        assert!(tmpl.reserve_stream("orders.east").is_err());
    }

    #[test]
    fn literal_pattern_derives_name_from_whole_subject() {
        let tmpl = Template::new("t".to_string(), "orders.west".to_string(), StreamConfig::default(), -1).unwrap();
        let cfg = tmpl.reserve_stream("orders.west").unwrap();
        assert_eq!(cfg.name, "orders-west");
    }
}
