//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse: the raw TOML is first read into a `toml::Value`, its key
//! tree is walked and compared against the known field names, and every
//! stranger produces a warning with a "did you mean?" hint. Then the normal
//! serde deserialization runs. Warnings never break a config.

use std::collections::HashSet;

/// A non-fatal config warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path of `AcquisitionConfig`.
///
/// Array-of-table entries contribute their keys without an index, so
/// `[[links.channels]] scale = 0.1` is `links.channels.scale`. Keep in sync
/// with `daq_config.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [acquisition]
        "acquisition",
        "acquisition.default_interval_ms",
        "acquisition.degraded_after",
        // [storage]
        "storage",
        "storage.path",
        "storage.interval_secs",
        "storage.queue_ceiling",
        // [live]
        "live",
        "live.window_capacity",
        // [[links]]
        "links",
        "links.name",
        "links.failure_threshold",
        "links.reconnect_cooldown_ms",
        "links.read_timeout_ms",
        // [links.transport]
        "links.transport",
        "links.transport.kind",
        "links.transport.host",
        "links.transport.port",
        "links.transport.device",
        "links.transport.baud_rate",
        "links.transport.data_bits",
        "links.transport.stop_bits",
        "links.transport.parity",
        // [[links.channels]]
        "links.channels",
        "links.channels.name",
        "links.channels.slave_id",
        "links.channels.address",
        "links.channels.count",
        "links.channels.function_code",
        "links.channels.unit",
        "links.channels.scale",
        "links.channels.offset",
        "links.channels.interval_ms",
        "links.channels.color",
        "links.channels.register_mode",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects dotted key paths.
///
/// Arrays of tables are flattened: each element's keys are reported under
/// the array's own path. Duplicates are removed, first occurrence wins.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    collect_keys(value, prefix, &mut keys);
    let mut seen = HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
    keys
}

fn collect_keys(value: &toml::Value, prefix: &str, out: &mut Vec<String>) {
    let Some(table) = value.as_table() else {
        return;
    };
    for (k, v) in table {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        out.push(path.clone());
        match v {
            toml::Value::Table(_) => collect_keys(v, &path, out),
            toml::Value::Array(items) => {
                for item in items.iter().filter(|i| i.is_table()) {
                    collect_keys(item, &path, out);
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Closest known key within edit distance 3, ties broken alphabetically.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (levenshtein(unknown, k), *k))
        .filter(|(dist, _)| *dist <= 3)
        .min()
        .map(|(_, k)| k.to_string())
}

// ============================================================================
// Entry Point
// ============================================================================

/// Return warnings for every unknown key in a raw TOML string.
///
/// Syntax errors yield no warnings; serde reports them afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("scale", "scale"), 0);
        assert_eq!(levenshtein("slave_di", "slave_id"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_flattens_arrays_of_tables() {
        let toml: toml::Value = r#"
[[links]]
name = "a"
[[links.channels]]
name = "x"
scale = 2.0
[[links.channels]]
name = "y"
"#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"links".to_string()));
        assert!(keys.contains(&"links.channels.scale".to_string()));
        assert_eq!(keys.iter().filter(|k| *k == "links.channels.name").count(), 1);
    }

    #[test]
    fn test_typo_in_channel_produces_suggestion() {
        let warnings = validate_unknown_keys(
            r#"
[[links]]
name = "plc"
[[links.channels]]
name = "t"
slave_di = 1
"#,
        );
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "links.channels.slave_di");
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("links.channels.slave_id")
        );
    }

    #[test]
    fn test_valid_keys_produce_no_warnings() {
        let warnings = validate_unknown_keys(
            r#"
[acquisition]
default_interval_ms = 100
[storage]
interval_secs = 5
[[links]]
name = "plc"
[links.transport]
kind = "tcp"
host = "localhost"
"#,
        );
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn test_garbage_key_has_no_suggestion() {
        let warnings = validate_unknown_keys("zzzzzzzzzz = 1");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].suggestion.is_none());
    }

    #[test]
    fn test_syntax_error_yields_no_warnings() {
        assert!(validate_unknown_keys("[[links").is_empty());
    }
}
