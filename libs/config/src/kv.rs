//! Flat `key:value;key:value` configuration strings.

use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

/// Parse a semicolon separated list of `key:value` pairs.
///
/// Each pair is trimmed before splitting. Pairs without exactly one `:` are
/// skipped with a warning. Keys are case-sensitive; a repeated key keeps the
/// last value.
pub fn parse_key_values(input: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();

    for raw in input.split(';') {
        let pair = raw.trim();
        if pair.is_empty() {
            continue;
        }

        let mut parts = pair.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                pairs.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                warn!(pair = pair, "Ignoring malformed config pair");
            }
        }
    }

    pairs
}

/// Look up `key` and parse it, falling back to `default` with a warning when
/// the key is missing or the value does not parse.
pub fn value_or<T>(pairs: &HashMap<String, String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match pairs.get(key) {
        None => {
            warn!("config does not have [{}], will initialize {} = {}", key, key, default);
            default
        }
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    "config value [{}] = '{}' is malformed, will initialize {} = {}",
                    key, raw, key, default
                );
                default
            }
        },
    }
}

/// Like [`value_or`] but silent when the key is absent.
pub fn optional_value_or<T>(pairs: &HashMap<String, String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    if pairs.contains_key(key) {
        value_or(pairs, key, default)
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_each_pair() {
        let pairs = parse_key_values("  worker_num : 4 ;machine_id:7;  ");
        assert_eq!(pairs.get("worker_num").map(String::as_str), Some("4"));
        assert_eq!(pairs.get("machine_id").map(String::as_str), Some("7"));
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn test_parse_skips_malformed_pairs() {
        let pairs = parse_key_values("worker_num;a:b:c;name:gate");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs["name"], "gate");
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let pairs = parse_key_values("Worker_Num:3");
        assert!(pairs.get("worker_num").is_none());
        assert_eq!(value_or(&pairs, "worker_num", 1usize), 1);
    }

    #[test]
    fn test_value_or_defaults_on_garbage() {
        let pairs = parse_key_values("worker_num:many");
        assert_eq!(value_or(&pairs, "worker_num", 1usize), 1);
    }
}
