use std::str::FromStr;

use anyhow::{Result, bail};
use rusqlite::Connection;

use crate::db;

/// Typed view over the (key, value) settings table. Values the engine does
/// not know are ignored on read; writes of unknown keys or malformed values
/// are rejected.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_timezone: String,
    pub default_send_times: Vec<String>,
    pub primary_model: Option<String>,
    pub secondary_model: Option<String>,
    pub reasoning_level: String,
    pub default_recipients: Vec<String>,
    pub from_address: Option<String>,
    pub per_source_cap: usize,
    pub max_articles_considered: usize,
    pub max_articles_for_ai: usize,
    pub max_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_timezone: "America/New_York".to_string(),
            default_send_times: vec!["07:00".to_string()],
            primary_model: None,
            secondary_model: None,
            reasoning_level: "medium".to_string(),
            default_recipients: Vec::new(),
            from_address: None,
            per_source_cap: 10,
            max_articles_considered: 200,
            max_articles_for_ai: 25,
            max_concurrency: 6,
        }
    }
}

const STRING_ARRAY_KEYS: &[&str] = &["default_send_times", "default_recipients"];
const NUMERIC_KEYS: &[&str] = &[
    "per_source_cap",
    "max_articles_considered",
    "max_articles_for_ai",
    "max_concurrency",
];
const PLAIN_KEYS: &[&str] = &[
    "default_timezone",
    "primary_model",
    "secondary_model",
    "reasoning_level",
    "from_address",
];

fn read_array(conn: &Connection, key: &str, into: &mut Vec<String>) {
    if let Ok(Some(raw)) = db::get_setting(conn, key) {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(&raw) {
            *into = v;
        }
    }
}

fn read_number(conn: &Connection, key: &str, into: &mut usize) {
    if let Ok(Some(raw)) = db::get_setting(conn, key) {
        if let Ok(n) = raw.parse::<usize>() {
            if n > 0 {
                *into = n;
            }
        }
    }
}

impl EngineSettings {
    pub fn load(conn: &Connection) -> Self {
        let mut s = EngineSettings::default();
        if let Ok(Some(v)) = db::get_setting(conn, "default_timezone") {
            s.default_timezone = v;
        }
        read_array(conn, "default_send_times", &mut s.default_send_times);
        if let Ok(Some(v)) = db::get_setting(conn, "primary_model") {
            if !v.is_empty() {
                s.primary_model = Some(v);
            }
        }
        if let Ok(Some(v)) = db::get_setting(conn, "secondary_model") {
            if !v.is_empty() {
                s.secondary_model = Some(v);
            }
        }
        if let Ok(Some(v)) = db::get_setting(conn, "reasoning_level") {
            if matches!(v.as_str(), "low" | "medium" | "high") {
                s.reasoning_level = v;
            }
        }
        read_array(conn, "default_recipients", &mut s.default_recipients);
        if let Ok(Some(v)) = db::get_setting(conn, "from_address") {
            if !v.is_empty() {
                s.from_address = Some(v);
            }
        }
        read_number(conn, "per_source_cap", &mut s.per_source_cap);
        read_number(conn, "max_articles_considered", &mut s.max_articles_considered);
        read_number(conn, "max_articles_for_ai", &mut s.max_articles_for_ai);
        read_number(conn, "max_concurrency", &mut s.max_concurrency);
        s
    }
}

/// Write-side validation: enum and numeric semantics are enforced here, not
/// at read time.
pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    if STRING_ARRAY_KEYS.contains(&key) {
        let parsed: Vec<String> = serde_json::from_str(value)
            .map_err(|e| anyhow::anyhow!("{key} must be a JSON string array: {e}"))?;
        if key == "default_send_times" {
            for t in &parsed {
                parse_hhmm(t)?;
            }
        }
    } else if NUMERIC_KEYS.contains(&key) {
        let n: usize = value.parse().map_err(|_| anyhow::anyhow!("{key} must be a positive integer"))?;
        if n == 0 {
            bail!("{key} must be a positive integer");
        }
    } else if PLAIN_KEYS.contains(&key) {
        if key == "reasoning_level" && !matches!(value, "low" | "medium" | "high") {
            bail!("reasoning_level must be one of low|medium|high");
        }
        if key == "default_timezone" && chrono_tz::Tz::from_str(value).is_err() {
            bail!("default_timezone must be an IANA timezone name");
        }
    } else {
        bail!("unknown setting key: {key}");
    }
    db::put_setting(conn, key, value)
}

/// "HH:MM" in 24h form.
pub fn parse_hhmm(s: &str) -> Result<(u32, u32)> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("schedule time must be HH:MM, got {s:?}"))?;
    let h: u32 = h.parse()?;
    let m: u32 = m.parse()?;
    if h > 23 || m > 59 {
        bail!("schedule time out of range: {s:?}");
    }
    Ok((h, m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory;

    #[test]
    fn defaults_without_rows() {
        let conn = open_memory().unwrap();
        let s = EngineSettings::load(&conn);
        assert_eq!(s.per_source_cap, 10);
        assert_eq!(s.max_articles_for_ai, 25);
        assert_eq!(s.max_concurrency, 6);
        assert!(s.primary_model.is_none());
    }

    #[test]
    fn round_trip_and_validation() {
        let conn = open_memory().unwrap();
        set(&conn, "per_source_cap", "5").unwrap();
        set(&conn, "primary_model", "openai:gpt-5-mini").unwrap();
        set(&conn, "default_recipients", r#"["ops@example.com"]"#).unwrap();
        let s = EngineSettings::load(&conn);
        assert_eq!(s.per_source_cap, 5);
        assert_eq!(s.primary_model.as_deref(), Some("openai:gpt-5-mini"));
        assert_eq!(s.default_recipients, vec!["ops@example.com"]);

        assert!(set(&conn, "per_source_cap", "zero").is_err());
        assert!(set(&conn, "reasoning_level", "max").is_err());
        assert!(set(&conn, "default_timezone", "Mars/Olympus").is_err());
        assert!(set(&conn, "no_such_key", "1").is_err());
        assert!(set(&conn, "default_send_times", r#"["25:00"]"#).is_err());
    }

    #[test]
    fn unknown_values_ignored_on_read() {
        let conn = open_memory().unwrap();
        crate::db::put_setting(&conn, "per_source_cap", "not-a-number").unwrap();
        crate::db::put_setting(&conn, "reasoning_level", "galactic").unwrap();
        let s = EngineSettings::load(&conn);
        assert_eq!(s.per_source_cap, 10);
        assert_eq!(s.reasoning_level, "medium");
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("07:30").unwrap(), (7, 30));
        assert_eq!(parse_hhmm("23:59").unwrap(), (23, 59));
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("7").is_err());
    }
}
