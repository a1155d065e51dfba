//! Configuration management for Download Pulse
//!
//! Values are read from the process environment first and fall back to a
//! `.env` file in the working directory, the same place the web front end
//! keeps its platform credentials. The `VITE_`-prefixed names the front end
//! uses are accepted as fallbacks for the connection keys.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

pub const URL_KEY: &str = "SUPABASE_URL";
pub const URL_FALLBACK_KEY: &str = "VITE_SUPABASE_URL";
pub const ANON_KEY_KEY: &str = "SUPABASE_ANON_KEY";
pub const ANON_KEY_FALLBACK_KEY: &str = "VITE_SUPABASE_ANON_KEY";

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_STATS_TTL_SECS: u64 = 30;
const DEFAULT_HISTORY_TTL_SECS: u64 = 300;
const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_HISTORY_ROW_CAP: usize = 10_000;

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

/// Where to reach the hosted data platform.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Project base URL, without the `/rest/v1` suffix.
    pub url: String,
    pub anon_key: String,
    /// Per-request timeout applied by the HTTP backend.
    pub timeout: Duration,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("url", &self.url)
            .field("anon_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Main configuration struct.
///
/// Benchmark overrides are `None` when unset so the selected profile's
/// defaults apply.
#[derive(Clone)]
pub struct Config {
    // Connection
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub http_timeout: Duration,

    // Benchmark overrides
    pub stage_duration: Option<Duration>,
    pub concurrency_levels: Option<Vec<usize>>,
    pub cooldown: Option<Duration>,
    pub read_weight: Option<f64>,
    /// Share of mixed-profile iterations spent on release lookups.
    pub lookup_weight: Option<f64>,

    // Analytics cache
    pub stats_ttl: Duration,
    pub history_ttl: Duration,
    pub history_row_cap: usize,
    pub debounce_window: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("anon_key", &self.anon_key.as_ref().map(|_| "<redacted>"))
            .field("http_timeout", &self.http_timeout)
            .field("stage_duration", &self.stage_duration)
            .field("concurrency_levels", &self.concurrency_levels)
            .field("cooldown", &self.cooldown)
            .field("read_weight", &self.read_weight)
            .field("lookup_weight", &self.lookup_weight)
            .field("stats_ttl", &self.stats_ttl)
            .field("history_ttl", &self.history_ttl)
            .field("history_row_cap", &self.history_row_cap)
            .field("debounce_window", &self.debounce_window)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            stage_duration: None,
            concurrency_levels: None,
            cooldown: None,
            read_weight: None,
            lookup_weight: None,
            stats_ttl: Duration::from_secs(DEFAULT_STATS_TTL_SECS),
            history_ttl: Duration::from_secs(DEFAULT_HISTORY_TTL_SECS),
            history_row_cap: DEFAULT_HISTORY_ROW_CAP,
            debounce_window: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

impl Config {
    /// Load from the process environment, falling back to `./.env`.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(env_value)
    }

    /// Load from an arbitrary key lookup. Tests pass a map here instead of
    /// touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let config = Self {
            url: get(URL_KEY).or_else(|| get(URL_FALLBACK_KEY)),
            anon_key: get(ANON_KEY_KEY).or_else(|| get(ANON_KEY_FALLBACK_KEY)),
            http_timeout: parse_millis("PULSE_HTTP_TIMEOUT_MS", get("PULSE_HTTP_TIMEOUT_MS"))?
                .unwrap_or(defaults.http_timeout),
            stage_duration: parse_millis(
                "PULSE_STAGE_DURATION_MS",
                get("PULSE_STAGE_DURATION_MS"),
            )?,
            concurrency_levels: get("PULSE_CONCURRENCY_LEVELS")
                .map(|raw| parse_levels("PULSE_CONCURRENCY_LEVELS", &raw))
                .transpose()?,
            cooldown: parse_millis("PULSE_COOLDOWN_MS", get("PULSE_COOLDOWN_MS"))?,
            read_weight: get("PULSE_READ_WEIGHT")
                .map(|raw| parse_weight("PULSE_READ_WEIGHT", &raw))
                .transpose()?,
            lookup_weight: get("PULSE_LOOKUP_WEIGHT")
                .map(|raw| parse_weight("PULSE_LOOKUP_WEIGHT", &raw))
                .transpose()?,
            stats_ttl: parse_secs("PULSE_STATS_TTL_SECS", get("PULSE_STATS_TTL_SECS"))?
                .unwrap_or(defaults.stats_ttl),
            history_ttl: parse_secs("PULSE_HISTORY_TTL_SECS", get("PULSE_HISTORY_TTL_SECS"))?
                .unwrap_or(defaults.history_ttl),
            history_row_cap: get("PULSE_HISTORY_ROW_CAP")
                .map(|raw| parse_number::<usize>("PULSE_HISTORY_ROW_CAP", &raw))
                .transpose()?
                .unwrap_or(defaults.history_row_cap),
            debounce_window: parse_millis("PULSE_DEBOUNCE_MS", get("PULSE_DEBOUNCE_MS"))?
                .unwrap_or(defaults.debounce_window),
        };
        Ok(config)
    }

    /// Connection settings, or `ConfigError::Missing` naming the first absent key.
    pub fn connection(&self) -> ConfigResult<ConnectionSettings> {
        let url = self
            .url
            .clone()
            .ok_or(ConfigError::Missing { key: URL_KEY })?;
        let anon_key = self
            .anon_key
            .clone()
            .ok_or(ConfigError::Missing { key: ANON_KEY_KEY })?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::invalid(URL_KEY, "expected an http(s) URL"));
        }
        Ok(ConnectionSettings {
            url: url.trim_end_matches('/').to_string(),
            anon_key,
            timeout: self.http_timeout,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> ConfigResult<T> {
    raw.parse()
        .map_err(|_| ConfigError::invalid(key, format!("{raw:?} is not a valid number")))
}

fn parse_millis(key: &'static str, raw: Option<String>) -> ConfigResult<Option<Duration>> {
    raw.map(|v| parse_number::<u64>(key, &v).map(Duration::from_millis))
        .transpose()
}

fn parse_secs(key: &'static str, raw: Option<String>) -> ConfigResult<Option<Duration>> {
    raw.map(|v| parse_number::<u64>(key, &v).map(Duration::from_secs))
        .transpose()
}

fn parse_levels(key: &'static str, raw: &str) -> ConfigResult<Vec<usize>> {
    let levels = parse_csv(raw)
        .iter()
        .map(|part| parse_number::<usize>(key, part))
        .collect::<ConfigResult<Vec<_>>>()?;
    if levels.is_empty() {
        return Err(ConfigError::invalid(key, "at least one level is required"));
    }
    if levels.contains(&0) {
        return Err(ConfigError::invalid(key, "levels must be positive"));
    }
    Ok(levels)
}

fn parse_weight(key: &'static str, raw: &str) -> ConfigResult<f64> {
    let weight: f64 = parse_number(key, raw)?;
    if !(0.0..=1.0).contains(&weight) {
        return Err(ConfigError::invalid(key, "must be within [0, 1]"));
    }
    Ok(weight)
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Environment + .env lookup
// ---------------------------------------------------------------------------

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| load_dotenv_file(Path::new(".env")))
}

/// Read a value from the .env file (if present).
#[must_use]
pub fn dotenv_value(key: &str) -> Option<String> {
    dotenv_values().get(key).cloned()
}

/// Read a value from the real environment first, falling back to .env.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().or_else(|| dotenv_value(key))
}

/// Parse a dotenv file; a missing or unreadable file yields an empty map.
#[must_use]
pub fn load_dotenv_file(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = fs::read_to_string(path) else {
        tracing::debug!(path = %path.display(), "no dotenv file");
        return HashMap::new();
    };
    parse_dotenv_contents(&contents)
}

/// Parse `KEY=value` lines. Blank lines, `#` comments, lines without `=` and
/// empty keys are skipped; a leading `export ` is ignored. Later keys win.
#[must_use]
pub fn parse_dotenv_contents(contents: &str) -> HashMap<String, String> {
    contents.lines().filter_map(dotenv_entry).collect()
}

fn dotenv_entry(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let assignment = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, value) = assignment.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then(|| (key.to_owned(), parse_dotenv_value(value)))
}

fn parse_dotenv_value(raw: &str) -> String {
    let value = raw.trim();
    unquote(value)
        .unwrap_or_else(|| strip_inline_comment(value))
        .to_owned()
}

/// Body of a `"..."` or `'...'` value followed by nothing but an optional comment.
fn unquote(value: &str) -> Option<&str> {
    let quote = value.chars().next().filter(|c| matches!(c, '"' | '\''))?;
    let (body, rest) = value[1..].split_once(quote)?;
    let rest = rest.trim_start();
    (rest.is_empty() || rest.starts_with('#')).then_some(body)
}

/// A `#` starts a comment at the beginning of the value or after whitespace.
fn strip_inline_comment(value: &str) -> &str {
    value
        .match_indices('#')
        .map(|(i, _)| i)
        .find(|&i| i == 0 || value[..i].ends_with(char::is_whitespace))
        .map_or(value, |i| value[..i].trim_end())
}
