//
// Env methods
//

use std::{env, fs, str::FromStr};

pub fn get_env_str_value(key: &str) -> Option<String> {
    let key_file = format!("{key}_FILE");
    let value_from_env = env::var(key);
    let value_file = env::var(&key_file);

    match (value_from_env, value_file) {
        (Ok(_), Ok(_)) => panic!("You should not define both {key} and {key_file}!"),
        (Ok(v_env), Err(_)) => Some(v_env),
        (Err(_), Ok(v_file)) => match fs::read_to_string(v_file) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => panic!("Failed to load {key}: {e:?}"),
        },
        _ => None,
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    try_parse_string(get_env_str_value(key))
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
    const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

    match get_env_str_value(key) {
        Some(val) if TRUE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(true),
        Some(val) if FALSE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(false),
        _ => None,
    }
}

pub fn try_parse_string<S, T>(string: Option<S>) -> Option<T>
where
    S: AsRef<str>,
    T: FromStr,
{
    if let Some(Ok(value)) = string.map(|s| s.as_ref().parse::<T>()) {
        Some(value)
    } else {
        None
    }
}

//
// Date util methods
//

use chrono::{DateTime, NaiveDateTime, Utc};

/// Formats a UTC `NaiveDateTime` as required for HTTP
///
/// https://httpwg.org/specs/rfc7231.html#http.date
pub fn format_datetime_http(dt: &NaiveDateTime) -> String {
    // HTTP expects the date to always be GMT (UTC) rather than giving an
    // offset (which would always be 0 in UTC anyway)
    DateTime::<Utc>::from_naive_utc_and_offset(*dt, Utc).to_rfc2822().replace("+0000", "GMT")
}

/// Parses an HTTP date header (RFC 2822 or the legacy RFC 7231 IMF-fixdate).
/// Returns `None` for anything unparseable, callers treat that as "no header".
pub fn parse_datetime_http(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .or_else(|| DateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT").ok())
        .map(|dt| dt.naive_utc())
}

/// Splits a comma separated string into a Vec, dropping empty items.
pub fn parse_csv_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

//
// Retry methods
//

use std::time::Duration;

/// Retries an async operation a bounded number of times with jittered
/// exponential backoff. Only errors classified as transient by `is_transient`
/// are retried; everything else is returned to the caller immediately.
pub async fn retry_transient<F, Fut, T, E>(mut op: F, attempts: u32, is_transient: impl Fn(&E) -> bool) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut tries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if tries + 1 < attempts && is_transient(&e) => {
                tries += 1;
                let base = 250u64 * 2u64.pow(tries);
                let jitter = u64::from(crate::crypto::get_random_byte()) % base.max(1);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn file_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

pub fn read_file(path: &str) -> std::io::Result<Vec<u8>> {
    fs::read(path)
}

pub fn read_file_string(path: &str) -> std::io::Result<String> {
    fs::read_to_string(path)
}
