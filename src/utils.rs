use serde::Serialize;
use url::Url;

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Serialize a serde-backed enum into its wire name (e.g. `fire_alarm`).
pub fn serde_enum_name<T: Serialize>(val: &T) -> Option<String> {
    serde_json::to_value(val).ok()?.as_str().map(|s| s.to_string())
}

/// True for names made only of ASCII letters, digits and underscores, not
/// starting with a digit. Anything else is refused before it reaches SQL text.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace the database segment of a `postgres://` style URL, keeping
/// credentials and any query string intact.
pub fn with_database(url: &str, database: &str) -> Result<String, String> {
    let mut parsed = Url::parse(url).map_err(|e| format!("invalid database URL: {}", e))?;
    if parsed.cannot_be_a_base() || !parsed.has_host() {
        return Err(format!("database URL has no host: {}", parsed.scheme()));
    }
    parsed.set_path(&format!("/{}", database));
    Ok(parsed.into())
}
