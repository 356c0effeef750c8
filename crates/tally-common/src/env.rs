//! Parsers for environment overrides shared by the agent and server configs.

/// Seconds from `"10"` or `"10s"`; minutes and hours accept `m`/`h`.
pub fn parse_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, scale) = match raw.chars().last()? {
        's' => (&raw[..raw.len() - 1], 1),
        'm' => (&raw[..raw.len() - 1], 60),
        'h' => (&raw[..raw.len() - 1], 3600),
        _ => (raw, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(scale)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `None` for unset or blank values.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_accept_suffixes() {
        assert_eq!(parse_secs("10"), Some(10));
        assert_eq!(parse_secs("10s"), Some(10));
        assert_eq!(parse_secs(" 2m "), Some(120));
        assert_eq!(parse_secs("1h"), Some(3600));
        assert_eq!(parse_secs(""), None);
        assert_eq!(parse_secs("ten"), None);
        assert_eq!(parse_secs("-1"), None);
    }

    #[test]
    fn booleans() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn blank_is_none() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some(" k ".into())), Some("k".into()));
        assert_eq!(non_empty(None), None);
    }
}
