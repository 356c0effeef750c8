pub mod crypto;
pub mod env;
pub mod net;
pub mod proto;
pub mod sign;
pub mod types;

/// Build metadata baked in at compile time. Missing values print as `N/A`.
pub mod build_info {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    pub fn date() -> &'static str {
        or_na(option_env!("TALLY_BUILD_DATE"))
    }

    pub fn commit() -> &'static str {
        or_na(option_env!("TALLY_BUILD_COMMIT"))
    }

    fn or_na(value: Option<&'static str>) -> &'static str {
        match value {
            Some(v) if !v.trim().is_empty() => v,
            _ => "N/A",
        }
    }
}
