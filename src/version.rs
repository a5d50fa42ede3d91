//! Build metadata

/// Build date, injected at compile time through `TCP_PROXY_BUILD_DATE`
pub const BUILD_DATE: &str = match option_env!("TCP_PROXY_BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

/// Version string including the build date, e.g. `0.3.0 - (2024-05-01)`
pub fn version_with_date() -> String {
    format!("{} - ({})", crate::VERSION, BUILD_DATE)
}

/// User-Agent sent on HTTP CONNECT requests unless overridden
pub fn default_user_agent() -> String {
    format!("tcp-proxy/{}", version_with_date())
}
