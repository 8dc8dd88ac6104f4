//! Build-time metadata embedded by the build script.
//!
//! The version ends up in the tunnel `auth` payload and the relay upgrade
//! request's `User-Agent`, so the relay can tell bridge builds apart.

/// Short git commit hash at build time, or `unknown` outside a checkout.
pub const GIT_HASH: &str = env!("LLMLINK_GIT_HASH");

/// Build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("LLMLINK_BUILD_TIMESTAMP");

/// Cargo build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("LLMLINK_BUILD_PROFILE");

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client name announced to the relay.
pub const CLIENT_NAME: &str = "llmlink";

/// Formatted version including git hash and profile, e.g. `"0.1.0 (abc1234, debug)"`.
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

/// `User-Agent` sent on the relay WebSocket upgrade.
pub fn user_agent() -> String {
    format!("{CLIENT_NAME}-bridge/{VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_contains_version() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(GIT_HASH));
    }

    #[test]
    fn test_user_agent_format() {
        assert_eq!(user_agent(), format!("llmlink-bridge/{VERSION}"));
    }

    #[test]
    fn test_build_timestamp_is_numeric() {
        assert!(BUILD_TIMESTAMP.parse::<u64>().is_ok());
    }
}
