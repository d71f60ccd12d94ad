//! Logging setup and log-hygiene helpers.

use tracing_subscriber::EnvFilter;

/// Environment variable controlling the log level.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Install a process-wide fmt subscriber whose level comes from the
/// `LOG_LEVEL` environment variable (default `info`).
///
/// `fatal` maps to `error`, matching the coarsest level tracing offers.
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    let level = match level.to_ascii_lowercase().as_str() {
        "fatal" => "error".to_string(),
        other => other.to_string(),
    };
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Redact a recipient identifier for logging: keep only the last 10 chars.
pub fn redact(recipient: &str) -> String {
    let chars: Vec<char> = recipient.chars().collect();
    if chars.len() <= 10 {
        recipient.to_string()
    } else {
        format!("…{}", chars[chars.len() - 10..].iter().collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_recipients_pass_through() {
        assert_eq!(redact("a@x"), "a@x");
        assert_eq!(redact("1234567890"), "1234567890");
    }

    #[test]
    fn long_recipients_keep_only_the_tail() {
        assert_eq!(redact("someone@example.com"), "…xample.com");
        assert!(!redact("very-secret-push-token-abcdef").contains("very-secret"));
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
