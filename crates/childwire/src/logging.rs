//! Tracing setup for binaries built on childwire.
//!
//! Logs always go to stderr: on the child side stdout carries the protocol.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `CHILDWIRE_LOG` picks the level for
/// the childwire crates (`debug`, `warn`/`warning`, `error`, default `info`).
/// `LOG_FORMAT=json` switches to JSON lines. Calling this twice is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(
            std::env::var("CHILDWIRE_LOG").ok().as_deref(),
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "childwire={level},childwire_peer={level},echo_peer={level}",
        level = level
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_info() {
        assert_eq!(
            default_directives(None),
            "childwire=info,childwire_peer=info,echo_peer=info"
        );
        assert_eq!(
            default_directives(Some("verbose")),
            "childwire=info,childwire_peer=info,echo_peer=info"
        );
    }

    #[test]
    fn warning_is_an_alias_for_warn() {
        assert_eq!(default_directives(Some("warning")), default_directives(Some("warn")));
        assert!(default_directives(Some("warn")).starts_with("childwire=warn,"));
    }

    #[test]
    fn directives_parse() {
        for level in [None, Some("debug"), Some("trace"), Some("error")] {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok());
        }
    }
}
