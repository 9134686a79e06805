//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use drawbridge_core::config::LoggingConfig;

/// Filter directives when `RUST_LOG` is not set: the base level followed by
/// any per-crate overrides from config.
fn filter_directives(config: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config.and_then(|c| c.level.as_deref()).unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(config.into_iter().flat_map(|c| c.filters.iter().cloned()))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn init(config: Option<&LoggingConfig>, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(filter_directives(config, verbose))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    });
    let json = config.is_some_and(|c| c.format == "json");
    let stdout = config.is_some_and(|c| c.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_info() {
        assert_eq!(filter_directives(None, false), "info");
        assert_eq!(filter_directives(None, true), "debug");
    }

    #[test]
    fn test_config_level_and_filters() {
        let config = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["drawbridge_engine=debug".into(), "tower_http=info".into()],
            ..Default::default()
        };
        assert_eq!(
            filter_directives(Some(&config), false),
            "warn,drawbridge_engine=debug,tower_http=info"
        );
        assert!(filter_directives(Some(&config), true).starts_with("debug,"));
    }
}
