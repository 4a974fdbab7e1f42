use env_logger::fmt::style::AnsiColor;
use env_logger::{DEFAULT_FILTER_ENV, Target};
use log::LevelFilter;
use std::io::Write;

/// Filter in the `env_logger` syntax, takes precedence over `RUST_LOG`.
pub const LOG_FILTER_ENV: &str = "BATCHCTL_LOG";

/// Initializes logging into stderr, stdout is reserved for command results.
///
/// Only messages of batchctl itself are shown by default; `--debug` lowers their level.
/// A filter from [`LOG_FILTER_ENV`] or `RUST_LOG` is applied on top.
pub fn setup_logging(debug: bool) {
    let mut builder = env_logger::Builder::new();
    builder
        .target(Target::Stderr)
        .filter_level(LevelFilter::Warn)
        .filter_module(
            env!("CARGO_CRATE_NAME"),
            if debug {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            },
        );

    let filter = std::env::var(LOG_FILTER_ENV)
        .or_else(|_| std::env::var(DEFAULT_FILTER_ENV))
        .ok();

    if debug || wants_details(filter.as_deref()) {
        builder.format_timestamp_millis().format_module_path(true);
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let time_style = AnsiColor::BrightBlack.on_default();
            writeln!(
                buf,
                "{time_style}{}{time_style:#} {level_style}{}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    if let Some(filter) = &filter {
        builder.parse_filters(filter);
    }
    builder.init();
}

/// Debug output gets millisecond timestamps and module paths.
fn wants_details(filter: Option<&str>) -> bool {
    filter.is_some_and(|filter| filter.contains("debug") || filter.contains("trace"))
}

#[cfg(test)]
mod tests {
    use super::wants_details;

    #[test]
    fn detailed_format_for_debug_filters() {
        assert!(wants_details(Some("batchctl=debug")));
        assert!(wants_details(Some("trace")));
        assert!(!wants_details(Some("warn,batchctl=info")));
        assert!(!wants_details(None));
    }
}
