//! Verbosity-count-to-log-level plumbing shared by both binaries: repeated
//! `-v` flags step through warn → info → debug → trace, `RUST_LOG`
//! overrides when set.

use log::LevelFilter;

/// Maps a `-v` occurrence count to a level.
pub fn level_filter_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initializes `env_logger` with the given default level, honoring
/// `RUST_LOG` if present.
pub fn init(default_level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}
