//! Shared CLI plumbing: logging initialization and process exit codes, used
//! by both `expgram-index` and `expgram-query` so the two binaries behave
//! consistently under `--verbose`/`--debug`.

use crate::error::Error;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Initializes `env_logger` at a level derived from `--verbose`/`--debug`
/// flag counts: 0 verbose = warnings only, 1 = info, 2+ = debug; any
/// nonzero `--debug` forces trace regardless of `--verbose`.
pub fn init_logging(verbose: u8, debug: u8) {
    let level = if debug > 0 {
        log::LevelFilter::Trace
    } else {
        match verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    };
    env_logger::Builder::new().filter_level(level).format_timestamp_secs().init();
}

/// Logs `err` and returns the process exit code a binary's `main` should
/// use.
pub fn report_error(err: &Error) -> i32 {
    log::error!("{err}");
    EXIT_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_error_returns_failure_code() {
        let err = Error::InvalidArgument("bad flag".to_string());
        assert_eq!(report_error(&err), EXIT_FAILURE);
    }
}
