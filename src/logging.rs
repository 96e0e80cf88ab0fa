//! Logger initialization.
//!
//! The crate logs through the `log` facade only. Applications that have no logger of
//! their own can call [`init_logger`] once at startup.

use log::LevelFilter;
use std::io::Write;

/// Install an `env_logger` backend.
///
/// `RUST_LOG` is read first, so other crates can be tuned from the environment;
/// `level` then applies to this crate and wins over `RUST_LOG` for it. Each line
/// carries the thread name, which tells the reader thread and the consumers apart.
///
/// ```bash
/// RUST_LOG=warn,ringload=debug my_loader data.csv
/// ```
///
/// # Errors
/// Returns an error if a logger is already installed in this process.
pub fn init_logger(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_module("ringload", level);
    builder.format(|buf, record| {
        let thread = std::thread::current();
        writeln!(
            buf,
            "{} {:<5} [{}] {}",
            buf.timestamp_millis(),
            record.level(),
            thread.name().unwrap_or("unnamed"),
            record.args()
        )
    });
    builder.try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails() {
        // Another test may have installed a logger first; either way a later call fails.
        let _ = init_logger(LevelFilter::Debug);
        assert!(init_logger(LevelFilter::Info).is_err());
    }
}
