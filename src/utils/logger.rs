use std::io::Write;

use colored::Colorize;
use env_logger::{Builder, Env};
use log::Level;

fn level_str(level: Level) -> colored::ColoredString {
    match level {
        Level::Error => "ERROR".red(),
        Level::Warn => "WARN".yellow(),
        Level::Info => "INFO".green(),
        Level::Debug => "DEBUG".blue(),
        Level::Trace => "TRACE".normal(),
    }
}

/// Installs the global logger at `level` unless `RUST_LOG` says otherwise.
/// Lines read `<time> <LEVEL>: <message>`. Calling it twice is harmless.
pub fn init_logger(level: &str) {
    let mut builder = Builder::from_env(Env::default().default_filter_or(level));
    builder.format(|buf, record| {
        writeln!(buf, "{} {}: {}", buf.timestamp_millis(), level_str(record.level()), record.args())
    });
    let _ = builder.try_init();
}
