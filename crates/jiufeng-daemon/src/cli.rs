//! Command-line surface (`spec.md §6`: "Daemon CLI").

use std::path::PathBuf;

use clap::Parser;

pub const VERSION_STRING: &str = concat!("jiufengd ", env!("CARGO_PKG_VERSION"));

/// `-V` here is a custom flag that prints [`VERSION_STRING`] and exits,
/// matching the original daemon's own version banner rather than clap's
/// built-in `--version` (which would print the crate's Cargo metadata).
#[derive(Parser, Debug)]
#[command(name = "jiufengd", about = "jiufeng message dispatcher daemon", disable_version_flag = true)]
pub struct Args {
    /// Run in the foreground instead of detaching from the controlling
    /// terminal.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Path to a settings file overriding the compiled-in defaults.
    #[arg(short = 's', long = "settings", value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Print the daemon's version string and exit.
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    /// Log verbosity: 0 silent .. 4 trace/data.
    #[arg(short = 'T', long = "log-level", value_name = "0..4", default_value_t = 2)]
    pub log_level: u8,

    /// Write logs to this file in addition to stderr.
    #[arg(short = 'F', long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Roll the log file once it exceeds this many bytes. Ignored without
    /// `-F`.
    #[arg(short = 'S', long = "log-file-size", value_name = "BYTES", default_value_t = 10 * 1024 * 1024)]
    pub log_file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_background_and_log_level_two() {
        let args = Args::parse_from(["jiufengd"]);
        assert!(!args.foreground);
        assert_eq!(args.log_level, 2);
        assert!(args.settings.is_none());
        assert!(args.log_file.is_none());
    }

    #[test]
    fn parses_short_flags() {
        let args = Args::parse_from(["jiufengd", "-f", "-T", "4", "-F", "/tmp/jiufengd.log", "-S", "1024"]);
        assert!(args.foreground);
        assert_eq!(args.log_level, 4);
        assert_eq!(args.log_file.as_deref(), Some(std::path::Path::new("/tmp/jiufengd.log")));
        assert_eq!(args.log_file_size, 1024);
    }

    #[test]
    fn custom_version_flag_is_distinct_from_clap_builtin() {
        let args = Args::parse_from(["jiufengd", "-V"]);
        assert!(args.version);
    }
}
