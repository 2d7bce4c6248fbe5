//! Tracing setup. Diagnostics go to stderr so the terminal UI keeps sole
//! custody of stdout; payload and notification output is not logging and
//! does not pass through here.

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// The log verbosity. Can be one of trace|debug|info|warn|error|off
    #[arg(
        long = "log.level",
        default_value_t = LogLevel::Warn,
        ignore_case = true,
        value_enum,
        global = true
    )]
    pub level: LogLevel,
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        })
    }
}

/// Initializes logging from the given args. Panics if called twice.
pub fn init_logging(args: &LogArgs) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.level.to_string())
        .with_target(false)
        // Raw terminal mode and ANSI color codes from the subscriber mix
        // badly; only colorize when stderr is a tty of its own.
        .with_ansi(atty::is(atty::Stream::Stderr))
        .compact()
        .init();
}
