//! Command line parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::LevelFilter;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "webserver.conf",
    "./webserver.conf",
    "./config/webserver.conf",
];

/// What the command line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(Args),
    Help,
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// None means the first of the default locations that exists.
    pub config: Option<PathBuf>,
    pub prefix: String,
    pub log_level: LevelFilter,
    pub timeout: Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            prefix: String::new(),
            log_level: LevelFilter::Info,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl Args {
    pub fn config_path(&self) -> Result<PathBuf> {
        if let Some(config) = &self.config {
            return Ok(config.clone());
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.is_file())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                anyhow!(
                    "no configuration file given and none found at {}",
                    DEFAULT_CONFIG_PATHS.join(", ")
                )
            })
    }
}

fn parse_log_level(level: &str) -> Result<LevelFilter> {
    Ok(match level.to_ascii_lowercase().as_str() {
        "error" | "0" => LevelFilter::Error,
        "warn" | "1" => LevelFilter::Warn,
        "info" | "2" => LevelFilter::Info,
        "debug" | "3" => LevelFilter::Debug,
        _ => bail!("log level {} is invalid", level),
    })
}

fn parse_timeout(number: &str) -> Result<Duration> {
    let secs = number
        .parse::<u64>()
        .with_context(|| format!("timeout number {} is invalid", number))?;
    if secs == 0 {
        bail!("timeout must be at least one second");
    }
    Ok(Duration::from_secs(secs))
}

/// Split `--name=value` into its parts.
fn split_option(arg: &str) -> (&str, Option<&str>) {
    match arg.find('=') {
        Some(pos) => (&arg[..pos], Some(&arg[pos + 1..])),
        None => (arg, None),
    }
}

pub fn from_command_line() -> Result<Command> {
    parse(std::env::args().skip(1))
}

/// Parse the arguments following the program name.
pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Command> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    let mut only_positional = false;
    while let Some(arg) = args.next() {
        if only_positional || !arg.starts_with('-') || arg == "-" {
            if parsed.config.is_some() {
                bail!("unexpected argument `{}'", arg);
            }
            parsed.config = Some(PathBuf::from(arg));
            continue;
        }
        if arg == "--" {
            only_positional = true;
            continue;
        }
        if !arg.starts_with("--") {
            let mut want_version = false;
            for flag in arg.chars().skip(1) {
                match flag {
                    'h' => return Ok(Command::Help),
                    'v' => want_version = true,
                    _ => bail!("unknown flag `-{}'", flag),
                }
            }
            if want_version {
                return Ok(Command::Version);
            }
            continue;
        }

        let (name, inline) = split_option(&arg);
        let mut value = |what: &str| -> Result<String> {
            match inline {
                Some(value) => Ok(value.to_string()),
                None => args
                    .next()
                    .with_context(|| format!("missing {} after {}", what, name)),
            }
        };
        match name {
            "--help" => return Ok(Command::Help),
            "--version" => return Ok(Command::Version),
            "--prefix-path" => parsed.prefix = value("path")?,
            "--log-level" => parsed.log_level = parse_log_level(&value("level")?)?,
            "--timeout" => parsed.timeout = parse_timeout(&value("number")?)?,
            _ => bail!("unknown argument `{}'", arg),
        }
    }
    Ok(Command::Run(parsed))
}

pub fn usage(argv0: &str) -> String {
    format!(
        "usage:\t{} [flags] [config_file]\n\n\
        \tWithout config_file, the first of {} is used.\n\n\
        flags:\t-h, --help\n\
        \t\tPrint this message and exit.\n\n\
        \t-v, --version\n\
        \t\tPrint the version and exit.\n\n\
        \t--prefix-path path (default: none)\n\
        \t\tPrepended to every root, error page and upload path.\n\n\
        \t--log-level level (default: info)\n\
        \t\tOne of error, warn, info, debug, or 0 to 3.\n\
        \t\tRUST_LOG overrides it.\n\n\
        \t--timeout secs (default: {})\n\
        \t\tIf a connection is idle for more than this many seconds,\n\
        \t\tit is answered with 408 and closed.\n\n",
        argv0,
        DEFAULT_CONFIG_PATHS.join(", "),
        DEFAULT_TIMEOUT_SECS,
    )
}
