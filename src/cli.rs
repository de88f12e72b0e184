use std::env;
use std::fmt;
use std::process;

/// Verbs the command line exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Put,
    Transfer,
    Mkdir,
    Rmdir,
    Delete,
    List,
    Size,
    Mdtm,
    Cksm,
    Feat,
}

impl Verb {
    fn parse(s: &str) -> Option<Verb> {
        Some(match s {
            "get" => Verb::Get,
            "put" => Verb::Put,
            "transfer" => Verb::Transfer,
            "mkdir" => Verb::Mkdir,
            "rmdir" => Verb::Rmdir,
            "delete" => Verb::Delete,
            "list" => Verb::List,
            "size" => Verb::Size,
            "mdtm" => Verb::Mdtm,
            "cksm" => Verb::Cksm,
            "feat" => Verb::Feat,
            _ => return None,
        })
    }
}

/// Parsed command line.
///
/// `second` is the destination URL of `transfer` and the local file of
/// `get` and `put` (standard output and input when absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub log_file: Option<String>,
    pub debug: bool,
    pub config_file: Option<String>,
    /// Retries after a fault; negative retries forever.
    pub retries: i32,
    pub verb: Verb,
    pub url: String,
    pub second: Option<String>,
}

/// Reason the command line was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    Help,
    Version,
    Invalid(String),
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageError::Help => f.write_str("help requested"),
            UsageError::Version => f.write_str("version requested"),
            UsageError::Invalid(msg) => f.write_str(msg),
        }
    }
}

/// Prints usage instructions for the program.
pub fn print_usage() {
    println!(
        "Usage: {} [-h] [-v] [-d] [-l logfile] [-c config.json] [-r retries] <verb> <url> [url2]",
        crate::PROGRAM_NAME
    );
    println!("Verbs: get put transfer mkdir rmdir delete list size mdtm cksm feat");
    println!("  get <url> [file]      retrieve to file (default stdout)");
    println!("  put <url> [file]      store from file (default stdin)");
    println!("  transfer <src> <dst>  third-party transfer between two servers");
}

/// Parses the process arguments, exiting with usage on error
pub fn parse_args() -> CliArgs {
    match parse_from(env::args().skip(1)) {
        Ok(args) => args,
        Err(UsageError::Help) => {
            print_usage();
            process::exit(0);
        }
        Err(UsageError::Version) => {
            println!("{} version {}", crate::PROGRAM_NAME, crate::PROGRAM_VERSION);
            process::exit(0);
        }
        Err(UsageError::Invalid(msg)) => {
            eprintln!("Error: {}", msg);
            print_usage();
            process::exit(1);
        }
    }
}

/// Parses arguments, program name excluded
pub fn parse_from<I>(args: I) -> Result<CliArgs, UsageError>
where
    I: IntoIterator<Item = String>,
{
    let mut log_file = None;
    let mut debug = false;
    let mut config_file = None;
    let mut retries = 0;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => return Err(UsageError::Help),
            "-v" => return Err(UsageError::Version),
            "-d" => debug = true,
            "-l" => {
                log_file = Some(
                    args.next()
                        .ok_or_else(|| UsageError::Invalid("Missing log file argument".into()))?,
                )
            }
            "-c" => {
                config_file = Some(args.next().ok_or_else(|| {
                    UsageError::Invalid("Missing config file argument".into())
                })?)
            }
            "-r" => {
                retries = match args.next() {
                    Some(arg) => arg.parse().map_err(|_| {
                        UsageError::Invalid("Retries must be a number".into())
                    })?,
                    None => return Err(UsageError::Invalid("Missing retries argument".into())),
                }
            }
            s if s.starts_with('-') && s.len() > 1 => {
                return Err(UsageError::Invalid(format!("Unknown option: {}", s)))
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let verb_text = positional
        .next()
        .ok_or_else(|| UsageError::Invalid("Missing verb".into()))?;
    let verb = Verb::parse(&verb_text)
        .ok_or_else(|| UsageError::Invalid(format!("Unknown verb: {}", verb_text)))?;
    let url = positional
        .next()
        .ok_or_else(|| UsageError::Invalid("Missing url argument".into()))?;
    let second = positional.next();
    if let Some(extra) = positional.next() {
        return Err(UsageError::Invalid(format!("Unexpected argument: {}", extra)));
    }
    match (verb, &second) {
        (Verb::Transfer, None) => {
            return Err(UsageError::Invalid("transfer needs a destination url".into()))
        }
        (Verb::Get | Verb::Put | Verb::Transfer, _) | (_, None) => {}
        (_, Some(extra)) => {
            return Err(UsageError::Invalid(format!("Unexpected argument: {}", extra)))
        }
    }

    Ok(CliArgs {
        log_file,
        debug,
        config_file,
        retries,
        verb,
        url,
        second,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, UsageError> {
        parse_from(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_full_command_line() {
        let args = parse(&[
            "-d", "-l", "/tmp/x.log", "-c", "cfg.json", "-r", "-1", "get", "gsiftp://h/f", "out",
        ])
        .unwrap();
        assert!(args.debug);
        assert_eq!(args.log_file.as_deref(), Some("/tmp/x.log"));
        assert_eq!(args.config_file.as_deref(), Some("cfg.json"));
        assert_eq!(args.retries, -1);
        assert_eq!(args.verb, Verb::Get);
        assert_eq!(args.url, "gsiftp://h/f");
        assert_eq!(args.second.as_deref(), Some("out"));
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["size", "ftp://h/f"]).unwrap();
        assert!(!args.debug);
        assert_eq!(args.retries, 0);
        assert_eq!(args.second, None);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(parse(&["-h"]), Err(UsageError::Help));
        assert_eq!(parse(&["-v", "get"]), Err(UsageError::Version));
        assert!(matches!(parse(&[]), Err(UsageError::Invalid(_))));
        assert!(matches!(parse(&["fetch", "ftp://h/f"]), Err(UsageError::Invalid(_))));
        assert!(matches!(parse(&["get"]), Err(UsageError::Invalid(_))));
        assert!(matches!(parse(&["transfer", "ftp://a/f"]), Err(UsageError::Invalid(_))));
        assert!(matches!(parse(&["mkdir", "ftp://a/d", "x"]), Err(UsageError::Invalid(_))));
        assert!(matches!(parse(&["-r", "many", "feat", "ftp://a/"]), Err(UsageError::Invalid(_))));
        assert!(matches!(parse(&["-x", "feat", "ftp://a/"]), Err(UsageError::Invalid(_))));
    }
}
