//! conmux: container console multiplexer CLI.
//!
//! Commands:
//!   conmux attach <container> [options]   - attach to a container console/tty
//!
//! Options for attach:
//!   -t, --tty N         tty to attach to (0 = console, default)
//!   -e, --escape LETTER detach prefix letter, Ctrl+LETTER (default: a)
//!   -P, --path DIR      container base directory override

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use conmux::attach::{DEFAULT_ESCAPE, attach};
use conmux::config::Config;
use conmux::log::log_error;
use conmux::paths;

/// Action to take based on command-line arguments
#[derive(Debug, PartialEq)]
enum MainAction {
    /// Attach to a container console or tty
    Attach(AttachArgs),
    /// Print usage and exit
    Help,
}

#[derive(Debug, PartialEq)]
struct AttachArgs {
    container: String,
    ttynum: i32,
    escape: u8,
    base_dir: Option<PathBuf>,
}

/// Map an escape letter to its control byte (a => 1 ... z => 26).
fn escape_byte(letter: &str) -> Result<u8, String> {
    let mut chars = letter.chars();
    match (chars.next(), chars.next()) {
        (Some(c @ 'a'..='z'), None) => Ok(c as u8 - b'a' + 1),
        _ => Err(format!("invalid escape letter '{}', expected a..z", letter)),
    }
}

/// Determine what action to take based on command-line arguments
fn determine_action(args: &[String]) -> Result<MainAction, String> {
    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        return Ok(MainAction::Help);
    }

    match args[1].as_str() {
        "attach" => {
            let mut container = None;
            let mut ttynum = 0i32;
            let mut escape = DEFAULT_ESCAPE;
            let mut base_dir = None;

            let mut rest = args[2..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "-h" | "--help" => return Ok(MainAction::Help),
                    "-t" | "--tty" => {
                        let value = rest.next().ok_or("missing value for --tty")?;
                        ttynum = value
                            .parse()
                            .map_err(|_| format!("invalid tty number '{}'", value))?;
                    }
                    "-e" | "--escape" => {
                        let value = rest.next().ok_or("missing value for --escape")?;
                        escape = escape_byte(value)?;
                    }
                    "-P" | "--path" => {
                        let value = rest.next().ok_or("missing value for --path")?;
                        base_dir = Some(PathBuf::from(value));
                    }
                    name if !name.starts_with('-') && container.is_none() => {
                        container = Some(name.to_string());
                    }
                    other => return Err(format!("unexpected argument '{}'", other)),
                }
            }

            let container = container.ok_or("container name required")?;
            Ok(MainAction::Attach(AttachArgs {
                container,
                ttynum,
                escape,
                base_dir,
            }))
        }
        other => Err(format!("unknown command '{}'", other)),
    }
}

fn run_attach(args: AttachArgs) -> Result<()> {
    let base_dir = args.base_dir.unwrap_or_else(paths::base_dir);
    attach(&args.container, &base_dir, args.ttynum, args.escape)
        .with_context(|| format!("failed to attach to '{}'", args.container))
}

fn print_usage() {
    eprintln!("conmux - container console multiplexer");
    eprintln!();
    eprintln!("Usage: conmux attach <container> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -t, --tty N          tty to attach to (0 = console, default)");
    eprintln!("  -e, --escape LETTER  detach prefix letter, Ctrl+LETTER (default: a)");
    eprintln!("  -P, --path DIR       container base directory override");
    eprintln!();
    eprintln!("Detach with <Ctrl+ESCAPE q>.");
}

fn main() {
    // Initialize global config from environment variables
    Config::init();

    // Log panics instead of corrupting a raw-mode terminal with a backtrace
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log_error("cli", "panic", &format!("{} at {}", message, location));
    }));

    let args: Vec<String> = std::env::args().collect();

    match determine_action(&args) {
        Ok(MainAction::Help) => {
            print_usage();
        }
        Ok(MainAction::Attach(attach_args)) => {
            if let Err(e) = run_attach(attach_args) {
                eprintln!("conmux: {:#}", e);
                process::exit(1);
            }
        }
        Err(message) => {
            eprintln!("conmux: {}", message);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("conmux")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn no_args_prints_help() {
        assert_eq!(determine_action(&argv(&[])).unwrap(), MainAction::Help);
    }

    #[test]
    fn attach_defaults_to_console_and_ctrl_a() {
        match determine_action(&argv(&["attach", "web1"])).unwrap() {
            MainAction::Attach(args) => {
                assert_eq!(args.container, "web1");
                assert_eq!(args.ttynum, 0);
                assert_eq!(args.escape, 1);
                assert_eq!(args.base_dir, None);
            }
            other => panic!("expected attach, got {:?}", other),
        }
    }

    #[test]
    fn attach_parses_all_options() {
        let action = determine_action(&argv(&[
            "attach", "db", "--tty", "2", "--escape", "b", "--path", "/tmp/ct",
        ]))
        .unwrap();
        match action {
            MainAction::Attach(args) => {
                assert_eq!(args.container, "db");
                assert_eq!(args.ttynum, 2);
                assert_eq!(args.escape, 2);
                assert_eq!(args.base_dir, Some(PathBuf::from("/tmp/ct")));
            }
            other => panic!("expected attach, got {:?}", other),
        }
    }

    #[test]
    fn attach_requires_container_name() {
        assert!(determine_action(&argv(&["attach"])).is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(determine_action(&argv(&["destroy", "web1"])).is_err());
    }

    #[test]
    fn escape_letters_map_to_control_bytes() {
        assert_eq!(escape_byte("a").unwrap(), 1);
        assert_eq!(escape_byte("z").unwrap(), 26);
        assert!(escape_byte("A").is_err());
        assert!(escape_byte("aa").is_err());
        assert!(escape_byte("1").is_err());
    }
}
