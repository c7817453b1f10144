//! Command-line front end over the threadjack engine.
//!
//! Usage: `threadjack <thread_id or process_id> <dll_path> [<dll_path> ...]`.
//!
//! The exit code is the scripting contract: `0` success, `0x10` missing
//! arguments, `0x11` unusable id, `0x06`/`0x07`/`0x08` attach/upgrade/
//! resolution failures, `0x20`/`0x21` loader export resolution failures,
//! `0x92`/`0x93` remote memory stack failures. When several DLLs are given,
//! each is injected independently; the run only reports failure when every
//! payload failed.

use std::process::exit;

const EXIT_MISSING_ARGS: u8 = 0x10;
const EXIT_INVALID_ID: u8 = 0x11;

const USAGE: &str = "Usage: threadjack <thread_id:u32 or process_id:u32> <dll_path> [<dll_path> ...]

Loads the given DLLs into the target process by hijacking an existing
thread of the target, never by creating a new one. The id may name either
a thread (attached directly) or a process (a suitable thread is selected).

Options:
    -h, --help    Print this help text";

/// A parsed invocation.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Run { id: u32, paths: Vec<String> },
}

#[derive(Debug, PartialEq, Eq)]
enum ParseError {
    MissingArgs,
    InvalidId,
}

impl ParseError {
    fn exit_code(&self) -> u8 {
        match self {
            ParseError::MissingArgs => EXIT_MISSING_ARGS,
            ParseError::InvalidId => EXIT_INVALID_ID,
        }
    }
}

/// Parses everything after the program name.
fn parse_args(args: &[String]) -> Result<Command, ParseError> {
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Command::Help);
    }
    if args.len() < 2 {
        return Err(ParseError::MissingArgs);
    }

    let id: u32 = args[0].parse().map_err(|_| ParseError::InvalidId)?;
    if id == 0 {
        return Err(ParseError::InvalidId);
    }

    Ok(Command::Run {
        id,
        paths: args[1..].to_vec(),
    })
}

fn main() {
    #[cfg(feature = "tracing")]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{USAGE}");
            exit(err.exit_code() as i32);
        }
    };

    match command {
        Command::Help => println!("{USAGE}"),
        Command::Run { id, paths } => exit(run(id, &paths) as i32),
    }
}

#[cfg(windows)]
fn run(id: u32, paths: &[String]) -> u8 {
    use threadjack::{resolve_export, Engine, EngineConfig};

    let load_library = match resolve_export("kernel32.dll", "LoadLibraryA") {
        Ok(address) => address,
        Err(err) => {
            eprintln!("threadjack: {err}");
            return err.exit_code();
        }
    };

    let engine = Engine::open(EngineConfig::default());
    let mut session = match engine.attach(id) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("threadjack: {err}");
            return err.exit_code();
        }
    };

    let mut successes = 0usize;
    let mut first_failure: Option<threadjack::Error> = None;

    for path in paths {
        let outcome = inject(&mut session, load_library, path);
        match outcome {
            Ok(handle) => {
                successes += 1;
                println!("{path}: loaded, module handle {handle:#x}");
            }
            Err(err) => {
                eprintln!("threadjack: {path}: {err}");
                let fatal = err.is_fatal();
                first_failure.get_or_insert(err);
                // A fatal call error poisons the session; remaining payloads
                // cannot be attempted.
                if fatal {
                    break;
                }
            }
        }
    }

    if let Err(err) = session.detach() {
        eprintln!("threadjack: teardown: {err}");
    }
    engine.close();

    match first_failure {
        Some(err) if successes == 0 => err.exit_code(),
        _ => 0,
    }
}

/// One full payload cycle: stage, push, call, release.
#[cfg(windows)]
fn inject(
    session: &mut threadjack::Session,
    load_library: usize,
    path: &str,
) -> threadjack::Result<usize> {
    use threadjack::{CallDescriptor, RemoteRegion};

    let bytes = path.as_bytes();
    let mut region = RemoteRegion::create(bytes.len())?;
    region.local_mut().copy_from_slice(bytes);

    let remote = match region.push(session) {
        Ok(remote) => remote,
        Err(err) => {
            region.delete(session);
            return Err(err);
        }
    };

    let result = session.invoke(&CallDescriptor::new(load_library, remote));
    region.delete(session);

    let handle = result?;
    if handle == 0 {
        return Err(threadjack::Error::Execution(
            "remote loader returned a null module handle".into(),
        ));
    }
    Ok(handle)
}

#[cfg(not(windows))]
fn run(_id: u32, _paths: &[String]) -> u8 {
    eprintln!("threadjack: thread hijacking requires Windows");
    0x01
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn help_flag_wins_over_everything() {
        assert_eq!(parse_args(&strings(&["-h"])), Ok(Command::Help));
        assert_eq!(
            parse_args(&strings(&["123", "a.dll", "--help"])),
            Ok(Command::Help)
        );
    }

    #[test]
    fn missing_arguments_are_rejected() {
        assert_eq!(parse_args(&[]), Err(ParseError::MissingArgs));
        assert_eq!(parse_args(&strings(&["123"])), Err(ParseError::MissingArgs));
        assert_eq!(ParseError::MissingArgs.exit_code(), 0x10);
    }

    #[test]
    fn zero_and_garbage_ids_are_rejected() {
        assert_eq!(
            parse_args(&strings(&["0", "a.dll"])),
            Err(ParseError::InvalidId)
        );
        assert_eq!(
            parse_args(&strings(&["-4", "a.dll"])),
            Err(ParseError::InvalidId)
        );
        assert_eq!(
            parse_args(&strings(&["pid", "a.dll"])),
            Err(ParseError::InvalidId)
        );
        assert_eq!(ParseError::InvalidId.exit_code(), 0x11);
    }

    #[test]
    fn multiple_paths_are_preserved_in_order() {
        assert_eq!(
            parse_args(&strings(&["4321", "a.dll", "b.dll"])),
            Ok(Command::Run {
                id: 4321,
                paths: vec!["a.dll".into(), "b.dll".into()],
            })
        );
    }
}
