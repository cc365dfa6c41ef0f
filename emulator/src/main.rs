mod card;
mod flash;
mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use crossterm::style::Stylize;
use session::{Session, SessionOptions};
use updater_core::orchestrator::BootDecision;

const DEFAULT_STATE_DIR: &str = "target/emulator";
const USAGE: &str = "Usage: updater-emulator [--state <dir>] [--card <dir>] [--flash <file>] \
                     [--transcript <file>] [--format-if-mount-failed] [--heartbeats <n>]";

fn main() -> io::Result<()> {
    let options = parse_options().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(options)?;
    let mut line = String::new();

    writeln!(
        writer,
        "SD updater emulator ready. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        let responses = session.handle_command(trimmed)?;
        for response in responses {
            writeln!(writer, "{}", styled(&response))?;
        }
        if trimmed == "boot" && matches!(session.last_decision(), Some(BootDecision::Restart(_))) {
            writeln!(
                writer,
                "{}",
                format!("device restarted after boot #{}", session.boots()).green()
            )?;
        }
    }

    Ok(())
}

fn styled(line: &str) -> String {
    if line.starts_with("ERR") || line.starts_with("telemetry!") {
        line.red().to_string()
    } else if line.starts_with("restart:") {
        line.green().to_string()
    } else if line.starts_with("idle:") || line.starts_with("heartbeat") {
        line.yellow().to_string()
    } else {
        line.to_string()
    }
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options() -> Result<SessionOptions, String> {
    let mut args = env::args().skip(1);
    let mut state_dir = PathBuf::from(DEFAULT_STATE_DIR);
    let mut card = None;
    let mut flash = None;
    let mut transcript = None;
    let mut format_if_mount_failed = false;
    let mut heartbeats = None;

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        if flag == "--format-if-mount-failed" {
            format_if_mount_failed = true;
            continue;
        }
        let value = inline
            .or_else(|| args.next())
            .ok_or_else(|| format!("Expected value after {flag}"))?;
        match flag.as_str() {
            "--state" => state_dir = PathBuf::from(value),
            "--card" => card = Some(PathBuf::from(value)),
            "--flash" => flash = Some(PathBuf::from(value)),
            "--transcript" => transcript = Some(PathBuf::from(value)),
            "--heartbeats" => {
                heartbeats = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| format!("Invalid heartbeat count `{value}`"))?,
                );
            }
            other => return Err(format!("Unknown option `{other}`")),
        }
    }

    let mut options = SessionOptions::new(&state_dir);
    if let Some(card) = card {
        options.card_dir = card;
    }
    if let Some(flash) = flash {
        options.flash_path = flash;
    }
    if let Some(path) = transcript {
        options = options.with_transcript(path, "SD updater emulator interactive transcript");
    }
    if let Some(count) = heartbeats {
        options.heartbeats = count;
    }
    options.format_if_mount_failed = format_if_mount_failed;
    Ok(options)
}
