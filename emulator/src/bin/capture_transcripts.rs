use std::fs;
use std::io;
use std::path::Path;

#[allow(dead_code)]
#[path = "../card.rs"]
mod card;
#[allow(dead_code)]
#[path = "../flash.rs"]
mod flash;
#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Session, SessionOptions, TranscriptProfile};

const EVIDENCE_DIR: &str = "transcripts";
const STATE_DIR: &str = "target/emulator-transcripts";

fn main() -> io::Result<()> {
    let requested: Vec<String> = std::env::args().skip(1).collect();
    let profiles = if requested.is_empty() {
        TranscriptProfile::ALL.to_vec()
    } else {
        requested
            .iter()
            .map(|tag| TranscriptProfile::from_tag(tag))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?
    };

    for profile in profiles {
        record_profile(profile)?;
    }
    Ok(())
}

fn record_profile(profile: TranscriptProfile) -> io::Result<()> {
    let state = Path::new(STATE_DIR).join(profile.tag());
    if state.exists() {
        fs::remove_dir_all(&state)?;
    }
    fs::create_dir_all(state.join("card"))?;

    let log = Path::new(EVIDENCE_DIR).join(format!("emulator-{}.log", profile.tag()));
    let options = SessionOptions::new(&state).with_transcript(log, profile.header());
    let mut session = Session::new(options)?;
    match profile {
        TranscriptProfile::Update => record_update(&mut session),
        TranscriptProfile::NoTrigger => record_no_trigger(&mut session),
        TranscriptProfile::MissingImage => record_missing_image(&mut session),
        TranscriptProfile::InvalidImage => record_invalid_image(&mut session, &state),
    }
}

fn record_update(session: &mut Session) -> io::Result<()> {
    let _ = session.handle_command("stage demo 10000")?;
    let _ = session.handle_command("trigger")?;
    let _ = session.handle_command("boot")?;
    let _ = session.handle_command("status")?;
    let _ = session.handle_command("boot")?;
    Ok(())
}

fn record_no_trigger(session: &mut Session) -> io::Result<()> {
    let _ = session.handle_command("stage demo 2048")?;
    let _ = session.handle_command("ls")?;
    let _ = session.handle_command("boot")?;
    let _ = session.handle_command("status")?;
    Ok(())
}

fn record_missing_image(session: &mut Session) -> io::Result<()> {
    let _ = session.handle_command("trigger")?;
    let _ = session.handle_command("boot")?;
    let _ = session.handle_command("ls")?;
    Ok(())
}

fn record_invalid_image(session: &mut Session, state: &Path) -> io::Result<()> {
    let garbage = state.join("garbage.bin");
    fs::write(&garbage, vec![0xA5; 4096])?;
    let _ = session.handle_command(&format!("stage {}", garbage.display()))?;
    let _ = session.handle_command("trigger")?;
    let _ = session.handle_command("boot")?;
    let _ = session.handle_command("status")?;
    Ok(())
}
