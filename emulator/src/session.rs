use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant as StdInstant};

use updater_core::config::UpdaterConfig;
use updater_core::heartbeat::Heartbeat;
use updater_core::orchestrator::{BootDecision, RestartReason, UpdateOrchestrator};
use updater_core::partition::PartitionTable;
use updater_core::storage::listing::walk;
use updater_core::storage::StorageSession;
use updater_core::telemetry::{
    EventId, TelemetryInstant, TelemetryPayload, TelemetryRecorder, TelemetrySink,
    UpdateEventKind,
};

use crate::card::HostCard;
use crate::flash::{self, demo_image};

const DEFAULT_HEARTBEATS: u32 = 4;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "stage",
        "stage <file> | stage demo <bytes>  - place an update image on the card",
    ),
    (
        "trigger",
        "trigger                            - create the update marker",
    ),
    (
        "boot",
        "boot                               - power-cycle the device once",
    ),
    (
        "ls",
        "ls                                 - list the card root",
    ),
    (
        "status",
        "status                             - show the boot record",
    ),
    (
        "help",
        "help [topic]                       - show help for a command",
    ),
];

/// Scripted scenarios recorded by `capture_transcripts`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    Update,
    NoTrigger,
    MissingImage,
    InvalidImage,
}

impl TranscriptProfile {
    pub const ALL: [TranscriptProfile; 4] = [
        TranscriptProfile::Update,
        TranscriptProfile::NoTrigger,
        TranscriptProfile::MissingImage,
        TranscriptProfile::InvalidImage,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            TranscriptProfile::Update => "update",
            TranscriptProfile::NoTrigger => "no-trigger",
            TranscriptProfile::MissingImage => "missing-image",
            TranscriptProfile::InvalidImage => "invalid-image",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            TranscriptProfile::Update => "SD updater emulator: staged update transcript",
            TranscriptProfile::NoTrigger => "SD updater emulator: idle boot transcript",
            TranscriptProfile::MissingImage => "SD updater emulator: missing image transcript",
            TranscriptProfile::InvalidImage => "SD updater emulator: rejected image transcript",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.tag().eq_ignore_ascii_case(tag))
            .ok_or_else(|| format!("Unknown transcript profile `{tag}`"))
    }
}

/// Where the emulated device keeps its state.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub card_dir: PathBuf,
    pub flash_path: PathBuf,
    pub transcript: Option<(PathBuf, String)>,
    pub format_if_mount_failed: bool,
    pub heartbeats: u32,
}

impl SessionOptions {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            card_dir: state_dir.join("card"),
            flash_path: state_dir.join("flash.bin"),
            transcript: None,
            format_if_mount_failed: false,
            heartbeats: DEFAULT_HEARTBEATS,
        }
    }

    pub fn with_transcript(mut self, path: PathBuf, header: &str) -> Self {
        self.transcript = Some((path, header.to_string()));
        self
    }
}

pub struct Session {
    options: SessionOptions,
    config: UpdaterConfig,
    transcript: Option<TranscriptLogger>,
    started_at: StdInstant,
    boots: u32,
    last_decision: Option<BootDecision>,
}

impl Session {
    pub fn new(options: SessionOptions) -> io::Result<Self> {
        let transcript = match &options.transcript {
            Some((path, header)) => Some(TranscriptLogger::new(path, header)?),
            None => None,
        };
        let mut config = UpdaterConfig::new();
        config.mount = config
            .mount
            .with_format_if_mount_failed(options.format_if_mount_failed);

        Ok(Self {
            options,
            config,
            transcript,
            started_at: StdInstant::now(),
            boots: 0,
            last_decision: None,
        })
    }

    pub fn boots(&self) -> u32 {
        self.boots
    }

    pub fn last_decision(&self) -> Option<BootDecision> {
        self.last_decision
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.append_line(elapsed, TranscriptRole::Host, trimmed)?;
        }

        let mut words = trimmed.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let lines = match (command, args.as_slice()) {
            ("help", []) => help_lines(None),
            ("help", [topic]) => help_lines(Some(*topic)),
            ("stage", ["demo", len]) => match len.parse::<usize>() {
                Ok(len) => self.stage_bytes(&demo_image(len))?,
                Err(_) => vec![format!("ERR syntax invalid length `{len}`")],
            },
            ("stage", [source]) => match fs::read(source) {
                Ok(bytes) => self.stage_bytes(&bytes)?,
                Err(err) => vec![format!("ERR stage {source}: {err}")],
            },
            ("trigger", []) => self.create_trigger()?,
            ("boot", []) => self.boot()?,
            ("ls", []) => self.list(),
            ("status", []) => self.status()?,
            _ => vec![format!(
                "ERR syntax unknown command `{trimmed}` (try `help`)"
            )],
        };

        self.record_output(elapsed, &lines)?;
        Ok(lines)
    }

    fn record_output(&mut self, elapsed: Duration, lines: &[String]) -> io::Result<()> {
        if let Some(transcript) = self.transcript.as_mut() {
            for line in lines {
                transcript.append_line(elapsed, TranscriptRole::Emulator, line)?;
            }
        }
        Ok(())
    }

    fn card_path(&self, path: &str) -> PathBuf {
        self.options.card_dir.join(path.trim_start_matches('/'))
    }

    fn stage_bytes(&mut self, bytes: &[u8]) -> io::Result<Vec<String>> {
        let target = self.card_path(self.config.paths.image);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, bytes)?;
        Ok(vec![format!(
            "OK staged {} bytes at {}",
            bytes.len(),
            self.config.paths.image
        )])
    }

    fn create_trigger(&mut self) -> io::Result<Vec<String>> {
        fs::create_dir_all(&self.options.card_dir)?;
        fs::write(self.card_path(self.config.paths.trigger), b"")?;
        Ok(vec![format!("OK trigger {}", self.config.paths.trigger)])
    }

    /// Runs one emulated power cycle: boot delay, boot cycle, then restart or idle.
    fn boot(&mut self) -> io::Result<Vec<String>> {
        self.boots += 1;
        let mut lines = vec![format!(
            "boot #{} (delay {}ms skipped)",
            self.boots,
            self.config.boot_delay.as_millis()
        )];

        let partitions = match flash::open_partitions(&self.options.flash_path)? {
            Ok(partitions) => partitions,
            Err(err) => {
                lines.push(format!("ERR flash {err}"));
                return Ok(lines);
            }
        };
        let card = HostCard::new(&self.options.card_dir);
        let mut orchestrator = UpdateOrchestrator::new(card, partitions, self.config);
        let mut sink = TranscriptSink::new();
        let decision = orchestrator.run_boot_cycle(&mut sink);
        let (_, partitions) = orchestrator.into_parts();
        flash::persist_partitions(partitions)?;

        lines.extend(sink.into_lines());
        self.last_decision = Some(decision);
        match decision {
            BootDecision::Restart(RestartReason::Activated {
                partition,
                image_len,
            }) => lines.push(format!(
                "restart: {partition} activated ({image_len} bytes)"
            )),
            BootDecision::Restart(RestartReason::ActivationFailed(err)) => {
                lines.push(format!("restart: activation failed ({err})"));
            }
            BootDecision::Idle(reason) => {
                lines.push(format!("idle: {reason}"));
                lines.push(self.heartbeat_line());
            }
        }
        Ok(lines)
    }

    fn heartbeat_line(&self) -> String {
        let mut heartbeat = Heartbeat::new(self.config.heartbeat_period);
        let mut line = format!(
            "heartbeat every {}ms: ",
            heartbeat.period().as_millis()
        );
        for _ in 0..self.options.heartbeats {
            line.push(heartbeat.phase().glyph());
            heartbeat.tick();
        }
        line
    }

    fn list(&self) -> Vec<String> {
        let mut card = HostCard::new(&self.options.card_dir);
        let mut session = match StorageSession::mount(&mut card, &self.config.mount) {
            Ok(session) => session,
            Err(err) => return vec![format!("ERR mount {err}")],
        };
        let mount_point = session.mount_point();
        let mut lines = Vec::new();
        let walked = session.fs().and_then(|fs| {
            walk(fs, "/", u8::MAX, &mut |path, entry| {
                lines.push(format!(
                    "{} {mount_point}{path} {}",
                    entry.kind.tag(),
                    entry.len
                ));
            })
        });
        if let Err(err) = walked {
            lines.push(format!("ERR list {err}"));
        }
        lines
    }

    fn status(&self) -> io::Result<Vec<String>> {
        let partitions = match flash::open_partitions(&self.options.flash_path)? {
            Ok(partitions) => partitions,
            Err(err) => return Ok(vec![format!("ERR flash {err}")]),
        };
        let record = match partitions.boot_record() {
            Some(record) => format!(
                "record seq={} slot={} len={}",
                record.sequence, record.slot, record.image_len
            ),
            None => "record none".to_string(),
        };
        let next = partitions
            .next_update_partition()
            .map_or_else(|| "none".to_string(), |slot| slot.to_string());
        Ok(vec![
            format!("active {} next {next}", partitions.active()),
            record,
            format!("boots {}", self.boots),
        ])
    }
}

fn help_lines(topic: Option<&str>) -> Vec<String> {
    match topic {
        None => HELP_TOPICS
            .iter()
            .map(|(_, detail)| format!("  {detail}"))
            .collect(),
        Some(target) => match HELP_TOPICS.iter().find(|(name, _)| *name == target) {
            Some((_, detail)) => vec![format!("  {detail}")],
            None => vec![
                format!("No help available for `{target}`."),
                format!("Available topics: {}", help_topic_list()),
            ],
        },
    }
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Monotonic host timestamp for the telemetry ring.
#[derive(Clone, Copy, Debug)]
pub struct HostInstant(StdInstant);

impl HostInstant {
    pub fn now() -> Self {
        Self(StdInstant::now())
    }
}

impl TelemetryInstant for HostInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

/// Collects boot-cycle telemetry as transcript lines.
pub struct TranscriptSink {
    recorder: TelemetryRecorder<HostInstant>,
    lines: Vec<String>,
}

impl TranscriptSink {
    pub fn new() -> Self {
        Self {
            recorder: TelemetryRecorder::new(),
            lines: Vec::new(),
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

impl Default for TranscriptSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for TranscriptSink {
    fn record(&mut self, event: UpdateEventKind, payload: TelemetryPayload) -> EventId {
        let id = self.recorder.record(event, payload, HostInstant::now());
        let marker = if event.is_failure() { "!" } else { " " };
        self.lines.push(match payload {
            TelemetryPayload::None => format!("telemetry{marker}{event}"),
            details => format!("telemetry{marker}{event} {details:?}"),
        });
        id
    }

    fn note(&mut self, event: UpdateEventKind, text: &str) {
        self.lines.push(format!("  {event}: {text}"));
    }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path, header: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        logger.write_header(header)?;
        Ok(logger)
    }

    fn write_header(&mut self, header: &str) -> io::Result<()> {
        writeln!(self.writer, "# {header}")?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds since session start"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

/// Returns a fresh, empty directory unique to this test process.
#[cfg(test)]
pub(crate) fn scratch_dir(name: &str) -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let unique = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "updater-emulator-{}-{name}-{unique}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use updater_core::orchestrator::IdleReason;
    use updater_core::partition::PartitionId;
    use updater_core::update::UpdateError;

    fn session(name: &str) -> (Session, PathBuf) {
        let dir = scratch_dir(name);
        fs::create_dir_all(dir.join("card")).expect("card dir");
        let session = Session::new(SessionOptions::new(&dir)).expect("session");
        (session, dir)
    }

    #[test]
    fn staged_update_activates_the_other_slot() {
        let (mut session, dir) = session("update");

        session.handle_command("stage demo 6000").expect("stage");
        session.handle_command("trigger").expect("trigger");
        let lines = session.handle_command("boot").expect("boot");

        assert_eq!(
            session.last_decision(),
            Some(BootDecision::Restart(RestartReason::Activated {
                partition: PartitionId::SlotB,
                image_len: 6_000,
            }))
        );
        assert!(lines.iter().any(|line| line.contains("  self-test-passed: Hello HOST!")));
        assert_eq!(lines.last().map(String::as_str), Some("restart: slot-b activated (6000 bytes)"));
        assert!(!dir.join("card/boot_cnt").exists());
        assert_eq!(
            fs::read(dir.join("card/test/foo.txt")).expect("probe file"),
            b"Hello HOST!\n"
        );

        let status = session.handle_command("status").expect("status");
        assert_eq!(status[0], "active slot-b next slot-a");
        assert_eq!(status[1], "record seq=1 slot=slot-b len=6000");
    }

    #[test]
    fn second_update_lands_in_the_bank_that_is_not_running() {
        let (mut session, _dir) = session("second-update");

        session.handle_command("stage demo 6000").expect("stage");
        session.handle_command("trigger").expect("trigger");
        session.handle_command("boot").expect("first update");
        session.handle_command("stage demo 7000").expect("restage");
        session.handle_command("trigger").expect("retrigger");
        let lines = session.handle_command("boot").expect("second update");

        assert_eq!(lines.last().map(String::as_str), Some("restart: slot-a activated (7000 bytes)"));
        let status = session.handle_command("status").expect("status");
        assert_eq!(status[0], "active slot-a next slot-b");
        assert_eq!(status[1], "record seq=2 slot=slot-a len=7000");
    }

    #[test]
    fn second_boot_without_trigger_idles() {
        let (mut session, _dir) = session("idle");

        session.handle_command("stage demo 512").expect("stage");
        session.handle_command("trigger").expect("trigger");
        session.handle_command("boot").expect("first boot");
        let lines = session.handle_command("boot").expect("second boot");

        assert_eq!(
            session.last_decision(),
            Some(BootDecision::Idle(IdleReason::NoTrigger))
        );
        assert_eq!(session.boots(), 2);
        assert_eq!(lines.last().map(String::as_str), Some("heartbeat every 1000ms: .-.-"));
    }

    #[test]
    fn missing_card_idles_with_mount_failure() {
        let dir = scratch_dir("nocard");
        let mut session = Session::new(SessionOptions::new(&dir)).expect("session");

        let lines = session.handle_command("boot").expect("boot");

        assert!(lines.contains(&"idle: mount failed: device-unresponsive".to_string()));
    }

    #[test]
    fn missing_image_consumes_the_trigger() {
        let (mut session, dir) = session("missing");

        session.handle_command("trigger").expect("trigger");
        session.handle_command("boot").expect("boot");

        assert_eq!(
            session.last_decision(),
            Some(BootDecision::Idle(IdleReason::UpdateAborted(
                UpdateError::ImageNotFound
            )))
        );
        assert!(!dir.join("card/boot_cnt").exists());
    }

    #[test]
    fn listing_descends_into_directories() {
        let (mut session, _dir) = session("listing");

        session.handle_command("stage demo 64").expect("stage");
        let lines = session.handle_command("ls").expect("ls");

        assert!(lines.contains(&"d /sdcard/firmware 0".to_string()), "{lines:?}");
        assert!(lines.contains(&"f /sdcard/firmware/update.bin 64".to_string()), "{lines:?}");
    }

    #[test]
    fn unknown_commands_are_reported() {
        let (mut session, _dir) = session("unknown");

        let lines = session.handle_command("flash everything").expect("command");

        assert_eq!(
            lines,
            vec!["ERR syntax unknown command `flash everything` (try `help`)".to_string()]
        );
    }

    #[test]
    fn transcript_records_both_sides() {
        let dir = scratch_dir("transcript");
        let path = dir.join("out.log");
        let options = SessionOptions::new(&dir).with_transcript(path.clone(), "test transcript");
        let mut session = Session::new(options).expect("session");

        session.handle_command("help trigger").expect("help");
        drop(session);

        let text = fs::read_to_string(path).expect("transcript");
        assert!(text.starts_with("# test transcript\n"));
        assert!(text.contains("HOST> help trigger"));
        assert!(text.contains("EMU <   trigger"));
    }
}
