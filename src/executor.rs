//! PTY execution engine.
//!
//! Runs `<shell> -c <command>` on a fresh pseudo-terminal and multiplexes
//! its output (and, for interactive commands, the operator's keystrokes)
//! through a chain of [`ChunkSink`] stages until the child exits.

use crate::classifier::{HighlightSet, PatternTable};
use crate::command_kind::{CommandClassifier, CommandKind};
use crate::config::EngineSettings;
use crate::error::ExecFailure;
use crate::interrupt::Interrupts;
use crate::recorder::{EventKind, SessionRecorder};
use crate::session::SessionContext;
use crate::terminal::{self, RawModeGuard};
use chrono::{DateTime, Utc};
use colored::Colorize;
use portable_pty::{
    native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ETX: u8 = 0x03;
const DRAIN_WAIT: Duration = Duration::from_millis(10);
const TERMINATE_STEP: Duration = Duration::from_millis(50);

pub const INTERRUPT_NOTICE: &str =
    "Interrupt received; the command keeps running. Press Ctrl+C again to send it to the command.";
pub const INTERRUPT_FORWARDED: &str = "Interrupt forwarded to the command.";

/// Per-command timeout budgets keyed by command substrings.
#[derive(Debug, Clone)]
pub struct TimeoutTable {
    entries: Vec<(String, Duration)>,
    default: Duration,
}

impl TimeoutTable {
    pub fn new(table: &BTreeMap<String, u64>, default_secs: u64) -> Self {
        let entries = table
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, secs)| (key.to_lowercase(), Duration::from_secs(*secs)))
            .collect();
        Self {
            entries,
            default: Duration::from_secs(default_secs),
        }
    }

    /// Budget of the longest key contained in the lower-cased command.
    pub fn budget_for(&self, command: &str) -> Duration {
        let lower = command.to_lowercase();
        self.entries
            .iter()
            .filter(|(key, _)| lower.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, budget)| *budget)
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub shell: String,
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub read_chunk_size: usize,
    pub timeouts: TimeoutTable,
    pub classifier: CommandClassifier,
    /// Operator input; a pipe in tests.
    pub input_fd: RawFd,
    /// Echo child output to stdout.
    pub display: bool,
    /// Switches the operator terminal for interactive commands.
    pub raw_mode: fn(RawFd) -> RawModeGuard,
}

impl EngineConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            shell: settings.shell.clone(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            grace_period: Duration::from_millis(settings.grace_period_ms),
            read_chunk_size: settings.read_chunk_size.max(1),
            timeouts: TimeoutTable::new(&settings.timeouts, settings.default_timeout_secs),
            classifier: CommandClassifier::new(&settings.interactive_programs),
            input_fd: libc::STDIN_FILENO,
            display: true,
            raw_mode: RawModeGuard::for_input,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

/// Result of one engine run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub output: String,
    pub exit_code: Option<u32>,
    pub failure: Option<ExecFailure>,
    pub kind: CommandKind,
    /// Interrupts received while the command ran.
    pub interrupts: usize,
}

impl ExecutionOutcome {
    fn failed(kind: CommandKind, started_at: DateTime<Utc>, failure: ExecFailure) -> Self {
        Self {
            success: false,
            started_at,
            elapsed: Duration::ZERO,
            output: String::new(),
            exit_code: None,
            failure: Some(failure),
            kind,
            interrupts: 0,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.failure.as_ref().is_some_and(ExecFailure::is_timeout)
    }
}

/// Incremental UTF-8 decoding: a multibyte sequence split across reads is
/// held back until the rest arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        // Incomplete tail: keep it for the next read
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Whatever is still held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// A consumer stage of the engine's chunk pipeline.
pub trait ChunkSink {
    fn on_output(&mut self, chunk: &str);
    fn on_input(&mut self, chunk: &str);
    fn on_notice(&mut self, _message: &str) {}
}

/// Writes child output to the operator's terminal.
pub struct DisplaySink<W: Write> {
    out: W,
}

impl<W: Write> DisplaySink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> ChunkSink for DisplaySink<W> {
    fn on_output(&mut self, chunk: &str) {
        let _ = self.out.write_all(chunk.as_bytes());
        let _ = self.out.flush();
    }

    // The pty echoes input itself
    fn on_input(&mut self, _chunk: &str) {}

    fn on_notice(&mut self, message: &str) {
        eprintln!("\r\n{}\r", message.yellow());
    }
}

#[derive(Debug, Default)]
pub struct Accumulator {
    text: String,
}

impl Accumulator {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

impl ChunkSink for Accumulator {
    fn on_output(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    fn on_input(&mut self, _chunk: &str) {}
}

/// Feeds every output chunk to the pattern classifier.
pub struct ClassifierSink<'a> {
    table: &'a PatternTable,
    highlights: &'a mut HighlightSet,
    added: usize,
}

impl<'a> ClassifierSink<'a> {
    pub fn new(table: &'a PatternTable, highlights: &'a mut HighlightSet) -> Self {
        Self {
            table,
            highlights,
            added: 0,
        }
    }

    pub fn added(&self) -> usize {
        self.added
    }
}

impl ChunkSink for ClassifierSink<'_> {
    fn on_output(&mut self, chunk: &str) {
        self.added += self.table.classify_into(chunk, self.highlights);
    }

    fn on_input(&mut self, _chunk: &str) {}
}

pub struct RecorderSink<'a> {
    recorder: &'a mut SessionRecorder,
}

impl<'a> RecorderSink<'a> {
    pub fn new(recorder: &'a mut SessionRecorder) -> Self {
        Self { recorder }
    }
}

impl ChunkSink for RecorderSink<'_> {
    fn on_output(&mut self, chunk: &str) {
        self.recorder.record(EventKind::Output, chunk);
    }

    fn on_input(&mut self, chunk: &str) {
        self.recorder.record(EventKind::Input, chunk);
    }

    fn on_notice(&mut self, message: &str) {
        self.recorder.info(message);
    }
}

/// Sinks in registration order.
pub struct Pipeline<'s> {
    stages: Vec<&'s mut dyn ChunkSink>,
}

impl<'s> Pipeline<'s> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn push(&mut self, stage: &'s mut dyn ChunkSink) {
        self.stages.push(stage);
    }

    pub fn output(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        for stage in self.stages.iter_mut() {
            stage.on_output(chunk);
        }
    }

    pub fn input(&mut self, chunk: &str) {
        for stage in self.stages.iter_mut() {
            stage.on_input(chunk);
        }
    }

    pub fn notice(&mut self, message: &str) {
        for stage in self.stages.iter_mut() {
            stage.on_notice(message);
        }
    }
}

impl Default for Pipeline<'_> {
    fn default() -> Self {
        Self::new()
    }
}

struct Running {
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    master_fd: RawFd,
    // Closing the master hangs up the child's terminal
    _master: Box<dyn MasterPty + Send>,
}

enum LoopEnd {
    Exited(ExitStatus),
    TimedOut,
    Failed(ExecFailure, Option<ExitStatus>),
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) output: bool,
    pub(crate) input: bool,
    pub(crate) input_gone: bool,
}

fn is_eio(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

fn ready_flags(revents: libc::c_short) -> bool {
    revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

/// Wait up to `timeout` for the given descriptors to become readable.
pub(crate) fn poll_readable(output_fd: Option<RawFd>, input_fd: Option<RawFd>, timeout: Duration) -> io::Result<Readiness> {
    let mut fds: Vec<libc::pollfd> = [output_fd, input_fd]
        .into_iter()
        .flatten()
        .map(|fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    if fds.is_empty() {
        thread::sleep(timeout);
        return Ok(Readiness::default());
    }

    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `fds` is a valid, initialised pollfd array of the given length.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::default());
        }
        return Err(err);
    }

    let mut readiness = Readiness::default();
    let mut slots = fds.iter();
    if output_fd.is_some() {
        if let Some(pfd) = slots.next() {
            readiness.output = ready_flags(pfd.revents) || pfd.revents & libc::POLLNVAL != 0;
        }
    }
    if input_fd.is_some() {
        if let Some(pfd) = slots.next() {
            readiness.input = ready_flags(pfd.revents);
            readiness.input_gone = pfd.revents & libc::POLLNVAL != 0;
        }
    }
    Ok(readiness)
}

pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    // SAFETY: plain kill(2); the child leads its own process group.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        // SAFETY: as above, for the single process.
        unsafe { libc::kill(pid, signal) };
    }
}

pub struct PtyEngine {
    config: EngineConfig,
    interrupts: Interrupts,
}

impl PtyEngine {
    pub fn new(config: EngineConfig, interrupts: Interrupts) -> Self {
        Self { config, interrupts }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classify(&self, command: &str) -> CommandKind {
        self.config.classifier.classify(command)
    }

    /// Run `command` in the context's working directory.
    ///
    /// Every chunk of output is displayed, accumulated, classified into the
    /// context's highlights and recorded. Failures end up in the outcome.
    pub fn execute(&self, ctx: &mut SessionContext, command: &str) -> ExecutionOutcome {
        let kind = self.classify(command);
        let budget = self.config.timeouts.budget_for(command);
        let started_at = Utc::now();
        let started = Instant::now();
        info!(command, ?kind, budget_secs = budget.as_secs(), "executing");

        let mut running = match self.spawn(ctx, command) {
            Ok(running) => running,
            Err(failure) => {
                warn!(command, error = %failure, "could not start command");
                let mut outcome = ExecutionOutcome::failed(kind, started_at, failure);
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        };

        // Drain pending signals from before the command started
        self.interrupts.take();
        let raw_mode = if kind.is_interactive() {
            (self.config.raw_mode)(self.config.input_fd)
        } else {
            RawModeGuard::inert()
        };

        let SessionContext {
            highlights,
            recorder,
            ..
        } = &mut *ctx;

        let mut display = DisplaySink::new(io::stdout());
        let mut accumulator = Accumulator::default();
        let mut classifier = ClassifierSink::new(PatternTable::builtin(), highlights);
        let mut recording = RecorderSink::new(recorder);
        let mut interrupts_seen = 0;

        let end = {
            let mut pipeline = Pipeline::new();
            if self.config.display {
                pipeline.push(&mut display);
            }
            pipeline.push(&mut accumulator);
            pipeline.push(&mut classifier);
            pipeline.push(&mut recording);
            self.pump(&mut running, kind, budget, started, &mut pipeline, &mut interrupts_seen)
        };
        let streamed = classifier.added();

        let (success, exit_code, failure) = match end {
            LoopEnd::Exited(status) => {
                if status.success() {
                    (true, Some(status.exit_code()), None)
                } else {
                    let code = status.exit_code();
                    (false, Some(code), Some(ExecFailure::AbnormalExit(format!("exit code {code}"))))
                }
            }
            LoopEnd::TimedOut => {
                warn!(command, budget_secs = budget.as_secs(), "timeout exceeded, terminating");
                self.terminate(running.child.as_mut());
                (
                    false,
                    None,
                    Some(ExecFailure::Timeout {
                        budget_secs: budget.as_secs(),
                    }),
                )
            }
            LoopEnd::Failed(failure, status) => {
                warn!(command, error = %failure, "terminal i/o failed");
                let status = status.or_else(|| self.terminate(running.child.as_mut()));
                (false, status.map(|s| s.exit_code()), Some(failure))
            }
        };
        drop(raw_mode);

        let output = accumulator.into_text();
        // Findings split across two reads only show up in the whole text
        let late = PatternTable::builtin().classify_into(&output, &mut ctx.highlights);
        let elapsed = started.elapsed();
        debug!(
            command,
            success,
            ?exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            highlights = streamed + late,
            "execution finished"
        );

        ExecutionOutcome {
            success,
            started_at,
            elapsed,
            output,
            exit_code,
            failure,
            kind,
            interrupts: interrupts_seen,
        }
    }

    fn spawn(&self, ctx: &SessionContext, command: &str) -> Result<Running, ExecFailure> {
        let (cols, rows) = terminal::size();
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ExecFailure::PtyAllocationFailed(e.to_string()))?;

        let mut builder = CommandBuilder::new(&self.config.shell);
        builder.arg("-c");
        builder.arg(command);
        builder.cwd(&ctx.working_dir);

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| ExecFailure::SpawnFailed(e.to_string()))?;
        // Only the child may hold the slave, or EOF never arrives
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ExecFailure::PtyAllocationFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ExecFailure::PtyAllocationFailed(e.to_string()))?;
        let master_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| ExecFailure::PtyAllocationFailed("pty master has no descriptor".into()))?;
        debug!(pid = ?child.process_id(), master_fd, "child spawned");

        Ok(Running {
            child,
            reader,
            writer,
            master_fd,
            _master: pair.master,
        })
    }

    fn pump(
        &self,
        running: &mut Running,
        kind: CommandKind,
        budget: Duration,
        started: Instant,
        pipeline: &mut Pipeline,
        interrupts_seen: &mut usize,
    ) -> LoopEnd {
        let mut decoder = Utf8Decoder::default();
        let mut buf = vec![0u8; self.config.read_chunk_size];
        let mut status: Option<ExitStatus> = None;
        let mut output_open = true;
        // Batch commands never see operator input
        let mut input_open = kind.is_interactive();

        loop {
            if started.elapsed() >= budget {
                pipeline.output(&decoder.finish());
                return LoopEnd::TimedOut;
            }

            if status.is_none() {
                match running.child.try_wait() {
                    Ok(Some(exit)) => {
                        debug!(code = exit.exit_code(), "child exited");
                        status = Some(exit);
                    }
                    Ok(None) => {}
                    Err(e) => return LoopEnd::Failed(ExecFailure::Io(e.to_string()), None),
                }
            }

            if let Some(exit) = status.take() {
                if output_open {
                    if let Err(e) = self.drain(running, &mut decoder, &mut buf, pipeline) {
                        return LoopEnd::Failed(ExecFailure::Io(e.to_string()), Some(exit));
                    }
                }
                pipeline.output(&decoder.finish());
                return LoopEnd::Exited(exit);
            }

            if let Err(e) = self.handle_interrupts(running, pipeline, interrupts_seen) {
                return LoopEnd::Failed(ExecFailure::Io(e.to_string()), None);
            }

            let ready = match poll_readable(
                output_open.then_some(running.master_fd),
                input_open.then_some(self.config.input_fd),
                self.config.poll_interval,
            ) {
                Ok(ready) => ready,
                Err(e) => return LoopEnd::Failed(ExecFailure::Io(e.to_string()), None),
            };

            if ready.output {
                match running.reader.read(&mut buf) {
                    Ok(0) => {
                        debug!("pty output closed");
                        output_open = false;
                    }
                    Ok(n) => pipeline.output(&decoder.decode(&buf[..n])),
                    Err(e) if is_eio(&e) => {
                        debug!("pty output closed");
                        output_open = false;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return LoopEnd::Failed(ExecFailure::Io(e.to_string()), None),
                }
            }

            if ready.input_gone {
                input_open = false;
            } else if ready.input {
                match read_fd(self.config.input_fd, &mut buf) {
                    Ok(0) => {
                        debug!("operator input closed");
                        input_open = false;
                    }
                    Ok(n) => {
                        let forwarded = running
                            .writer
                            .write_all(&buf[..n])
                            .and_then(|()| running.writer.flush());
                        if let Err(e) = forwarded {
                            return LoopEnd::Failed(ExecFailure::Io(e.to_string()), None);
                        }
                        pipeline.input(&String::from_utf8_lossy(&buf[..n]));
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                        ) => {}
                    Err(e) => return LoopEnd::Failed(ExecFailure::Io(e.to_string()), None),
                }
            }
        }
    }

    /// Read what the child left in the pty after exiting.
    fn drain(
        &self,
        running: &mut Running,
        decoder: &mut Utf8Decoder,
        buf: &mut [u8],
        pipeline: &mut Pipeline,
    ) -> io::Result<()> {
        loop {
            let ready = poll_readable(Some(running.master_fd), None, DRAIN_WAIT)?;
            if !ready.output {
                return Ok(());
            }
            match running.reader.read(buf) {
                Ok(0) => return Ok(()),
                Ok(n) => pipeline.output(&decoder.decode(&buf[..n])),
                Err(e) if is_eio(&e) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// First Ctrl+C only informs the operator; later ones reach the child.
    fn handle_interrupts(
        &self,
        running: &mut Running,
        pipeline: &mut Pipeline,
        seen: &mut usize,
    ) -> io::Result<()> {
        for _ in 0..self.interrupts.take() {
            *seen += 1;
            if *seen == 1 {
                pipeline.notice(INTERRUPT_NOTICE);
            } else {
                running.writer.write_all(&[ETX])?;
                running.writer.flush()?;
                pipeline.notice(INTERRUPT_FORWARDED);
            }
        }
        Ok(())
    }

    /// SIGTERM the child's process group, then SIGKILL after the grace period.
    fn terminate(&self, child: &mut (dyn Child + Send + Sync)) -> Option<ExitStatus> {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        let pid = child.process_id();
        match pid {
            Some(pid) => signal_group(pid, libc::SIGTERM),
            None => {
                let _ = child.kill();
            }
        }

        let deadline = Instant::now() + self.config.grace_period;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                debug!("child exited after SIGTERM");
                return Some(status);
            }
            thread::sleep(TERMINATE_STEP.min(self.config.poll_interval));
        }

        warn!(?pid, "grace period elapsed, killing");
        match pid {
            Some(pid) => signal_group(pid, libc::SIGKILL),
            None => {
                let _ = child.kill();
            }
        }
        child.wait().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn longest_timeout_key_wins() {
        let table = TimeoutTable::new(&EngineSettings::default().timeouts, 60);
        assert_eq!(table.budget_for("nmap -p- 10.0.0.5"), Duration::from_secs(7200));
        assert_eq!(table.budget_for("DIRBUSTER -u http://x"), Duration::from_secs(1800));
        assert_eq!(table.budget_for("gobuster dir -u http://x"), Duration::from_secs(3600));
        assert_eq!(table.budget_for("ls -la"), Duration::from_secs(60));
    }

    #[test]
    fn overlapping_keys_prefer_the_longer_one() {
        let mut map = BTreeMap::new();
        map.insert("map".to_string(), 5);
        map.insert("nmap".to_string(), 10);
        map.insert("sqlmap".to_string(), 20);
        let table = TimeoutTable::new(&map, 1);
        assert_eq!(table.budget_for("sqlmap -u x"), Duration::from_secs(20));
        assert_eq!(table.budget_for("nmap x"), Duration::from_secs(10));
        assert_eq!(table.budget_for("heatmap"), Duration::from_secs(5));
    }

    #[test]
    fn decoder_carries_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "héllo→".as_bytes();
        let (a, b) = bytes.split_at(2); // inside "é"
        let mut text = decoder.decode(a);
        text.push_str(&decoder.decode(b));
        assert_eq!(text, "héllo→");
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(&[0xe2, 0x86]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[derive(Default)]
    struct Trace(Vec<String>);

    impl ChunkSink for Trace {
        fn on_output(&mut self, chunk: &str) {
            self.0.push(format!("o:{chunk}"));
        }
        fn on_input(&mut self, chunk: &str) {
            self.0.push(format!("i:{chunk}"));
        }
        fn on_notice(&mut self, message: &str) {
            self.0.push(format!("n:{message}"));
        }
    }

    #[test]
    fn pipeline_preserves_order() {
        let mut trace = Trace::default();
        let mut acc = Accumulator::default();
        {
            let mut pipeline = Pipeline::new();
            pipeline.push(&mut trace);
            pipeline.push(&mut acc);
            pipeline.output("a");
            pipeline.input("b");
            pipeline.output("");
            pipeline.notice("c");
            pipeline.output("d");
        }
        assert_eq!(trace.0, vec!["o:a", "i:b", "n:c", "o:d"]);
        assert_eq!(acc.text(), "ad");
    }

    #[test]
    fn classifier_and_recorder_sinks() {
        let mut highlights = HighlightSet::new();
        let mut recorder = SessionRecorder::new();
        recorder.start("lab", (80, 24));
        {
            let mut classifier = ClassifierSink::new(PatternTable::builtin(), &mut highlights);
            classifier.on_output("Nmap scan report for 10.10.10.3\n");
            assert_eq!(classifier.added(), 1);
            let mut rec = RecorderSink::new(&mut recorder);
            rec.on_input("id\n");
            rec.on_output("uid=0\n");
        }
        assert!(highlights.contains(crate::classifier::Category::Addresses, "10.10.10.3"));
        let recording = recorder.stop().unwrap();
        let kinds: Vec<_> = recording.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Info, EventKind::Input, EventKind::Output]);
    }

    static GUARDS_TAKEN: AtomicUsize = AtomicUsize::new(0);
    static GUARDS_RELEASED: AtomicUsize = AtomicUsize::new(0);

    fn counting_guard(_fd: RawFd) -> RawModeGuard {
        GUARDS_TAKEN.fetch_add(1, Ordering::SeqCst);
        RawModeGuard::with_restore(|| {
            GUARDS_RELEASED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn raw_mode_is_released_after_a_timeout_kill() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_end, write_end] = fds;

        let mut settings = EngineSettings::default();
        settings.default_timeout_secs = 1;
        settings.grace_period_ms = 200;
        let config = EngineConfig {
            input_fd: read_end,
            display: false,
            raw_mode: counting_guard,
            ..EngineConfig::from_settings(&settings)
        };
        let engine = PtyEngine::new(config, Interrupts::new());
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = SessionContext::new("lab", dir.path().to_path_buf()).unwrap();

        let outcome = engine.execute(&mut ctx, "bash -c 'trap \"\" TERM; read x'");
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }

        assert!(outcome.kind.is_interactive());
        assert!(outcome.timed_out(), "{outcome:?}");
        assert_eq!(GUARDS_TAKEN.load(Ordering::SeqCst), 1);
        assert_eq!(GUARDS_RELEASED.load(Ordering::SeqCst), 1);
    }
}
