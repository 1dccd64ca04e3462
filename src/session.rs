//! Session context and the per-command flow tying the engine, the
//! classifier, the redactor, the recorder and the audit store together.

use crate::classifier::HighlightSet;
use crate::error::StoreResult;
use crate::executor::{ExecutionOutcome, PtyEngine};
use crate::recorder::{EventKind, SessionRecorder};
use crate::storage::{CommandExecution, ExecutionStatus, RecordingEntry};
use crate::store_manager::{validate_engagement, AuditStore, NewExecution};
use crate::terminal;
use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything that lives across commands of one operator session.
pub struct SessionContext {
    pub engagement: String,
    pub working_dir: PathBuf,
    pub highlights: HighlightSet,
    pub recorder: SessionRecorder,
}

impl SessionContext {
    pub fn new(engagement: &str, working_dir: PathBuf) -> StoreResult<Self> {
        validate_engagement(engagement)?;
        Ok(Self {
            engagement: engagement.to_string(),
            working_dir,
            highlights: HighlightSet::new(),
            recorder: SessionRecorder::new(),
        })
    }

    /// A context whose highlight set starts from what the store already has.
    pub fn open(store: &AuditStore, engagement: &str, working_dir: PathBuf) -> StoreResult<Self> {
        let mut ctx = Self::new(engagement, working_dir)?;
        ctx.highlights = store.load_highlights(engagement)?;
        Ok(ctx)
    }

    /// Resolve `target` against the current directory and move there.
    pub fn change_dir(&mut self, target: &str) -> io::Result<PathBuf> {
        let target = target.trim();
        let resolved = if target.is_empty() || target == "~" {
            dirs::home_dir().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?
        } else if let Some(rest) = target.strip_prefix("~/") {
            dirs::home_dir()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?
                .join(rest)
        } else {
            self.working_dir.join(target)
        };
        let resolved = resolved.canonicalize()?;
        if !resolved.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a directory: {}", resolved.display()),
            ));
        }
        self.working_dir = resolved.clone();
        Ok(resolved)
    }
}

/// What a single `run_command` produced.
#[derive(Debug)]
pub struct CommandReport {
    pub outcome: ExecutionOutcome,
    pub execution: CommandExecution,
    pub new_highlights: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDecision {
    NotRecording,
    KeepRecording,
    Abandoned,
}

pub struct Session<'a> {
    store: &'a AuditStore,
    engine: PtyEngine,
    export_cast: bool,
}

impl<'a> Session<'a> {
    pub fn new(store: &'a AuditStore, engine: PtyEngine, export_cast: bool) -> Self {
        Self {
            store,
            engine,
            export_cast,
        }
    }

    pub fn store(&self) -> &AuditStore {
        self.store
    }

    pub fn engine(&self) -> &PtyEngine {
        &self.engine
    }

    /// Execute, classify, redact and log one command.
    ///
    /// Engine failures are part of the report; only failing to write the
    /// execution record is an error.
    pub fn run_command(&self, ctx: &mut SessionContext, command: &str) -> StoreResult<CommandReport> {
        ctx.recorder.record(EventKind::Input, &format!("{command}\n"));
        let before = ctx.highlights.len();

        let outcome = self.engine.execute(ctx, command);
        if let Some(failure) = &outcome.failure {
            ctx.recorder.info(&format!("Command failed: {failure}"));
        }
        let new_highlights = ctx.highlights.len().saturating_sub(before);
        if new_highlights > 0 {
            self.flush_highlights(ctx);
        }

        let execution = self.store.append_execution(NewExecution {
            engagement: ctx.engagement.clone(),
            command: command.to_string(),
            raw_output: outcome.output.clone(),
            started_at: outcome.started_at,
            working_dir: ctx.working_dir.clone(),
            duration: outcome.elapsed,
            status: if outcome.success {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Error
            },
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out(),
        })?;

        Ok(CommandReport {
            outcome,
            execution,
            new_highlights,
        })
    }

    /// `cd`: changes the session directory and logs the attempt.
    pub fn change_dir(&self, ctx: &mut SessionContext, target: &str) -> StoreResult<CommandExecution> {
        let started_at = Utc::now();
        let started = Instant::now();
        let command = format!("cd {}", target.trim()).trim_end().to_string();
        ctx.recorder.record(EventKind::Input, &format!("{command}\n"));

        let (status, output) = match ctx.change_dir(target) {
            Ok(dir) => {
                debug!(dir = %dir.display(), "working directory changed");
                (ExecutionStatus::Success, String::new())
            }
            Err(e) => {
                let message = format!("cd: {}: {e}\n", target.trim());
                ctx.recorder.record(EventKind::Output, &message);
                (ExecutionStatus::Error, message)
            }
        };

        self.store.append_execution(NewExecution {
            engagement: ctx.engagement.clone(),
            command,
            raw_output: output,
            started_at,
            working_dir: ctx.working_dir.clone(),
            duration: started.elapsed(),
            status,
            exit_code: None,
            timed_out: false,
        })
    }

    /// Persist the highlight set. Errors are logged, not returned.
    pub fn flush_highlights(&self, ctx: &SessionContext) -> usize {
        match self.store.save_highlights(&ctx.engagement, &ctx.highlights) {
            Ok(added) => added,
            Err(e) => {
                warn!(engagement = %ctx.engagement, error = %e, "failed to save highlights");
                0
            }
        }
    }

    /// Flush the current engagement and continue in `engagement`.
    pub fn switch_engagement(&self, ctx: &mut SessionContext, engagement: &str) -> StoreResult<()> {
        validate_engagement(engagement)?;
        self.flush_highlights(ctx);
        ctx.highlights = self.store.load_highlights(engagement)?;
        ctx.engagement = engagement.to_string();
        info!(engagement, "switched engagement");
        Ok(())
    }

    pub fn start_recording(&self, ctx: &mut SessionContext) -> bool {
        let engagement = ctx.engagement.clone();
        ctx.recorder.start(&engagement, terminal::size())
    }

    /// Stop and persist the recording. Save failures are logged and the
    /// recording is lost.
    pub fn stop_recording(&self, ctx: &mut SessionContext) -> Option<RecordingEntry> {
        let recording = ctx.recorder.stop()?;
        match self.store.save_recording(&recording, self.export_cast) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(engagement = %recording.engagement, error = %e, "failed to save recording");
                None
            }
        }
    }

    /// An interrupt arrived between commands. A running recording is only
    /// discarded when `confirm` says so.
    pub fn handle_interrupt<F>(&self, ctx: &mut SessionContext, confirm: F) -> InterruptDecision
    where
        F: FnOnce() -> bool,
    {
        if !ctx.recorder.is_recording() {
            return InterruptDecision::NotRecording;
        }
        if confirm() {
            ctx.recorder.abandon();
            InterruptDecision::Abandoned
        } else {
            ctx.recorder.info("Interrupt received; recording continues");
            InterruptDecision::KeepRecording
        }
    }

    /// Session exit checkpoint.
    pub fn finish(&self, ctx: &mut SessionContext) -> Option<RecordingEntry> {
        self.flush_highlights(ctx);
        if ctx.recorder.is_recording() {
            self.stop_recording(ctx)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Category;
    use crate::executor::EngineConfig;
    use crate::interrupt::Interrupts;
    use crate::store_manager::ExecutionQuery;

    fn quiet_engine() -> PtyEngine {
        let config = EngineConfig {
            display: false,
            ..EngineConfig::default()
        };
        PtyEngine::new(config, Interrupts::new())
    }

    fn setup() -> (tempfile::TempDir, AuditStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AuditStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn context_rejects_bad_engagement_names() {
        assert!(SessionContext::new("../x", PathBuf::from("/")).is_err());
        assert!(SessionContext::new("lab", PathBuf::from("/")).is_ok());
    }

    #[test]
    fn command_is_logged_with_highlights() {
        let (dir, store) = setup();
        let session = Session::new(&store, quiet_engine(), false);
        let mut ctx = SessionContext::new("lab", dir.path().to_path_buf()).unwrap();

        let report = session
            .run_command(&mut ctx, "echo 'Nmap scan report for 10.0.0.7'; echo 127.0.0.1")
            .unwrap();
        assert!(report.outcome.success);
        assert_eq!(report.execution.record.status, ExecutionStatus::Success);
        assert_eq!(report.execution.record.exit_code, Some(0));
        assert!(ctx.highlights.contains(Category::Addresses, "10.0.0.7"));
        assert!(!ctx.highlights.contains(Category::Addresses, "127.0.0.1"));

        let stored = store.load_highlights("lab").unwrap();
        assert!(stored.contains(Category::Addresses, "10.0.0.7"));
        assert_eq!(store.records("lab").unwrap().len(), 1);
    }

    #[test]
    fn failing_command_is_still_logged() {
        let (dir, store) = setup();
        let session = Session::new(&store, quiet_engine(), false);
        let mut ctx = SessionContext::new("lab", dir.path().to_path_buf()).unwrap();

        let report = session.run_command(&mut ctx, "echo token=abc; exit 3").unwrap();
        assert!(!report.outcome.success);
        assert_eq!(report.execution.record.status, ExecutionStatus::Error);
        assert_eq!(report.execution.record.exit_code, Some(3));
        assert!(report.execution.raw_output.contains("token=abc"));
        assert!(!report.execution.redacted_output.contains("abc"));
    }

    #[test]
    fn cd_moves_the_session_and_is_logged() {
        let (dir, store) = setup();
        let target = dir.path().join("loot");
        std::fs::create_dir(&target).unwrap();
        let session = Session::new(&store, quiet_engine(), false);
        let mut ctx = SessionContext::new("lab", dir.path().to_path_buf()).unwrap();

        let ok = session.change_dir(&mut ctx, "loot").unwrap();
        assert_eq!(ok.record.status, ExecutionStatus::Success);
        assert_eq!(ctx.working_dir, target.canonicalize().unwrap());

        let missing = session.change_dir(&mut ctx, "nowhere").unwrap();
        assert_eq!(missing.record.status, ExecutionStatus::Error);
        assert_eq!(ctx.working_dir, target.canonicalize().unwrap());

        let report = session.run_command(&mut ctx, "pwd").unwrap();
        assert!(report.outcome.output.contains("loot"));

        let latest = store.query("lab", &ExecutionQuery::latest(3)).unwrap();
        let commands: Vec<_> = latest.iter().map(|e| e.record.command.as_str()).collect();
        assert_eq!(commands, vec!["pwd", "cd nowhere", "cd loot"]);
    }

    #[test]
    fn interrupt_only_abandons_on_confirmation() {
        let (dir, store) = setup();
        let session = Session::new(&store, quiet_engine(), false);
        let mut ctx = SessionContext::new("lab", dir.path().to_path_buf()).unwrap();

        assert_eq!(session.handle_interrupt(&mut ctx, || true), InterruptDecision::NotRecording);

        session.start_recording(&mut ctx);
        assert_eq!(session.handle_interrupt(&mut ctx, || false), InterruptDecision::KeepRecording);
        assert!(ctx.recorder.is_recording());
        assert_eq!(session.handle_interrupt(&mut ctx, || true), InterruptDecision::Abandoned);
        assert!(!ctx.recorder.is_recording());
        assert!(store.recordings("lab").unwrap().is_empty());
    }

    #[test]
    fn recording_is_saved_on_finish() {
        let (dir, store) = setup();
        let session = Session::new(&store, quiet_engine(), true);
        let mut ctx = SessionContext::new("lab", dir.path().to_path_buf()).unwrap();

        assert!(session.start_recording(&mut ctx));
        session.run_command(&mut ctx, "echo recorded").unwrap();
        let entry = session.finish(&mut ctx).unwrap();

        assert!(entry.path.exists());
        assert!(entry.cast_path.as_ref().is_some_and(|p| p.exists()));
        let recording = store.load_recording("lab", entry.id).unwrap();
        assert!(recording.events.iter().any(|e| e.kind == EventKind::Input && e.data == "echo recorded\n"));
        assert!(recording.events.iter().any(|e| e.kind == EventKind::Output && e.data.contains("recorded")));
        assert!(session.finish(&mut ctx).is_none());
    }

    #[test]
    fn switching_engagement_flushes_and_reloads() {
        let (dir, store) = setup();
        let session = Session::new(&store, quiet_engine(), false);
        let mut ctx = SessionContext::new("alpha", dir.path().to_path_buf()).unwrap();
        ctx.highlights.insert(Category::Domains, "corp.local");

        session.switch_engagement(&mut ctx, "beta").unwrap();
        assert_eq!(ctx.engagement, "beta");
        assert!(ctx.highlights.is_empty());
        assert!(store.load_highlights("alpha").unwrap().contains(Category::Domains, "corp.local"));
        assert!(session.switch_engagement(&mut ctx, ".bad").is_err());
        assert_eq!(ctx.engagement, "beta");
    }
}
