//! Session recording: a timeline of operator input, command output and
//! console notices, stamped relative to the moment recording started.

use crate::error::StoreResult;
use crate::interrupt::Interrupts;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const REPLAY_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Input,
    Output,
    Info,
}

impl EventKind {
    /// Event code in the asciicast stream. Info events are not exported.
    fn cast_code(self) -> Option<&'static str> {
        match self {
            EventKind::Input => Some("i"),
            EventKind::Output => Some("o"),
            EventKind::Info => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Seconds since recording start.
    pub time: f64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: String,
}

/// A stopped recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub engagement: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub width: u16,
    pub height: u16,
    pub events: Vec<RecordedEvent>,
}

impl Recording {
    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Asciicast v2: a JSON header line, then one `[time, code, data]` line
    /// per input or output event.
    pub fn write_asciicast<W: Write>(&self, mut out: W) -> io::Result<()> {
        let header = json!({
            "version": 2,
            "width": self.width,
            "height": self.height,
            "timestamp": self.started_at.timestamp(),
            "env": {
                "SHELL": std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
                "TERM": std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
            },
        });
        writeln!(out, "{header}")?;
        for event in &self.events {
            if let Some(code) = event.kind.cast_code() {
                writeln!(out, "{}", json!([event.time, code, event.data]))?;
            }
        }
        out.flush()
    }

    pub fn write_asciicast_file(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        self.write_asciicast(BufWriter::new(file))
    }
}

struct ActiveRecording {
    engagement: String,
    started: Instant,
    started_at: DateTime<Utc>,
    width: u16,
    height: u16,
    events: Vec<RecordedEvent>,
}

#[derive(Default)]
enum RecorderState {
    #[default]
    Idle,
    Recording(ActiveRecording),
}

/// Idle until started; accumulates events until stopped or abandoned.
#[derive(Default)]
pub struct SessionRecorder {
    state: RecorderState,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Recording(_))
    }

    pub fn event_count(&self) -> usize {
        match &self.state {
            RecorderState::Recording(active) => active.events.len(),
            RecorderState::Idle => 0,
        }
    }

    /// Returns false (and changes nothing) when already recording.
    pub fn start(&mut self, engagement: &str, size: (u16, u16)) -> bool {
        if self.is_recording() {
            warn!(engagement, "recording already in progress");
            return false;
        }
        let (width, height) = size;
        self.state = RecorderState::Recording(ActiveRecording {
            engagement: engagement.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            width,
            height,
            events: Vec::new(),
        });
        self.info(&format!("Recording started for engagement: {engagement}"));
        info!(engagement, "recording started");
        true
    }

    /// Append an event; ignored while idle.
    pub fn record(&mut self, kind: EventKind, data: &str) {
        if let RecorderState::Recording(active) = &mut self.state {
            active.events.push(RecordedEvent {
                time: active.started.elapsed().as_secs_f64(),
                kind,
                data: data.to_string(),
            });
        }
    }

    pub fn info(&mut self, message: &str) {
        self.record(EventKind::Info, message);
    }

    /// Freeze the timeline. `None` when nothing was being recorded.
    pub fn stop(&mut self) -> Option<Recording> {
        match std::mem::take(&mut self.state) {
            RecorderState::Idle => {
                warn!("no recording in progress");
                None
            }
            RecorderState::Recording(active) => {
                let duration_secs = active.started.elapsed().as_secs_f64();
                info!(engagement = %active.engagement, events = active.events.len(), duration_secs, "recording stopped");
                Some(Recording {
                    engagement: active.engagement,
                    started_at: active.started_at,
                    duration_secs,
                    width: active.width,
                    height: active.height,
                    events: active.events,
                })
            }
        }
    }

    /// Drop the current timeline without producing a recording.
    pub fn abandon(&mut self) -> bool {
        let was_recording = self.is_recording();
        self.state = RecorderState::Idle;
        if was_recording {
            info!("recording abandoned");
        }
        was_recording
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Completed,
    Interrupted,
}

pub struct Player<'a> {
    recording: &'a Recording,
    interrupts: Interrupts,
}

impl<'a> Player<'a> {
    pub fn new(recording: &'a Recording, interrupts: Interrupts) -> Self {
        Self {
            recording,
            interrupts,
        }
    }

    /// Hand each event to `emit` once playback time reaches its stamp.
    /// `emit` also receives the playback time at which it fired.
    pub fn play_with<F>(&self, mut emit: F) -> io::Result<PlaybackEnd>
    where
        F: FnMut(&RecordedEvent, f64) -> io::Result<()>,
    {
        let start = Instant::now();
        for event in &self.recording.events {
            loop {
                if self.interrupts.take() > 0 {
                    return Ok(PlaybackEnd::Interrupted);
                }
                if start.elapsed().as_secs_f64() >= event.time {
                    break;
                }
                thread::sleep(REPLAY_STEP);
            }
            emit(event, start.elapsed().as_secs_f64())?;
        }
        Ok(PlaybackEnd::Completed)
    }

    pub fn play<W: Write>(&self, out: &mut W) -> io::Result<PlaybackEnd> {
        let engagement = self.recording.engagement.as_str();
        self.play_with(|event, _| {
            match event.kind {
                EventKind::Input => write!(out, "{engagement}> {}", event.data)?,
                EventKind::Output => write!(out, "{}", event.data)?,
                EventKind::Info => writeln!(out, "{}", format!("[*] {}", event.data).cyan())?,
            }
            out.flush()
        })
    }
}
