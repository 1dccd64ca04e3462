//! End-to-end engine runs against real pseudo-terminal children, with a
//! pipe standing in for the operator's keyboard.

use redterm::classifier::Category;
use redterm::config::EngineSettings;
use redterm::error::ExecFailure;
use redterm::executor::{EngineConfig, PtyEngine};
use redterm::interrupt::Interrupts;
use redterm::recorder::EventKind;
use redterm::session::SessionContext;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::thread;
use std::time::Duration;

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn engine_with(input: &OwnedFd, settings: EngineSettings, interrupts: Interrupts) -> PtyEngine {
    let config = EngineConfig {
        input_fd: input.as_raw_fd(),
        display: false,
        ..EngineConfig::from_settings(&settings)
    };
    PtyEngine::new(config, interrupts)
}

fn context() -> (tempfile::TempDir, SessionContext) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = SessionContext::new("lab", dir.path().to_path_buf()).unwrap();
    (dir, ctx)
}

fn drain_nonblocking(fd: &OwnedFd) -> String {
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    let mut file = File::from(fd.try_clone().unwrap());
    let mut buf = [0u8; 256];
    match file.read(&mut buf) {
        Ok(n) => String::from_utf8_lossy(&buf[..n]).into_owned(),
        Err(_) => String::new(),
    }
}

#[test]
fn batch_command_never_reads_operator_input() {
    let (read_end, write_end) = pipe();
    File::from(write_end.try_clone().unwrap())
        .write_all(b"typed-ahead\n")
        .unwrap();
    let engine = engine_with(&read_end, EngineSettings::default(), Interrupts::new());
    let (_dir, mut ctx) = context();

    let outcome = engine.execute(&mut ctx, "echo done");
    assert!(outcome.success, "{outcome:?}");
    assert!(outcome.output.contains("done"));
    assert!(!outcome.kind.is_interactive());
    assert_eq!(drain_nonblocking(&read_end), "typed-ahead\n");
}

#[test]
fn interactive_command_receives_forwarded_input() {
    let (read_end, write_end) = pipe();
    File::from(write_end).write_all(b"hello\n").unwrap();
    let engine = engine_with(&read_end, EngineSettings::default(), Interrupts::new());
    let (_dir, mut ctx) = context();
    ctx.recorder.start("lab", (80, 24));

    let outcome = engine.execute(&mut ctx, "bash -c 'read line; echo got:$line'");
    assert!(outcome.kind.is_interactive());
    assert!(outcome.success, "{outcome:?}");
    assert!(outcome.output.contains("got:hello"), "{:?}", outcome.output);

    let recording = ctx.recorder.stop().unwrap();
    assert!(recording
        .events
        .iter()
        .any(|e| e.kind == EventKind::Input && e.data == "hello\n"));
    assert!(recording.events.iter().any(|e| e.kind == EventKind::Output));
}

#[test]
fn timeout_terminates_the_child() {
    let (read_end, _write_end) = pipe();
    let mut settings = EngineSettings::default();
    settings.timeouts.insert("sleep".to_string(), 1);
    settings.grace_period_ms = 300;
    let engine = engine_with(&read_end, settings, Interrupts::new());
    let (_dir, mut ctx) = context();

    let outcome = engine.execute(&mut ctx, "sleep 30");
    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(ExecFailure::Timeout { budget_secs: 1 }));
    assert!(outcome.timed_out());
    assert!(outcome.elapsed < Duration::from_secs(10), "{:?}", outcome.elapsed);
}

#[test]
fn interactive_child_ignoring_sigterm_is_killed() {
    let (read_end, _write_end) = pipe();
    let mut settings = EngineSettings::default();
    settings.default_timeout_secs = 1;
    settings.grace_period_ms = 200;
    let engine = engine_with(&read_end, settings, Interrupts::new());
    let (_dir, mut ctx) = context();

    let outcome = engine.execute(&mut ctx, "bash -c 'trap \"\" TERM; read x'");
    assert!(outcome.kind.is_interactive());
    assert!(!outcome.success);
    assert!(outcome.timed_out(), "{outcome:?}");
    // budget + grace + slack
    assert!(outcome.elapsed < Duration::from_millis(1000 + 200 + 3000), "{:?}", outcome.elapsed);
}

#[test]
fn nonzero_exit_is_abnormal() {
    let (read_end, _write_end) = pipe();
    let engine = engine_with(&read_end, EngineSettings::default(), Interrupts::new());
    let (_dir, mut ctx) = context();

    let outcome = engine.execute(&mut ctx, "echo partial; exit 7");
    assert!(!outcome.success);
    assert_eq!(outcome.exit_code, Some(7));
    assert!(matches!(outcome.failure, Some(ExecFailure::AbnormalExit(_))));
    assert!(outcome.output.contains("partial"));
}

#[test]
fn scan_output_feeds_the_highlight_set() {
    let (read_end, _write_end) = pipe();
    let engine = engine_with(&read_end, EngineSettings::default(), Interrupts::new());
    let (_dir, mut ctx) = context();

    let outcome = engine.execute(
        &mut ctx,
        "printf 'Nmap scan report for 10.0.0.1\\nNmap scan report for 10.0.0.2\\nHost 127.0.0.1 is up\\n'",
    );
    assert!(outcome.success, "{outcome:?}");
    assert!(ctx.highlights.contains(Category::Addresses, "10.0.0.1"));
    assert!(ctx.highlights.contains(Category::Addresses, "10.0.0.2"));
    assert!(!ctx.highlights.contains(Category::Addresses, "127.0.0.1"));
}

#[test]
fn child_runs_in_the_session_directory() {
    let (read_end, _write_end) = pipe();
    let engine = engine_with(&read_end, EngineSettings::default(), Interrupts::new());
    let (dir, mut ctx) = context();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

    let outcome = engine.execute(&mut ctx, "ls");
    assert!(outcome.output.contains("marker.txt"), "{:?}", outcome.output);
}

#[test]
fn second_interrupt_reaches_the_child() {
    let (read_end, _write_end) = pipe();
    let interrupts = Interrupts::new();
    let engine = engine_with(&read_end, EngineSettings::default(), interrupts.clone());
    let (_dir, mut ctx) = context();
    ctx.recorder.start("lab", (80, 24));

    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(400));
        interrupts.raise();
        thread::sleep(Duration::from_millis(400));
        interrupts.raise();
    });
    let outcome = engine.execute(&mut ctx, "sleep 5");
    trigger.join().unwrap();

    assert_eq!(outcome.interrupts, 2);
    assert!(!outcome.success);
    assert!(outcome.elapsed < Duration::from_secs(4), "{:?}", outcome.elapsed);

    let recording = ctx.recorder.stop().unwrap();
    let notices = recording
        .events
        .iter()
        .filter(|e| e.kind == EventKind::Info)
        .count();
    // start notice plus one per interrupt
    assert_eq!(notices, 3);
}
