use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::io::{self, Write};
use std::path::PathBuf;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use redterm::classifier::{Category, HighlightSet, PatternTable};
use redterm::config::Config;
use redterm::executor::{EngineConfig, PtyEngine};
use redterm::i18n::I18n;
use redterm::interrupt::Interrupts;
use redterm::logging;
use redterm::recorder::{PlaybackEnd, Player};
use redterm::session::{CommandReport, InterruptDecision, Session, SessionContext};
use redterm::storage::{CommandExecution, ExecutionStatus, OutputView};
use redterm::store_manager::{validate_engagement, AuditStore, ExecutionQuery, SearchScope};
use redterm::terminal::{LineReader, PromptInput};

const DEFAULT_ENGAGEMENT: &str = "default";
const COMMAND_COLUMN: usize = 60;

#[derive(Parser)]
#[command(name = "redterm", version)]
#[command(about = "Operator console that records, classifies and redacts shell commands")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command inside an engagement
    Run {
        /// Command to execute (wrap commands with pipes in quotes)
        #[arg(required = true)]
        command: String,
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
        /// Record the session while the command runs
        #[arg(long)]
        record: bool,
    },
    /// Interactive line loop
    Shell {
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
        #[arg(long)]
        record: bool,
    },
    /// Show the most recent records
    Log {
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
        /// Number of records [default: display.log_limit]
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Show raw output instead of the redacted copy
        #[arg(long)]
        raw: bool,
    },
    /// Search commands, output or tags
    Search {
        query: String,
        #[arg(long, value_enum, default_value_t = SearchScope::All)]
        scope: SearchScope,
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
    },
    /// Tag the most recent record
    Tag {
        #[arg(required = true)]
        tags: Vec<String>,
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
    },
    /// Show extracted findings
    Highlights {
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
        #[arg(long)]
        category: Option<Category>,
    },
    /// Extract findings from a file into the engagement's highlights
    Extract {
        file: PathBuf,
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
    },
    /// List engagements
    Engagements,
    /// Engagement statistics
    Status {
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
    },
    /// Session recordings
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Delete all data of an engagement
    Clean { engagement: String },
}

#[derive(Subcommand)]
enum RecordAction {
    /// List recordings
    List {
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
    },
    /// Replay a recording at its original pace
    Play {
        id: u64,
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
    },
    /// Export a recording as asciicast v2
    Export {
        id: u64,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, default_value = DEFAULT_ENGAGEMENT)]
        engagement: String,
    },
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = Config::new().context("failed to load configuration")?;
    logging::init_logging(&config.logging.level);
    let i18n = I18n::new(&config.get_effective_language());

    if args.len() == 1 {
        print_help(&i18n);
        return Ok(());
    }

    let cli = Cli::parse();
    let store = AuditStore::open(config.store_dir()).with_context(|| i18n.t("error_open_store"))?;

    match cli.command {
        Commands::Run {
            command,
            engagement,
            record,
        } => {
            let session = build_session(&store, &config);
            let mut ctx = open_context(&store, &engagement, &i18n)?;
            if record && session.start_recording(&mut ctx) {
                println!("{}", i18n.t_format("recording_started", &[&engagement]).cyan());
            }
            let report = session.run_command(&mut ctx, &command);
            // Checkpoint even when logging failed
            let saved = session.finish(&mut ctx);
            let report = report.with_context(|| i18n.t("error_save_execution"))?;
            print_report(&report, &config, &i18n);
            if let Some(entry) = saved {
                print_recording_entry(&entry, &i18n);
            }
        }
        Commands::Shell { engagement, record } => {
            let session = build_session(&store, &config);
            let mut ctx = open_context(&store, &engagement, &i18n)?;
            if record && session.start_recording(&mut ctx) {
                println!("{}", i18n.t_format("recording_started", &[&engagement]).cyan());
            }
            run_shell(&session, &mut ctx, &config, &i18n)?;
        }
        Commands::Log {
            engagement,
            limit,
            raw,
        } => {
            let limit = limit.unwrap_or(config.display.log_limit);
            let executions = store
                .query(&engagement, &ExecutionQuery::latest(limit))
                .with_context(|| i18n.t("error_query"))?;
            if executions.is_empty() {
                println!("{}", i18n.t("no_records").yellow());
            }
            let view = if raw { OutputView::Raw } else { OutputView::Redacted };
            // Oldest first so the newest ends up next to the prompt
            for execution in executions.iter().rev() {
                print_execution(execution, view);
            }
        }
        Commands::Search {
            query,
            scope,
            engagement,
        } => {
            let results = store
                .query(&engagement, &ExecutionQuery::search(query.clone(), scope))
                .with_context(|| i18n.t("error_query"))?;
            if results.is_empty() {
                println!("{}", i18n.t_format("no_results", &[&query]).yellow());
            } else {
                println!(
                    "{}",
                    i18n.t_format("search_results", &[&results.len().to_string(), &query]).bold()
                );
                for execution in &results {
                    println!("{}", summary_line(execution));
                }
            }
        }
        Commands::Tag { tags, engagement } => {
            match store.tag_last(&engagement, &tags).with_context(|| i18n.t("error_query"))? {
                Some(record) => println!(
                    "{}",
                    i18n.t_format("tagged", &[&record.id.to_string(), &record.tags.join(", ")]).green()
                ),
                None => println!("{}", i18n.t("no_records").yellow()),
            }
        }
        Commands::Highlights {
            engagement,
            category,
        } => {
            let highlights = store
                .load_highlights(&engagement)
                .with_context(|| i18n.t("error_query"))?;
            print_highlights(&engagement, &highlights, category, &i18n);
        }
        Commands::Extract { file, engagement } => {
            validate_engagement(&engagement).with_context(|| i18n.t("error_engagement"))?;
            let text = std::fs::read(&file)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .with_context(|| i18n.t_format("error_read_file", &[&file.display().to_string()]))?;
            let mut found = HighlightSet::new();
            PatternTable::builtin().classify_into(&text, &mut found);
            let added = store
                .save_highlights(&engagement, &found)
                .with_context(|| i18n.t("error_query"))?;
            println!(
                "{}",
                i18n.t_format(
                    "extracted",
                    &[&found.len().to_string(), &file.display().to_string(), &added.to_string()]
                )
                .green()
            );
        }
        Commands::Engagements => {
            let engagements = store.engagements().with_context(|| i18n.t("error_query"))?;
            if engagements.is_empty() {
                println!("{}", i18n.t("no_engagements").yellow());
            } else {
                println!("{}", i18n.t("engagements_title").bold());
                for summary in engagements {
                    let last = summary
                        .last_activity
                        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| i18n.t("never"));
                    println!(
                        "  {:<24} {:>14}  {}",
                        summary.name.green(),
                        i18n.t_format("commands_count", &[&summary.command_count.to_string()]),
                        i18n.t_format("last_activity", &[&last]).dimmed()
                    );
                }
            }
        }
        Commands::Status { engagement } => {
            let stats = store.stats(&engagement).with_context(|| i18n.t("error_query"))?;
            let highlights = store.load_highlights(&engagement)?;
            let recordings = store.recordings(&engagement)?;
            println!("{}", i18n.t_format("status_title", &[&engagement]).bold());
            println!(
                "  {}",
                i18n.t_format("status_total", &[&stats.total.to_string(), &stats.succeeded.to_string()])
            );
            println!(
                "  {}",
                i18n.t_format("status_success_rate", &[&format!("{:.1}", stats.success_rate())])
            );
            println!(
                "  {}",
                i18n.t_format("status_average", &[&format!("{:.0}", stats.average_ms)])
            );
            println!("  {}", i18n.t_format("status_highlights", &[&highlights.len().to_string()]));
            println!("  {}", i18n.t_format("status_recordings", &[&recordings.len().to_string()]));
            if let Some(last) = &stats.last {
                println!("  {}", i18n.t_format("status_last", &[&last.command]));
            }
        }
        Commands::Record { action } => run_record_action(&store, action, &i18n)?,
        Commands::Clean { engagement } => {
            validate_engagement(&engagement).with_context(|| i18n.t("error_engagement"))?;
            let count = store.records(&engagement)?.len();
            println!(
                "{}",
                i18n.t_format("clean_summary", &[&engagement, &count.to_string()]).red().bold()
            );
            if !confirm_yes(&i18n.t("confirm_delete_prompt")) {
                println!("{}", i18n.t("clean_aborted").yellow());
                return Ok(());
            }
            let cleaned = store.clear_engagement(&engagement)?;
            println!("{}", i18n.t_format("cleaned_records", &[&cleaned.to_string()]));
        }
    }

    Ok(())
}

fn build_session<'a>(store: &'a AuditStore, config: &Config) -> Session<'a> {
    let engine = PtyEngine::new(EngineConfig::from_settings(&config.engine), Interrupts::install());
    Session::new(store, engine, config.recording.export_cast)
}

fn open_context(store: &AuditStore, engagement: &str, i18n: &I18n) -> Result<SessionContext> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    SessionContext::open(store, engagement, cwd).with_context(|| i18n.t("error_engagement"))
}

fn run_shell(session: &Session, ctx: &mut SessionContext, config: &Config, i18n: &I18n) -> Result<()> {
    let interrupts = Interrupts::install();
    println!("{}", i18n.t_format("shell_welcome", &[&ctx.engagement]).cyan());

    let mut reader = LineReader::stdin(session.engine().config().poll_interval);
    loop {
        print!(
            "{}:{}$ ",
            ctx.engagement.red().bold(),
            ctx.working_dir.display().to_string().blue()
        );
        io::stdout().flush().ok();

        let line = match reader.read_line(&interrupts)? {
            PromptInput::Line(line) => line,
            PromptInput::Eof => break,
            // A Ctrl+C at the prompt cancels the line
            PromptInput::Interrupted => {
                interrupts.take();
                println!();
                let confirm = || {
                    print!("{}", i18n.t("confirm_abandon_recording").yellow());
                    io::stdout().flush().ok();
                    // a second Ctrl+C here means no
                    matches!(
                        reader.read_line(&interrupts),
                        Ok(PromptInput::Line(answer)) if answer.trim().eq_ignore_ascii_case("yes")
                    )
                };
                let decision = session.handle_interrupt(ctx, confirm);
                interrupts.take();
                match decision {
                    InterruptDecision::NotRecording => println!("{}", i18n.t("interrupt_hint").yellow()),
                    InterruptDecision::KeepRecording => println!("{}", i18n.t("recording_kept").cyan()),
                    InterruptDecision::Abandoned => println!("{}", i18n.t("recording_abandoned").yellow()),
                }
                continue;
            }
        };

        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            _ => {}
        }

        if line == "cd" || line.starts_with("cd ") {
            match session.change_dir(ctx, &line[2..]) {
                Ok(execution) if execution.record.status == ExecutionStatus::Error => {
                    eprintln!("{}", i18n.t_format("cd_failed", &[execution.raw_output.trim()]).red());
                }
                Ok(_) => {}
                Err(e) => eprintln!("{}: {}", i18n.t("error_save_execution").red(), e),
            }
            continue;
        }

        match session.run_command(ctx, line) {
            Ok(report) => print_report(&report, config, i18n),
            Err(e) => eprintln!("{}: {}", i18n.t("error_save_execution").red(), e),
        }
    }

    if let Some(entry) = session.finish(ctx) {
        print_recording_entry(&entry, i18n);
    }
    Ok(())
}

fn run_record_action(store: &AuditStore, action: RecordAction, i18n: &I18n) -> Result<()> {
    match action {
        RecordAction::List { engagement } => {
            let recordings = store.recordings(&engagement).with_context(|| i18n.t("error_query"))?;
            if recordings.is_empty() {
                println!("{}", i18n.t("no_recordings").yellow());
                return Ok(());
            }
            println!("{}", i18n.t_format("recordings_title", &[&engagement]).bold());
            for entry in recordings {
                println!(
                    "  #{:<4} {}  {:>8.1}s  {}",
                    entry.id.to_string().yellow(),
                    entry.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
                    entry.duration_secs,
                    entry.path.display().to_string().dimmed()
                );
            }
        }
        RecordAction::Play { id, engagement } => {
            let recording = store
                .load_recording(&engagement, id)
                .with_context(|| i18n.t_format("error_load_recording", &[&id.to_string()]))?;
            let mut stdout = io::stdout();
            let end = Player::new(&recording, Interrupts::install()).play(&mut stdout)?;
            println!();
            match end {
                PlaybackEnd::Completed => println!("{}", i18n.t("playback_done").green()),
                PlaybackEnd::Interrupted => println!("{}", i18n.t("playback_interrupted").yellow()),
            }
        }
        RecordAction::Export {
            id,
            output,
            engagement,
        } => {
            let recording = store
                .load_recording(&engagement, id)
                .with_context(|| i18n.t_format("error_load_recording", &[&id.to_string()]))?;
            let path = output.unwrap_or_else(|| PathBuf::from(format!("{engagement}_{id}.cast")));
            recording
                .write_asciicast_file(&path)
                .with_context(|| i18n.t_format("error_export", &[&path.display().to_string()]))?;
            println!("{}", i18n.t_format("exported", &[&path.display().to_string()]).green());
        }
    }
    Ok(())
}

fn print_report(report: &CommandReport, config: &Config, i18n: &I18n) {
    let outcome = &report.outcome;
    let elapsed = outcome.elapsed.as_millis().to_string();
    if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
        println!();
    }
    match &outcome.failure {
        None => {
            let code = outcome.exit_code.unwrap_or(0).to_string();
            println!("{}", i18n.t_format("command_succeeded", &[&elapsed, &code]).green().bold());
        }
        Some(failure) => {
            println!(
                "{}",
                i18n.t_format("command_failed", &[&elapsed, &failure.to_string()]).red().bold()
            );
        }
    }
    if config.display.show_sanitized && report.execution.raw_output != report.execution.redacted_output {
        println!("{}", i18n.t("output_sanitized").yellow());
    }
    if report.new_highlights > 0 {
        println!(
            "{}",
            i18n.t_format("new_highlights", &[&report.new_highlights.to_string()]).cyan()
        );
    }
    println!(
        "{}",
        i18n.t_format(
            "record_saved",
            &[&report.execution.record.id.to_string(), &report.execution.record.engagement]
        )
        .dimmed()
    );
}

fn print_recording_entry(entry: &redterm::storage::RecordingEntry, i18n: &I18n) {
    println!(
        "{}",
        i18n.t_format("recording_saved", &[&entry.path.display().to_string()]).green()
    );
    if let Some(cast) = &entry.cast_path {
        println!("{}", i18n.t_format("recording_cast", &[&cast.display().to_string()]).dimmed());
    }
}

fn status_marker(status: ExecutionStatus) -> ColoredString {
    match status {
        ExecutionStatus::Success => "✔".green(),
        ExecutionStatus::Error => "✘".red(),
    }
}

fn summary_line(execution: &CommandExecution) -> String {
    let record = &execution.record;
    let tags = if record.tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", record.tags.join(", "))
    };
    format!(
        "  #{:<4} {} {}  {}{}",
        record.id.to_string().yellow(),
        status_marker(record.status),
        record.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        truncate_display(&record.command, COMMAND_COLUMN),
        tags.cyan()
    )
}

fn print_execution(execution: &CommandExecution, view: OutputView) {
    let record = &execution.record;
    println!("{}", summary_line(execution).bold());
    println!(
        "    {} {}  {}ms",
        "cwd".dimmed(),
        record.working_dir.display(),
        record.duration_ms
    );
    let output = execution.output(view).replace("\r\n", "\n");
    for line in output.lines() {
        println!("    {}", line);
    }
    println!();
}

fn print_highlights(engagement: &str, highlights: &HighlightSet, only: Option<Category>, i18n: &I18n) {
    if highlights.is_empty() {
        println!("{}", i18n.t("no_highlights").yellow());
        return;
    }
    println!(
        "{}",
        i18n.t_format("highlights_title", &[engagement, &highlights.len().to_string()]).bold()
    );
    for (category, values) in highlights.iter() {
        if only.is_some_and(|c| c != category) {
            continue;
        }
        println!("  {} ({})", category.as_str().cyan().bold(), values.len());
        for value in values {
            println!("    {}", value);
        }
    }
}

/// Cut `text` to at most `max_width` terminal columns, marking the cut.
fn truncate_display(text: &str, max_width: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.width() <= max_width {
        return single_line;
    }
    let mut out = String::new();
    let mut width = 0;
    for c in single_line.chars() {
        let w = c.width().unwrap_or(0);
        if width + w + 1 > max_width {
            break;
        }
        out.push(c);
        width += w;
    }
    out.push('…');
    out
}

fn confirm_yes(prompt: &str) -> bool {
    print!("{}", prompt.yellow());
    io::stdout().flush().ok();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("yes")
}

fn print_help(i18n: &I18n) {
    println!("{}", i18n.t("help_about"));
    println!();
    println!("{} redterm <COMMAND>", i18n.t("help_label_usage"));
    println!();
    println!("{}", i18n.t("help_label_commands"));
    let commands = [
        ("run", "help_run"),
        ("shell", "help_shell"),
        ("log", "help_log"),
        ("search", "help_search"),
        ("tag", "help_tag"),
        ("highlights", "help_highlights"),
        ("extract", "help_extract"),
        ("engagements", "help_engagements"),
        ("status", "help_status"),
        ("record", "help_record"),
        ("clean", "help_clean"),
    ];
    for (name, key) in commands {
        println!("  {:<12} {}", name.green(), i18n.t(key));
    }
    println!();
    println!("{}", i18n.t("help_tip"));
    println!();
    let config_path = Config::home_dir().join("config.toml");
    println!(
        "{}",
        i18n.t_format("help_config_section", &[&config_path.display().to_string()])
    );
    println!("  - {}", i18n.t("help_config_env"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_wide_characters() {
        assert_eq!(truncate_display("nmap -sV", 20), "nmap -sV");
        let cut = truncate_display("echo 漏洞扫描结果很长很长", 10);
        assert!(cut.width() <= 10, "{cut}");
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn cli_parses_scopes_and_categories() {
        let cli = Cli::try_parse_from(["redterm", "search", "ssh", "--scope", "output", "-e", "lab"]).unwrap();
        match cli.command {
            Commands::Search { scope, engagement, .. } => {
                assert_eq!(scope, SearchScope::Output);
                assert_eq!(engagement, "lab");
            }
            _ => panic!("expected search"),
        }

        let cli = Cli::try_parse_from(["redterm", "highlights", "--category", "api-keys"]).unwrap();
        match cli.command {
            Commands::Highlights { category, .. } => assert_eq!(category, Some(Category::ApiKeys)),
            _ => panic!("expected highlights"),
        }
    }
}
