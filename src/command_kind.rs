//! Interactive vs batch classification of a command line.
//!
//! The command is parsed as bash so that program names are matched as
//! programs, not as substrings: `cat /etc/shadow` must not look like `sh`.

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;
use tree_sitter::{Node, Parser, Tree};

// Programs that only prefix the real one
const WRAPPERS: &[&str] = &["sudo", "env", "nohup", "time", "proxychains", "proxychains4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Needs a raw keystroke-forwarding terminal.
    Interactive,
    /// Runs without a live operator; keystrokes are never forwarded.
    Batch,
}

impl CommandKind {
    pub fn is_interactive(self) -> bool {
        self == CommandKind::Interactive
    }
}

/// One simple command found in a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

pub struct BashParser {
    parser: Parser,
}

impl fmt::Debug for BashParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BashParser").finish_non_exhaustive()
    }
}

impl BashParser {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let lang = tree_sitter_bash::language();
        parser
            .set_language(&lang)
            .map_err(|e| anyhow!("load bash grammar: {e}"))?;
        Ok(Self { parser })
    }

    pub fn parse_to_tree(&mut self, source: &str) -> Option<Tree> {
        self.parser.parse(source, None)
    }

    /// Every simple command in `source`, in source order, with wrappers removed.
    pub fn invocations(&mut self, source: &str) -> Option<Vec<Invocation>> {
        let tree = self.parse_to_tree(source)?;
        let root = tree.root_node();
        if root.has_error() {
            return None;
        }
        let mut found = Vec::new();
        collect_commands(root, source.as_bytes(), &mut found);
        Some(found)
    }
}

fn collect_commands(node: Node, source: &[u8], out: &mut Vec<Invocation>) {
    if node.kind() == "command" {
        if let Some(name) = node.child_by_field_name("name") {
            let program = node_text(name, source);
            let mut cursor = node.walk();
            let args = node
                .children_by_field_name("argument", &mut cursor)
                .map(|arg| node_text(arg, source))
                .collect();
            out.push(unwrap_wrappers(program, args));
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_commands(child, source, out);
    }
}

fn node_text(node: Node, source: &[u8]) -> String {
    node.utf8_text(source)
        .unwrap_or_default()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string()
}

fn program_basename(program: &str) -> String {
    Path::new(program)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(program)
        .to_string()
}

fn unwrap_wrappers(program: String, args: Vec<String>) -> Invocation {
    let mut program = program_basename(&program);
    let mut args = args;
    while WRAPPERS.contains(&program.as_str()) {
        let Some(pos) = args
            .iter()
            .position(|a| !a.starts_with('-') && !a.contains('='))
        else {
            break;
        };
        program = program_basename(&args[pos]);
        args = args.split_off(pos + 1);
    }
    Invocation { program, args }
}

/// Whitespace fallback for lines the grammar rejects: first word of every
/// pipeline or list segment.
fn naive_invocations(source: &str) -> Vec<Invocation> {
    source
        .split(|c| c == '|' || c == ';' || c == '&' || c == '\n')
        .filter_map(|segment| {
            let mut words = segment.split_whitespace().map(String::from);
            let program = words.next()?;
            Some(unwrap_wrappers(program, words.collect()))
        })
        .collect()
}

#[derive(Debug, Clone)]
struct InteractiveRule {
    program: String,
    // e.g. "-" for "nc -": only when an argument starts with it
    arg_prefix: Option<String>,
}

impl InteractiveRule {
    fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.trim().splitn(2, char::is_whitespace);
        let program = parts.next()?.to_lowercase();
        if program.is_empty() {
            return None;
        }
        let arg_prefix = parts
            .next()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Some(Self {
            program,
            arg_prefix,
        })
    }

    fn matches(&self, invocation: &Invocation) -> bool {
        if invocation.program.to_lowercase() != self.program {
            return false;
        }
        match &self.arg_prefix {
            None => true,
            Some(prefix) => invocation.args.iter().any(|a| a.starts_with(prefix.as_str())),
        }
    }
}

/// Decides the terminal mode for a command from the configured program list.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    rules: Vec<InteractiveRule>,
    /// Shared by clones; `None` when the grammar failed to load.
    parser: Option<Arc<Mutex<BashParser>>>,
}

impl CommandClassifier {
    pub fn new<S: AsRef<str>>(programs: &[S]) -> Self {
        let rules = programs
            .iter()
            .filter_map(|p| InteractiveRule::parse(p.as_ref()))
            .collect();
        let parser = match BashParser::new() {
            Ok(parser) => Some(Arc::new(Mutex::new(parser))),
            Err(e) => {
                warn!(error = %e, "bash grammar unavailable, classifying by first words");
                None
            }
        };
        Self { rules, parser }
    }

    pub fn classify(&self, command: &str) -> CommandKind {
        let parsed = self.parser.as_ref().and_then(|parser| {
            parser
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .invocations(command)
        });
        let invocations = parsed.unwrap_or_else(|| naive_invocations(command));

        let interactive = invocations
            .iter()
            .any(|inv| self.rules.iter().any(|rule| rule.matches(inv)));

        if interactive {
            CommandKind::Interactive
        } else {
            CommandKind::Batch
        }
    }
}
