//! Command file parsing.
//!
//! A command file holds one argument vector per line. Supported syntax:
//!
//! ```text
//! # comment
//! instrument --class "a.B" --serial SER1
//! long-command --class a.C \
//!     --loop
//! MACRO serials = --serial SER1 --serial SER2
//! instrument serials()
//! LONG MACRO suites
//!   --class a.B
//!   --class a.C
//! END MACRO
//! instrument suites()
//! INCLUDE other.txt
//! ```
//!
//! A long macro call expands a line into one command per macro line.
//! `INCLUDE` paths are resolved relative to the including file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SchedulerError};

const MAX_EXPANSION_DEPTH: usize = 10;
const MAX_INCLUDE_DEPTH: usize = 10;

/// One expanded command from a command file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub args: Vec<String>,
    /// File the line came from, which may be an included file.
    pub file: PathBuf,
    /// 1-based line number of the first physical line.
    pub line_number: usize,
}

/// Result of parsing a command file and its includes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCommandFile {
    pub commands: Vec<CommandLine>,
    /// Every file pulled in through `INCLUDE`, for change watching.
    pub included_files: Vec<PathBuf>,
}

/// Parser for command files.
#[derive(Debug, Clone, Default)]
pub struct CommandFileParser;

#[derive(Default)]
struct ParseState {
    short_macros: HashMap<String, Vec<String>>,
    long_macros: HashMap<String, Vec<Vec<String>>>,
    raw: Vec<CommandLine>,
    included: Vec<PathBuf>,
    stack: Vec<PathBuf>,
}

struct LogicalLine {
    number: usize,
    tokens: Vec<String>,
}

impl CommandFileParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse `path`, following includes and expanding macros.
    pub fn parse_file(&self, path: &Path) -> Result<ParsedCommandFile> {
        let mut state = ParseState::default();
        self.parse_into(path, &mut state)?;

        let mut commands = Vec::new();
        for line in state.raw.iter() {
            let expanded = expand(&line.args, &state, 0)
                .map_err(|msg| SchedulerError::command_file(&line.file, format!("line {}: {}", line.line_number, msg)))?;
            commands.extend(expanded.into_iter().map(|args| CommandLine {
                args,
                file: line.file.clone(),
                line_number: line.line_number,
            }));
        }

        Ok(ParsedCommandFile {
            commands,
            included_files: state.included,
        })
    }

    fn parse_into(&self, path: &Path, state: &mut ParseState) -> Result<()> {
        if state.stack.iter().any(|p| p == path) {
            return Err(SchedulerError::command_file(path, "include cycle detected"));
        }
        if state.stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(SchedulerError::command_file(path, "includes nested too deeply"));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| SchedulerError::command_file(path, format!("cannot read: {}", e)))?;
        let lines = logical_lines(&content).map_err(|msg| SchedulerError::command_file(path, msg))?;

        state.stack.push(path.to_path_buf());
        let mut iter = lines.into_iter();
        while let Some(line) = iter.next() {
            let tokens = &line.tokens;
            match tokens.first().map(String::as_str) {
                Some("MACRO") => {
                    if tokens.len() < 3 || tokens[2] != "=" {
                        return Err(line_error(path, line.number, "expected 'MACRO <name> = <args>'"));
                    }
                    state.short_macros.insert(tokens[1].clone(), tokens[3..].to_vec());
                }
                Some("LONG") if tokens.get(1).map(String::as_str) == Some("MACRO") => {
                    let name = match tokens.get(2) {
                        Some(name) if tokens.len() == 3 => name.clone(),
                        _ => return Err(line_error(path, line.number, "expected 'LONG MACRO <name>'")),
                    };
                    let mut body = Vec::new();
                    loop {
                        match iter.next() {
                            Some(inner) if inner.tokens == ["END", "MACRO"] => break,
                            Some(inner) => body.push(inner.tokens),
                            None => {
                                return Err(line_error(path, line.number, "LONG MACRO without END MACRO"));
                            }
                        }
                    }
                    state.long_macros.insert(name, body);
                }
                Some("INCLUDE") => {
                    let target = match tokens.get(1) {
                        Some(target) if tokens.len() == 2 => target,
                        _ => return Err(line_error(path, line.number, "expected 'INCLUDE <path>'")),
                    };
                    let included = resolve_include(path, target);
                    state.included.push(included.clone());
                    self.parse_into(&included, state)?;
                }
                Some(_) => state.raw.push(CommandLine {
                    args: line.tokens,
                    file: path.to_path_buf(),
                    line_number: line.number,
                }),
                None => {}
            }
        }
        state.stack.pop();
        Ok(())
    }
}

fn line_error(path: &Path, number: usize, message: &str) -> SchedulerError {
    SchedulerError::command_file(path, format!("line {}: {}", number, message))
}

fn resolve_include(from: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    from.parent().unwrap_or_else(|| Path::new(".")).join(target)
}

/// Join continuation lines and tokenize, dropping blanks and comments.
fn logical_lines(content: &str) -> std::result::Result<Vec<LogicalLine>, String> {
    let mut lines = Vec::new();
    let mut pending = String::new();
    let mut start = 0;

    for (index, physical) in content.lines().enumerate() {
        if pending.is_empty() {
            start = index + 1;
        }
        let trimmed = physical.trim_end();
        if let Some(head) = trimmed.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
            continue;
        }
        pending.push_str(trimmed);

        let tokens = tokenize(&pending).map_err(|msg| format!("line {}: {}", start, msg))?;
        if !tokens.is_empty() {
            lines.push(LogicalLine { number: start, tokens });
        }
        pending.clear();
    }

    if !pending.is_empty() {
        let tokens = tokenize(&pending).map_err(|msg| format!("line {}: {}", start, msg))?;
        if !tokens.is_empty() {
            lines.push(LogicalLine { number: start, tokens });
        }
    }
    Ok(lines)
}

/// Split a line into shell-like tokens. `#` at a token start ends the line.
fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '#' if !in_token => break,
            '"' | '\'' => {
                in_token = true;
                let quote = c;
                loop {
                    match chars.next() {
                        Some(q) if q == quote => break,
                        Some('\\') if quote == '"' => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err("unterminated quote".to_string()),
                        },
                        Some(other) => current.push(other),
                        None => return Err("unterminated quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn macro_call(token: &str) -> Option<&str> {
    token.strip_suffix("()").filter(|name| !name.is_empty())
}

/// Expand the first macro call in `args`, recursively.
fn expand(args: &[String], state: &ParseState, depth: usize) -> std::result::Result<Vec<Vec<String>>, String> {
    if depth > MAX_EXPANSION_DEPTH {
        return Err("macro expansion too deep; recursive macro?".to_string());
    }

    let Some((index, name)) = args
        .iter()
        .enumerate()
        .find_map(|(i, token)| macro_call(token).map(|name| (i, name)))
    else {
        return Ok(vec![args.to_vec()]);
    };

    let splice = |insert: &[String]| {
        let mut out = args[..index].to_vec();
        out.extend(insert.iter().cloned());
        out.extend(args[index + 1..].iter().cloned());
        out
    };

    if let Some(body) = state.short_macros.get(name) {
        return expand(&splice(body), state, depth + 1);
    }
    if let Some(lines) = state.long_macros.get(name) {
        let mut out = Vec::new();
        for body in lines {
            out.extend(expand(&splice(body), state, depth + 1)?);
        }
        return Ok(out);
    }
    Err(format!("macro call '{}' does not match any macro definition", args[index]))
}
