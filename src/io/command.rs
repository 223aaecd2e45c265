//! Command-line handling for the control-plane process
//!
//! Splits a configured command string into program and arguments, honoring
//! double-quoted segments and backslash escapes, and resolves the program to
//! an executable file before anything is spawned.

use std::env;
use std::path::{Path, PathBuf};

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while parsing or resolving a command line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandLineError {
    #[error("Command line is empty")]
    Empty,

    #[error("Unterminated double quote in command line: {0}")]
    UnterminatedQuote(String),

    #[error("Command line ends with a dangling escape character: {0}")]
    DanglingEscape(String),

    #[error("Executable not found: {program}")]
    ExecutableNotFound { program: String },

    #[error("File is not executable: {}", path.display())]
    NotExecutable { path: PathBuf },
}

// ============================================================================
// Command Line
// ============================================================================

/// A parsed command line: the program followed by its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Parse a command line string such as `"/Applications/My Tool/server" --stdio`
    pub fn parse(input: &str) -> Result<Self, CommandLineError> {
        let mut words = split_command_line(input)?.into_iter();
        let program = words.next().ok_or(CommandLineError::Empty)?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    /// Resolve the program to an executable path.
    ///
    /// Programs containing a path separator are checked in place; bare names
    /// are searched for in `PATH`.
    pub fn resolve_program(&self) -> Result<PathBuf, CommandLineError> {
        resolve_executable(&self.program)
    }
}

/// Split a command line into words.
///
/// Whitespace separates words except inside double quotes. A backslash makes
/// the next character literal both inside and outside quotes, so `\"` and `\ `
/// can be used to embed quotes and spaces. Empty quoted strings (`""`) yield
/// empty arguments.
pub fn split_command_line(input: &str) -> Result<Vec<String>, CommandLineError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_quotes = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => {
                    current.push(escaped);
                    in_word = true;
                }
                None => return Err(CommandLineError::DanglingEscape(input.to_string())),
            },
            '"' => {
                in_quotes = !in_quotes;
                in_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if in_quotes {
        return Err(CommandLineError::UnterminatedQuote(input.to_string()));
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(CommandLineError::Empty);
    }

    Ok(words)
}

/// Resolve a program name or path to an executable file
pub fn resolve_executable(program: &str) -> Result<PathBuf, CommandLineError> {
    let candidate = Path::new(program);

    if candidate.components().count() > 1 || candidate.is_absolute() {
        if !candidate.exists() {
            return Err(CommandLineError::ExecutableNotFound {
                program: program.to_string(),
            });
        }
        if !is_executable(candidate) {
            return Err(CommandLineError::NotExecutable {
                path: candidate.to_path_buf(),
            });
        }
        return Ok(candidate.to_path_buf());
    }

    let search_path = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&search_path)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
        .ok_or_else(|| CommandLineError::ExecutableNotFound {
            program: program.to_string(),
        })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
