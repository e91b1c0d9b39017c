//! Command-line handling: shell-like word splitting, pipeline detection and
//! `PATH` lookup.

use procmux_core::{ProcessError, Result};
use std::path::PathBuf;

/// Split a command line into words.
///
/// Whitespace separates words. Single quotes preserve everything up to the
/// closing quote, double quotes allow `\"`, `\\`, `\$` and `` \` `` escapes,
/// and an unquoted backslash escapes the next character.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(unterminated(line, '\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(unterminated(line, '"')),
                        },
                        Some(c) => word.push(c),
                        None => return Err(unterminated(line, '"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }
    if words.is_empty() {
        return Err(ProcessError::InvalidCommand(line.to_string()));
    }
    Ok(words)
}

fn unterminated(line: &str, quote: char) -> ProcessError {
    ProcessError::InvalidCommand(format!("unterminated {quote} in: {line}"))
}

/// Byte offsets of every `|` outside quotes
fn unquoted_bars(line: &str) -> Vec<usize> {
    let mut bars = Vec::new();
    let mut quote = None;
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (Some('"'), '"') => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '|') => bars.push(i),
            (None, _) => {}
        }
    }
    bars
}

/// Whether `line` asks for a pipeline
pub fn is_pipeline(line: &str) -> bool {
    !unquoted_bars(line).is_empty()
}

/// Split `"a | b"` into its two halves. Only a single pipe is supported.
pub fn split_pipeline(line: &str) -> Result<(String, String)> {
    let bars = unquoted_bars(line);
    if bars.len() != 1 {
        return Err(ProcessError::InvalidCommand(format!(
            "exactly one '|' is supported: {line}"
        )));
    }

    let (left, right) = line.split_at(bars[0]);
    let (left, right) = (left.trim(), right[1..].trim());
    if left.is_empty() || right.is_empty() {
        return Err(ProcessError::InvalidCommand(format!(
            "empty pipeline stage: {line}"
        )));
    }
    Ok((left.to_string(), right.to_string()))
}

/// Locate `basename` on `PATH`
pub fn which(basename: &str) -> Result<PathBuf> {
    which::which(basename).map_err(|_| ProcessError::CommandNotFound(basename.to_string()))
}
