//! Lexical helpers: splitting a command line into stages, and converting a
//! stage between its word-vector and shell-string forms.

use crate::errors::{PipelineError, PipelineResult};

/// Split a pipeline string on `|` into trimmed stage strings.
///
/// A `|` inside single or double quotes, or escaped with a backslash, does
/// not separate stages. Quoting is preserved in the returned segments so they
/// can be tokenized or handed to a shell afterwards.
pub fn split_pipeline(line: &str) -> PipelineResult<Vec<String>> {
    if line.trim().is_empty() {
        return Err(PipelineError::Config("empty pipeline".into()));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (None, '\\') | (Some('"'), '\\') => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, '|') => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if quote.is_some() {
        return Err(PipelineError::Config(format!(
            "unterminated quote in pipeline: {}",
            line
        )));
    }
    segments.push(current);

    let segments: Vec<String> = segments.iter().map(|s| s.trim().to_string()).collect();
    if segments.iter().any(String::is_empty) {
        return Err(PipelineError::Config(format!(
            "empty stage in pipeline: {}",
            line
        )));
    }
    Ok(segments)
}

/// Split a shell string into words (quotes and escapes honoured, no
/// variable or glob expansion).
pub fn tokenize(command: &str) -> PipelineResult<Vec<String>> {
    let words = shlex::split(command).ok_or_else(|| {
        PipelineError::Config(format!("cannot tokenize command: {}", command))
    })?;
    if words.is_empty() {
        return Err(PipelineError::Config(format!(
            "command has no words: {:?}",
            command
        )));
    }
    Ok(words)
}

/// Join words into a shell string, quoting each one as needed.
pub fn join(words: &[String]) -> PipelineResult<String> {
    if words.is_empty() {
        return Err(PipelineError::Config("empty argument vector".into()));
    }
    shlex::try_join(words.iter().map(String::as_str))
        .map_err(|e| PipelineError::Config(format!("cannot quote {:?}: {}", words, e)))
}
