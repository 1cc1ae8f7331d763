//! procpipe CLI
//!
//! Runs a pipe-delimited command line without a shell and exits with its
//! pipefail return code.
//!
//! ```text
//! procpipe 'grep foo | wc -l' --stdin-text $'foo\nbar'
//! procpipe --json 'cat missing | wc -l'
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use procpipe::{DEFAULT_SHELL, Pipeline, PipelineError, StreamDirective};

#[derive(Debug, Parser)]
#[command(name = "procpipe", version, about = "Run a process pipeline with pipefail semantics")]
struct Cli {
    /// Pipeline, e.g. "grep foo | wc -l"
    command: String,

    /// Run each stage through a shell (default /bin/bash)
    #[arg(long, value_name = "PATH", num_args = 0..=1, require_equals = true, default_missing_value = DEFAULT_SHELL)]
    shell: Option<PathBuf>,

    /// Feed this text to the first stage
    #[arg(long, value_name = "TEXT")]
    stdin_text: Option<String>,

    /// Write the last stage's stdout to a file
    #[arg(long, value_name = "FILE")]
    stdout: Option<PathBuf>,

    /// Write the last stage's stderr to a file
    #[arg(long, value_name = "FILE")]
    stderr: Option<PathBuf>,

    /// Return code treated as success (repeatable, default 0)
    #[arg(long = "allow", value_name = "RC")]
    allow: Vec<i32>,

    /// Give up (and kill the pipeline) after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Decode output as text
    #[arg(long)]
    text: bool,

    /// Do not capture stderr of interior stages
    #[arg(long)]
    no_interior_stderr: bool,

    /// Log the command line before running it
    #[arg(long)]
    echo: bool,

    /// Print a JSON report instead of the raw output
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    command: String,
    returncode: Option<i32>,
    ok: bool,
    exit_codes: Vec<Option<i32>>,
    output: Option<String>,
    stderr: Option<String>,
    all_stderr: Vec<String>,
}

fn main() -> ExitCode {
    procpipe::init_logging();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("procpipe: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let timeout = cli
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("invalid --timeout")?;

    let mut builder = Pipeline::builder()
        .command_line(&cli.command)
        .echo(cli.echo)
        .capture_interior_stderr(!cli.no_interior_stderr);
    if cli.text || cli.json {
        builder = builder.text();
    }
    if let Some(shell) = cli.shell {
        builder = builder.shell(shell);
    }
    if !cli.allow.is_empty() {
        builder = builder.allowed_return_codes(cli.allow);
    }
    if let Some(text) = cli.stdin_text {
        builder = builder.stdin(StreamDirective::literal(text));
    }
    if let Some(path) = cli.stdout {
        builder = builder.stdout(StreamDirective::File(path));
    }
    if let Some(path) = cli.stderr {
        builder = builder.stderr(StreamDirective::File(path));
    }

    let mut pipeline = builder.build().context("invalid pipeline")?;
    pipeline
        .scoped(|p| {
            p.wait(timeout)?;
            p.close()
        })
        .with_context(|| format!("failed to run '{}'", pipeline))?;

    let returncode = pipeline.returncode()?;
    if cli.json {
        print_report(&pipeline, returncode)?;
    } else {
        print_output(&pipeline)?;
    }

    match pipeline.check() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(PipelineError::Execution { returncode, .. }) => {
            tracing::debug!(returncode, "pipeline failed");
            Ok(ExitCode::from(exit_status_byte(returncode)))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_output(pipeline: &Pipeline) -> Result<()> {
    if let Ok(output) = pipeline.output() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(output.as_bytes())?;
        if !output.is_empty() {
            stdout.write_all(b"\n")?;
        }
    }
    let stderr: Vec<String> = pipeline
        .all_stderr()?
        .iter()
        .map(|captured| captured.to_string_lossy().trim_end().to_string())
        .filter(|text| !text.is_empty())
        .collect();
    for text in stderr {
        eprintln!("{}", text);
    }
    Ok(())
}

fn print_report(pipeline: &Pipeline, returncode: Option<i32>) -> Result<()> {
    let report = Report {
        command: pipeline.to_string(),
        returncode,
        ok: pipeline.ok(),
        exit_codes: pipeline.exit_codes(),
        output: pipeline
            .output()
            .ok()
            .map(|captured| captured.to_string_lossy().into_owned()),
        stderr: pipeline
            .error()
            .ok()
            .map(|captured| captured.to_string_lossy().into_owned()),
        all_stderr: pipeline
            .all_stderr()?
            .iter()
            .map(|captured| captured.to_string_lossy().into_owned())
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Map an aggregate return code onto a process exit status, shell style:
/// death by signal `s` becomes `128 + s`.
fn exit_status_byte(returncode: i32) -> u8 {
    let code = if returncode < 0 {
        128 - returncode
    } else {
        returncode
    };
    match u8::try_from(code) {
        Ok(0) | Err(_) => 1,
        Ok(code) => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_byte() {
        assert_eq!(exit_status_byte(1), 1);
        assert_eq!(exit_status_byte(2), 2);
        assert_eq!(exit_status_byte(-15), 143);
        assert_eq!(exit_status_byte(0), 1);
        assert_eq!(exit_status_byte(300), 1);
    }

    #[test]
    fn test_cli_parses_shell_forms() {
        let cli = Cli::try_parse_from(["procpipe", "echo hi", "--shell"]).unwrap();
        assert_eq!(cli.shell, Some(PathBuf::from(DEFAULT_SHELL)));

        let cli = Cli::try_parse_from(["procpipe", "echo hi", "--shell=/bin/sh"]).unwrap();
        assert_eq!(cli.shell, Some(PathBuf::from("/bin/sh")));

        let cli = Cli::try_parse_from(["procpipe", "echo hi", "--allow", "0", "--allow", "1"])
            .unwrap();
        assert_eq!(cli.allow, vec![0, 1]);
        assert!(cli.shell.is_none());
    }

    #[test]
    fn test_cli_verifies() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
