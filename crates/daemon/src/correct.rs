//! Correction tool invocation
//!
//! Builds and runs the Fiji/ImageJ command that applies the bUnwarpJ
//! registration script to one input file.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Environment variable carrying the per-job thread hint to the tool
pub const THREADS_ENV_VAR: &str = "OFM_THREADS_PER_JOB";

/// Error type for correction runs
#[derive(Debug, Error)]
pub enum CorrectionError {
    /// Tool exited with non-zero status
    #[error("correction tool failed with exit code: {0}")]
    ToolFailed(i32),

    /// Tool was terminated by signal
    #[error("correction tool was terminated by signal")]
    Terminated,

    /// Tool could not be started
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the correction tool is launched, shared by all jobs
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionSettings {
    pub launcher: PathBuf,
    pub script: PathBuf,
    /// Flags placed between the launcher and `--run`
    pub flags: Vec<String>,
}

impl From<&crate::config::CorrectionConfig> for CorrectionSettings {
    fn from(cfg: &crate::config::CorrectionConfig) -> Self {
        Self {
            launcher: cfg.launcher.clone(),
            script: cfg.script.clone(),
            flags: cfg.flags.clone(),
        }
    }
}

/// Parameters of one correction run
#[derive(Debug, Clone)]
pub struct CorrectionParams {
    pub input_path: PathBuf,
    pub calibration_path: PathBuf,
    /// Directory the tool writes its result folder into
    pub output_dir: PathBuf,
    pub reference_channel: u32,
    pub threads_hint: u32,
}

/// Escape a value for a single-quoted slot of the script parameter string
fn escape_param(value: &Path) -> String {
    let raw = value.to_string_lossy();
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || c == '\'' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Script parameter string passed as the last argument
///
/// `inputFile='..',beadsFile='..',outputDir='..',fixedCh=N,headless=true`
pub fn script_parameters(params: &CorrectionParams) -> String {
    format!(
        "inputFile='{}',beadsFile='{}',outputDir='{}',fixedCh={},headless=true",
        escape_param(&params.input_path),
        escape_param(&params.calibration_path),
        escape_param(&params.output_dir),
        params.reference_channel
    )
}

/// Build the correction command
///
/// `<launcher> <flags...> --run <script> <parameters>`, each as its own argv
/// entry. The thread hint is exported through [`THREADS_ENV_VAR`].
pub fn build_correction_command(
    settings: &CorrectionSettings,
    params: &CorrectionParams,
) -> Command {
    let mut cmd = Command::new(&settings.launcher);

    cmd.args(&settings.flags);
    cmd.arg("--run").arg(&settings.script);
    cmd.arg(script_parameters(params));

    cmd.env(THREADS_ENV_VAR, params.threads_hint.to_string());

    cmd
}

/// Execute a correction run, blocking until the tool exits
pub fn run_correction(
    settings: &CorrectionSettings,
    params: &CorrectionParams,
) -> Result<(), CorrectionError> {
    let mut cmd = build_correction_command(settings, params);

    let status = cmd.status()?;

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(CorrectionError::ToolFailed(code)),
            None => Err(CorrectionError::Terminated),
        }
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Shell-quoted rendering of a command, for logs only
pub fn render_command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| shell_quote(&arg.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}
