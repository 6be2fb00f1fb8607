//! Two-phase restart of a compose project: `down`, a pause, then `up -d`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{CommandStrategy, RestartConfig};
use crate::error::{KeeperError, Result};
use crate::models::{PhaseFailure, RestartOutcome, RestartPhase};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait Restarter: Send + Sync {
    fn restart(&self, file: &Path) -> RestartOutcome;
}

// -----------------------------------------------------------------------------
// Command resolution
// -----------------------------------------------------------------------------

/// The orchestration command chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    program: String,
    args: Vec<String>,
}

impl ResolvedCommand {
    pub fn new(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| KeeperError::CommandUnavailable("empty command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn resolve(config: &RestartConfig) -> Result<Self> {
        match config.strategy {
            CommandStrategy::Fixed => Self::new(&config.command),
            CommandStrategy::Probe => {
                Self::probe(&[config.primary.clone(), config.legacy.clone()], config.timeout())
            }
        }
    }

    /// First candidate whose `version` subcommand exits zero.
    pub fn probe(candidates: &[Vec<String>], timeout: Duration) -> Result<Self> {
        let mut tried = Vec::new();
        for argv in candidates {
            let candidate = match Self::new(argv) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let run = run_captured(&candidate, &["version"], Path::new("."), timeout);
            match run.error {
                None => {
                    info!(command = %candidate, "orchestration command resolved");
                    return Ok(candidate);
                }
                Some(reason) => {
                    debug!(command = %candidate, %reason, "version probe failed");
                    tried.push(format!("{candidate}: {reason}"));
                }
            }
        }
        Err(KeeperError::CommandUnavailable(tried.join("; ")))
    }
}

impl std::fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Process helper
// -----------------------------------------------------------------------------

struct PhaseRun {
    output: String,
    error: Option<String>,
}

/// Runs the command with stdout and stderr sharing one capture file, so the
/// combined output keeps its order. Killed once `timeout` elapses.
fn run_captured(command: &ResolvedCommand, extra: &[&str], cwd: &Path, timeout: Duration) -> PhaseRun {
    let failed = |output: String, reason: String| PhaseRun {
        output,
        error: Some(reason),
    };

    let mut capture = match tempfile::tempfile() {
        Ok(f) => f,
        Err(e) => return failed(String::new(), format!("capture file: {e}")),
    };
    let (out, err) = match (capture.try_clone(), capture.try_clone()) {
        (Ok(o), Ok(e)) => (o, e),
        (Err(e), _) | (_, Err(e)) => return failed(String::new(), format!("capture file: {e}")),
    };

    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .args(extra)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return failed(String::new(), format!("failed to launch `{command}`: {e}")),
    };

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                if started.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(format!("timed out after {}s", timeout.as_secs_f32()));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => break Err(format!("wait failed: {e}")),
        }
    };

    let output = read_capture(&mut capture);
    match status {
        Ok(s) if s.success() => PhaseRun { output, error: None },
        Ok(s) => failed(output, s.to_string()),
        Err(reason) => failed(output, reason),
    }
}

fn read_capture(capture: &mut File) -> String {
    let mut bytes = Vec::new();
    if capture.seek(SeekFrom::Start(0)).is_ok() {
        let _ = capture.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

// -----------------------------------------------------------------------------
// Runner
// -----------------------------------------------------------------------------

pub struct RestartRunner {
    command: ResolvedCommand,
    quiescence: Duration,
    timeout: Duration,
}

impl RestartRunner {
    pub fn new(command: ResolvedCommand, quiescence: Duration, timeout: Duration) -> Self {
        Self {
            command,
            quiescence,
            timeout,
        }
    }

    pub fn from_config(config: &RestartConfig) -> Result<Self> {
        let command = ResolvedCommand::resolve(config)?;
        Ok(Self::new(command, config.quiescence(), config.timeout()))
    }

    fn phase(&self, phase: RestartPhase, name: &str, cwd: &Path, outcome: &mut RestartOutcome) -> bool {
        let args: &[&str] = match phase {
            RestartPhase::Stop => &["-f", name, "down"],
            RestartPhase::Start => &["-f", name, "up", "-d"],
        };
        info!(%phase, file = name, dir = %cwd.display(), "restart phase starting");

        outcome
            .output
            .push_str(&format!("[{phase}] {} {}\n", self.command, args.join(" ")));
        let run = run_captured(&self.command, args, cwd, self.timeout);
        outcome.output.push_str(&run.output);
        if !run.output.is_empty() && !run.output.ends_with('\n') {
            outcome.output.push('\n');
        }

        match run.error {
            None => true,
            Some(reason) => {
                warn!(%phase, file = name, %reason, "restart phase failed");
                outcome.failure = Some(PhaseFailure { phase, reason });
                false
            }
        }
    }
}

impl Restarter for RestartRunner {
    /// A failed stop phase ends the cycle; start is never attempted after it.
    fn restart(&self, file: &Path) -> RestartOutcome {
        let mut outcome = RestartOutcome::default();
        let name = match file.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => {
                outcome.failure = Some(PhaseFailure {
                    phase: RestartPhase::Stop,
                    reason: format!("not a file: {}", file.display()),
                });
                return outcome;
            }
        };
        let cwd = match file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        if !self.phase(RestartPhase::Stop, &name, cwd, &mut outcome) {
            return outcome;
        }
        thread::sleep(self.quiescence);
        if self.phase(RestartPhase::Start, &name, cwd, &mut outcome) {
            info!(file = %file.display(), "restart completed");
        }
        outcome
    }
}

/// Stands in when no command could be resolved; every restart fails in the
/// stop phase with the resolution error.
pub struct UnavailableRestarter {
    reason: String,
}

impl UnavailableRestarter {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Restarter for UnavailableRestarter {
    fn restart(&self, file: &Path) -> RestartOutcome {
        warn!(file = %file.display(), reason = %self.reason, "restart unavailable");
        RestartOutcome {
            output: String::new(),
            failure: Some(PhaseFailure {
                phase: RestartPhase::Stop,
                reason: self.reason.clone(),
            }),
        }
    }
}

impl RestartOutcome {
    /// Turns a failed phase into the matching error, output attached.
    pub fn into_result(self) -> Result<RestartOutcome> {
        match self.failure {
            None => Ok(self),
            Some(f) => Err(KeeperError::phase_failed(f.phase, f.reason, self.output)),
        }
    }
}
