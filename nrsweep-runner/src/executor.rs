//! Simulator execution.
//!
//! `RunExecutor` is the seam between the driver and the outside world. The
//! production implementation, `ShellExecutor`, renders the assignment into a
//! command line, runs it through a shell and captures both output streams.
//!
//! On Unix the shell leads its own process group. Whatever it launches is
//! killed with it, so no descendant outlives the run that started it.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use nrsweep_core::param::ParameterAssignment;

use crate::config::SimulatorConfig;

/// Placeholder in the command template replaced by the argument tokens.
pub const ARGS_PLACEHOLDER: &str = "{args}";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to start '{shell}': {source}")]
    Spawn {
        shell: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for simulator: {0}")]
    Wait(#[source] io::Error),

    #[error("simulator timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

/// Captured result of one finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the simulator for one assignment.
pub trait RunExecutor {
    fn execute(&mut self, assignment: &ParameterAssignment) -> Result<RunOutput, ExecutionError>;
}

/// Runs a command template through `<shell> -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
    shell: String,
    arg_prefix: String,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self::from_config(&SimulatorConfig::new(command))
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            command: config.command.clone(),
            shell: config.shell.clone(),
            arg_prefix: config.arg_prefix.clone(),
            working_dir: config.working_dir.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `<prefix><name>=<value>` tokens in declared order.
    pub fn build_args(&self, assignment: &ParameterAssignment) -> Vec<String> {
        assignment
            .iter()
            .map(|(name, value)| format!("{}{name}={value}", self.arg_prefix))
            .collect()
    }

    /// The full shell command line for `assignment`.
    pub fn render_command(&self, assignment: &ParameterAssignment) -> String {
        let args = self.build_args(assignment).join(" ");
        if self.command.contains(ARGS_PLACEHOLDER) {
            self.command.replace(ARGS_PLACEHOLDER, &args)
        } else if args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {args}", self.command)
        }
    }

    fn wait(&self, child: &mut Child, started: Instant) -> Result<ExitStatus, ExecutionError> {
        let Some(timeout) = self.timeout else {
            return child.wait().map_err(ExecutionError::Wait);
        };
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if started.elapsed() >= timeout => {
                    kill_group(child);
                    let _ = child.wait();
                    return Err(ExecutionError::Timeout(timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(ExecutionError::Wait(e)),
            }
        }
    }
}

impl RunExecutor for ShellExecutor {
    fn execute(&mut self, assignment: &ParameterAssignment) -> Result<RunOutput, ExecutionError> {
        let command_line = self.render_command(assignment);
        tracing::debug!(command = %command_line, "launching simulator");

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecutionError::Spawn {
            shell: self.shell.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty child never blocks on a full pipe.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = self.wait(&mut child, started)?;
        // Background jobs the shell left behind would keep the pipes open.
        kill_group(&mut child);

        // A descendant that escaped the group can still hold a pipe; the budget bounds that too.
        let stdout = collect(stdout, started, self.timeout)?;
        let stderr = collect(stderr, started, self.timeout)?;
        let output = RunOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            elapsed: started.elapsed(),
        };

        tracing::debug!(
            exit_code = ?output.exit_code,
            elapsed_ms = output.elapsed.as_millis() as u64,
            "simulator exited"
        );
        Ok(output)
    }
}

/// SIGKILL the child's process group. Falls back to the child alone.
#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Wait for a reader, within what is left of the timeout if one is set.
fn collect(
    pipe: Option<Receiver<String>>,
    started: Instant,
    timeout: Option<Duration>,
) -> Result<String, ExecutionError> {
    let Some(rx) = pipe else {
        return Ok(String::new());
    };
    let Some(limit) = timeout else {
        return Ok(rx.recv().unwrap_or_default());
    };
    match rx.recv_timeout(limit.saturating_sub(started.elapsed())) {
        Ok(text) => Ok(text),
        Err(RecvTimeoutError::Timeout) => Err(ExecutionError::Timeout(limit)),
        Err(RecvTimeoutError::Disconnected) => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrsweep_core::param::ParamValue;

    fn assignment() -> ParameterAssignment {
        ParameterAssignment::from_pairs([
            ("gNbNum", ParamValue::Int(1)),
            ("ueNum", ParamValue::Int(20)),
            ("gnbPower", ParamValue::Float(50.0)),
        ])
    }

    #[test]
    fn args_follow_declared_order() {
        let exec = ShellExecutor::new("sim");
        assert_eq!(
            exec.build_args(&assignment()),
            vec!["--gNbNum=1", "--ueNum=20", "--gnbPower=50.0"]
        );
    }

    #[test]
    fn placeholder_is_substituted_inside_quotes() {
        let exec = ShellExecutor::new(r#"./ns3 run "contrib/nr/examples/test01.cc {args}""#);
        assert_eq!(
            exec.render_command(&assignment()),
            r#"./ns3 run "contrib/nr/examples/test01.cc --gNbNum=1 --ueNum=20 --gnbPower=50.0""#
        );
    }

    #[test]
    fn args_are_appended_without_placeholder() {
        let exec = ShellExecutor::new("./sim");
        assert_eq!(
            exec.render_command(&assignment()),
            "./sim --gNbNum=1 --ueNum=20 --gnbPower=50.0"
        );
    }

    #[test]
    fn custom_prefix() {
        let mut config = SimulatorConfig::new("sim");
        config.arg_prefix = "-".into();
        let exec = ShellExecutor::from_config(&config);
        assert_eq!(exec.build_args(&assignment())[0], "-gNbNum=1");
    }

    #[test]
    fn reader_past_the_budget_is_a_timeout() {
        let (_tx, rx) = mpsc::channel::<String>();
        let limit = Duration::from_millis(20);
        assert!(matches!(
            collect(Some(rx), Instant::now(), Some(limit)),
            Err(ExecutionError::Timeout(d)) if d == limit
        ));
    }

    #[test]
    fn finished_reader_is_collected() {
        let rx = drain(&b"###RESULTS###1###END###"[..]);
        let text = collect(Some(rx), Instant::now(), Some(Duration::from_secs(5))).unwrap();
        assert_eq!(text, "###RESULTS###1###END###");
        assert_eq!(collect(None, Instant::now(), None).unwrap(), "");
    }

    #[test]
    fn output_success_requires_zero_exit() {
        let mut out = RunOutput::default();
        assert!(!out.success());
        out.exit_code = Some(0);
        assert!(out.success());
    }
}
