pub mod parse;

use std::collections::BTreeMap;
use std::future::Future;
use std::process::Stdio;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Elevation, NameSelection, QueuesConfig};

use self::parse::{parse_dump, ParseError, QueueStat};

/// Description of an external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Builds a spec from an argv list, applying the elevation prefix.
    pub fn from_argv(argv: &[String], elevation: Elevation) -> Option<Self> {
        let (program, args) = argv.split_first()?;

        let spec = match elevation.prefix() {
            Some(wrapper) => {
                let mut wrapped: Vec<String> =
                    wrapper[1..].iter().map(|s| (*s).to_string()).collect();
                wrapped.push(program.clone());
                wrapped.extend(args.iter().cloned());
                Self {
                    program: wrapper[0].to_string(),
                    args: wrapped,
                }
            }
            None => Self {
                program: program.clone(),
                args: args.to_vec(),
            },
        };

        Some(spec)
    }

    /// Renders the command line for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Capability for running the counter dump command.
///
/// Injected into the collector so tests can supply canned output.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        spec: &CommandSpec,
    ) -> impl Future<Output = std::io::Result<CommandOutput>> + Send;
}

/// Runs commands as child processes via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Failure of one counter collection cycle.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("running {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    NonZeroExit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Output of one successful collection: selected queues plus per-block
/// parse errors.
#[derive(Debug, Default)]
pub struct Collected {
    pub queues: Vec<QueueStat>,
    pub errors: Vec<ParseError>,
}

/// Runs the counter dump and turns its output into queue statistics.
pub struct QueueCollector<R> {
    runner: R,
    spec: CommandSpec,
    select: NameSelection,
    leaf_only: bool,
}

impl<R: CommandRunner> QueueCollector<R> {
    /// Creates a collector. Returns `None` when the configured command is
    /// empty (rejected by config validation).
    pub fn new(runner: R, cfg: &QueuesConfig) -> Option<Self> {
        Some(Self {
            runner,
            spec: CommandSpec::from_argv(&cfg.command, cfg.elevation)?,
            select: cfg.select.clone(),
            leaf_only: cfg.leaf_only,
        })
    }

    pub fn command(&self) -> &CommandSpec {
        &self.spec
    }

    /// Runs one collection cycle.
    pub async fn collect(&self) -> Result<Collected, CollectError> {
        let output = self
            .runner
            .run(&self.spec)
            .await
            .map_err(|source| CollectError::Spawn {
                command: self.spec.display(),
                source,
            })?;

        debug!(
            bytes = output.stdout.len(),
            command = %self.spec.display(),
            "counter dump finished",
        );

        if !output.success() {
            return Err(CollectError::NonZeroExit {
                command: self.spec.display(),
                status: output
                    .status
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr: output.stderr.trim().to_string(),
            });
        }

        if !output.stderr.trim().is_empty() {
            warn!(stderr = %output.stderr.trim(), "counter dump wrote to stderr");
        }

        let dump = parse_dump(&output.stdout)?;
        Ok(Collected {
            queues: self.select_queues(dump.queues),
            errors: dump.errors,
        })
    }

    fn select_queues(&self, queues: BTreeMap<String, QueueStat>) -> Vec<QueueStat> {
        queues
            .into_values()
            .filter(|q| !(self.leaf_only && q.is_parent()))
            .filter(|q| self.select.includes(&q.name))
            .collect()
    }
}
