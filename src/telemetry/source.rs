use async_trait::async_trait;
use log::{debug, info, warn};
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use super::frame::TelemetryFrame;
use crate::utils::error::TelemetryError;

/// `None` means exhausted. `MalformedFrame` is per-frame; any other error
/// means the source is broken.
#[async_trait]
pub trait TelemetrySource: Send {
    async fn next_frame(&mut self) -> Option<Result<TelemetryFrame, TelemetryError>>;

    fn describe(&self) -> String;
}

pub struct LineSource<R> {
    lines: Lines<R>,
    name: String,
    line_number: u64,
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            name: name.into(),
            line_number: 0,
        }
    }
}

#[async_trait]
impl<R> TelemetrySource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<Result<TelemetryFrame, TelemetryError>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    self.line_number += 1;
                    return Some(Err(TelemetryError::MalformedFrame(format!(
                        "{} line {}: {}",
                        self.name, self.line_number, e
                    ))));
                }
                Err(e) => {
                    return Some(Err(TelemetryError::Transport(format!(
                        "{} read failed: {}",
                        self.name, e
                    ))))
                }
            };
            self.line_number += 1;

            if line.trim().is_empty() {
                continue;
            }
            return Some(TelemetryFrame::parse_line(&line));
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

pub struct ProcessSource {
    child: Child,
    lines: LineSource<BufReader<ChildStdout>>,
    command_line: String,
}

impl ProcessSource {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, TelemetryError> {
        let command_line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TelemetryError::Transport(format!("Failed to launch `{}`: {}", command_line, e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TelemetryError::Transport(format!("`{}` has no stdout pipe", command_line))
        })?;

        info!("🚀 Started telemetry process: {}", command_line);
        Ok(Self {
            child,
            lines: LineSource::new(BufReader::new(stdout), command_line.clone()),
            command_line,
        })
    }
}

#[async_trait]
impl TelemetrySource for ProcessSource {
    async fn next_frame(&mut self) -> Option<Result<TelemetryFrame, TelemetryError>> {
        let next = self.lines.next_frame().await;
        if next.is_none() {
            match self.child.wait().await {
                Ok(status) if status.success() => debug!("`{}` exited", self.command_line),
                Ok(status) => warn!("`{}` exited with {}", self.command_line, status),
                Err(e) => warn!("Failed to reap `{}`: {}", self.command_line, e),
            }
        }
        next
    }

    fn describe(&self) -> String {
        format!("process `{}`", self.command_line)
    }
}
