//! Line-oriented control channel.
//!
//! One command per line; the reply is zero or more text lines closed by `ok`
//! or `error: <message>`. Commands run on the blocking pool because the
//! Pipeline control surface waits on stage threads.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::LevelFilter;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::pipeline::{Pipeline, RestartArgs};

const MAX_LINE: usize = 4096;
pub const REPLY_OK: &str = "ok";
pub const REPLY_ERROR_PREFIX: &str = "error: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    List { json: bool },
    Suspend(usize),
    Resume(usize),
    Restart { index: usize, args: RestartArgs },
    SetLog(LevelFilter),
    Exit { abort: bool },
}

impl FromStr for ControlCommand {
    type Err = PipelineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(PipelineError::InvalidCommand("empty command".to_string()));
        };
        let rest: Vec<&str> = words.collect();

        let command = match (verb.to_ascii_lowercase().as_str(), rest.as_slice()) {
            ("list", []) => ControlCommand::List { json: false },
            ("list", ["--json"]) => ControlCommand::List { json: true },
            ("suspend", [index]) => ControlCommand::Suspend(parse_index(index)?),
            ("resume", [index]) => ControlCommand::Resume(parse_index(index)?),
            ("restart", [index, "--same"]) => ControlCommand::Restart {
                index: parse_index(index)?,
                args: RestartArgs::Same,
            },
            ("restart", [index, args @ ..]) => ControlCommand::Restart {
                index: parse_index(index)?,
                args: RestartArgs::New(args.iter().map(|s| s.to_string()).collect()),
            },
            ("set-log", [level]) => ControlCommand::SetLog(parse_log_level(level)?),
            ("exit", []) => ControlCommand::Exit { abort: false },
            ("exit", ["--abort"]) => ControlCommand::Exit { abort: true },
            _ => return Err(PipelineError::InvalidCommand(line.trim().to_string())),
        };
        Ok(command)
    }
}

fn parse_index(text: &str) -> Result<usize, PipelineError> {
    text.parse()
        .map_err(|_| PipelineError::InvalidCommand(format!("invalid stage index: {}", text)))
}

/// Accepts a level name (case-insensitive) or a number from 0 (off) to 5 (trace).
pub fn parse_log_level(text: &str) -> Result<LevelFilter, PipelineError> {
    if let Ok(number) = text.parse::<usize>() {
        return LevelFilter::iter()
            .nth(number)
            .ok_or_else(|| PipelineError::InvalidLogLevel(text.to_string()));
    }
    text.parse()
        .map_err(|_| PipelineError::InvalidLogLevel(text.to_string()))
}

/// Runs one command against the pipeline. Blocks while a restart completes.
pub fn execute(pipeline: &Pipeline, command: &ControlCommand) -> Result<Vec<String>, PipelineError> {
    match command {
        ControlCommand::List { json: false } => {
            Ok(pipeline.list().iter().map(|s| s.to_string()).collect())
        }
        ControlCommand::List { json: true } => serde_json::to_string(&pipeline.list())
            .map(|line| vec![line])
            .map_err(|e| PipelineError::Encode(e.to_string())),
        ControlCommand::Suspend(index) => pipeline.suspend(*index).map(|_| Vec::new()),
        ControlCommand::Resume(index) => pipeline.resume(*index).map(|_| Vec::new()),
        ControlCommand::Restart { index, args } => {
            pipeline.restart(*index, args.clone()).map(|_| Vec::new())
        }
        ControlCommand::SetLog(level) => {
            log::set_max_level(*level);
            log::info!("log level set to {}", level);
            Ok(Vec::new())
        }
        ControlCommand::Exit { abort } => {
            log::info!("exit requested{}", if *abort { " (abort)" } else { "" });
            pipeline.request_exit(*abort);
            Ok(Vec::new())
        }
    }
}

pub struct ControlServer {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
}

impl ControlServer {
    pub async fn bind(address: &str, pipeline: Arc<Pipeline>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| anyhow::anyhow!("bind {}: {}", address, e))?;
        log::info!("control server listening on {}", listener.local_addr()?);
        Ok(Self { listener, pipeline })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until the pipeline terminates.
    pub async fn run(self) {
        let terminated = self.pipeline.coordinator().terminated_token();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("control: connection from {}", peer);
                            let pipeline = self.pipeline.clone();
                            let terminated = terminated.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, pipeline, terminated).await {
                                    log::warn!("control: {}: {:#}", peer, e);
                                }
                            });
                        }
                        Err(e) => log::warn!("control: accept failed: {}", e),
                    }
                }
                _ = terminated.cancelled() => {
                    log::info!("control server stopped");
                    break;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    pipeline: Arc<Pipeline>,
    terminated: CancellationToken,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    loop {
        let line = tokio::select! {
            line = framed.next() => line,
            _ = terminated.cancelled() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        log::debug!("control: {}", line.trim());

        let reply = match line.parse::<ControlCommand>() {
            Ok(command) => {
                let pipeline = pipeline.clone();
                tokio::task::spawn_blocking(move || execute(&pipeline, &command)).await?
            }
            Err(e) => Err(e),
        };
        match reply {
            Ok(lines) => {
                for line in lines {
                    framed.send(line).await?;
                }
                framed.send(REPLY_OK).await?;
            }
            Err(e) => {
                log::info!("control: {}: {}", line.trim(), e);
                framed.send(format!("{}{}", REPLY_ERROR_PREFIX, e)).await?;
            }
        }
    }
}

/// Reply to one control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub lines: Vec<String>,
    pub error: Option<String>,
}

impl ControlReply {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Sends one command line to a control server and collects the reply.
pub async fn send_command(address: &str, command: &str) -> anyhow::Result<ControlReply> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| anyhow::anyhow!("connect {}: {}", address, e))?;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    framed.send(command).await?;

    let mut lines = Vec::new();
    while let Some(line) = framed.next().await {
        let line = line?;
        if line == REPLY_OK {
            return Ok(ControlReply { lines, error: None });
        }
        if let Some(message) = line.strip_prefix(REPLY_ERROR_PREFIX) {
            return Ok(ControlReply {
                lines,
                error: Some(message.to_string()),
            });
        }
        lines.push(line);
    }
    Err(anyhow::anyhow!("{}: connection closed before reply", address))
}

#[cfg(test)]
#[path = "control_test.rs"]
mod control_test;
