//! Supervisor → worker messages carried over the worker's stdin pipe.
//!
//! One message per line, fields separated by tabs: `HELLO\tsender\ttext` and
//! `ASK\tsender\tpersona\tprompt`. The final field is the rest of the line, so
//! it may itself contain tabs.

use std::{io, os::fd::AsFd, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::unix::pipe,
    time::timeout,
};

use crate::helpers::floor_char_boundary;

/// Frame cap on the pipe, newline included.
pub const MAX_PIPE_MSG_LEN: usize = 512;

const VERB_HELLO: &str = "HELLO";
const VERB_ASK: &str = "ASK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeMessage {
    Hello {
        sender: String,
        text: String,
    },
    Ask {
        sender: String,
        persona: String,
        prompt: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("unknown pipe verb '{0}'")]
    UnknownVerb(String),
    #[error("{verb} frame is missing fields")]
    MissingFields { verb: &'static str },
    #[error("field '{field}' cannot be framed")]
    Unframeable { field: &'static str },
}

impl PipeMessage {
    pub fn verb(&self) -> &'static str {
        match self {
            PipeMessage::Hello { .. } => VERB_HELLO,
            PipeMessage::Ask { .. } => VERB_ASK,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            PipeMessage::Hello { sender, .. } | PipeMessage::Ask { sender, .. } => sender,
        }
    }

    /// Encode as one newline-terminated frame.
    pub fn encode(&self) -> Result<String, PipeError> {
        let mut frame = String::from(self.verb());
        match self {
            PipeMessage::Hello { sender, text } => {
                push_field(&mut frame, "sender", sender, false)?;
                push_field(&mut frame, "text", text, true)?;
            }
            PipeMessage::Ask {
                sender,
                persona,
                prompt,
            } => {
                push_field(&mut frame, "sender", sender, false)?;
                push_field(&mut frame, "persona", persona, false)?;
                push_field(&mut frame, "prompt", prompt, true)?;
            }
        }
        frame.push('\n');
        Ok(frame)
    }

    /// Decode one frame; the trailing newline is optional.
    pub fn decode(frame: &str) -> Result<Self, PipeError> {
        let frame = frame.trim_end_matches(['\r', '\n']);
        let (verb, rest) = frame.split_once('\t').unwrap_or((frame, ""));
        match verb {
            VERB_HELLO => {
                let [sender, text] = split_fields::<2>(rest, VERB_HELLO)?;
                Ok(PipeMessage::Hello {
                    sender: sender.to_string(),
                    text: text.to_string(),
                })
            }
            VERB_ASK => {
                let [sender, persona, prompt] = split_fields::<3>(rest, VERB_ASK)?;
                Ok(PipeMessage::Ask {
                    sender: sender.to_string(),
                    persona: persona.to_string(),
                    prompt: prompt.to_string(),
                })
            }
            other => Err(PipeError::UnknownVerb(other.to_string())),
        }
    }
}

fn push_field(
    frame: &mut String,
    field: &'static str,
    value: &str,
    last: bool,
) -> Result<(), PipeError> {
    if value.is_empty() || value.contains(['\r', '\n']) || (!last && value.contains('\t')) {
        return Err(PipeError::Unframeable { field });
    }
    frame.push('\t');
    frame.push_str(value);
    Ok(())
}

fn split_fields<'a, const N: usize>(
    rest: &'a str,
    verb: &'static str,
) -> Result<[&'a str; N], PipeError> {
    let mut fields = [""; N];
    let mut parts = rest.splitn(N, '\t');
    for slot in fields.iter_mut() {
        match parts.next() {
            Some(part) if !part.is_empty() => *slot = part,
            _ => return Err(PipeError::MissingFields { verb }),
        }
    }
    Ok(fields)
}

#[derive(Debug, thiserror::Error)]
pub enum PipeSendError {
    #[error(transparent)]
    Encode(#[from] PipeError),
    #[error("pipe write failed: {0}")]
    Io(#[from] io::Error),
}

/// Write half of a worker pipe, held by the supervisor.
pub struct WorkerPipe {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for WorkerPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPipe").finish_non_exhaustive()
    }
}

impl WorkerPipe {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    pub async fn send(&mut self, message: &PipeMessage) -> Result<(), PipeSendError> {
        let mut frame = message.encode()?;
        if frame.len() > MAX_PIPE_MSG_LEN {
            let cut = floor_char_boundary(&frame, MAX_PIPE_MSG_LEN - 1);
            tracing::warn!(
                verb = message.verb(),
                len = frame.len(),
                kept = cut,
                "pipe frame over limit, message truncated"
            );
            frame.truncate(cut);
            frame.push('\n');
        }
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PipeEvent {
    Frame(String),
    /// Nothing arrived within the wait.
    Idle,
    /// The supervisor closed its end.
    Closed,
}

/// Read half of a worker pipe.
pub struct PipeReader<R> {
    lines: Lines<BufReader<R>>,
}

impl PipeReader<pipe::Receiver> {
    /// Attach to this process's stdin, which the supervisor made a pipe.
    pub fn from_stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::new(pipe::Receiver::from_owned_fd(fd)?))
    }
}

impl<R: AsyncRead + Unpin> PipeReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    pub async fn next_event(&mut self, wait: Duration) -> io::Result<PipeEvent> {
        match timeout(wait, self.lines.next_line()).await {
            Err(_) => Ok(PipeEvent::Idle),
            Ok(Ok(Some(line))) => Ok(PipeEvent::Frame(line)),
            Ok(Ok(None)) => Ok(PipeEvent::Closed),
            Ok(Err(error)) => Err(error),
        }
    }
}
