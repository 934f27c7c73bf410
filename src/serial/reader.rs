//! Deadline-polled line reading on top of a [`SerialTransport`].
use std::time::{Duration, Instant};

use super::{Result, SerialError, SerialTransport};

// Keeps a device that never sends a newline from growing the buffer without bound
const PARTIAL_LIMIT: usize = 8192;
const PARTIAL_KEEP: usize = 4096;

/// Completion rule for a command response.
#[derive(Debug, Clone)]
pub enum ResponseMatcher {
    UntilPrefix(&'static str),
    Contains(&'static str),
    EqualsIgnoreCase(&'static str),
    Custom(fn(&[String]) -> bool),
}

impl ResponseMatcher {
    pub fn is_complete(&self, lines: &[String]) -> bool {
        match self {
            ResponseMatcher::UntilPrefix(p) => lines.iter().any(|l| l.starts_with(p)),
            ResponseMatcher::Contains(s) => lines.iter().any(|l| l.contains(s)),
            ResponseMatcher::EqualsIgnoreCase(s) => lines.iter().any(|l| l.eq_ignore_ascii_case(s)),
            ResponseMatcher::Custom(f) => f(lines),
        }
    }
}

/// What to wait for after writing one command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub timeout: Duration,
    pub matcher: ResponseMatcher,
    /// Tokens the device sends to refuse a command; seeing one ends the wait early.
    pub failure_tokens: &'static [&'static str],
}

impl CommandSpec {
    pub fn new(name: &'static str, timeout: Duration, matcher: ResponseMatcher) -> Self {
        Self {
            name,
            timeout,
            matcher,
            failure_tokens: &[],
        }
    }

    pub fn failing_on(mut self, tokens: &'static [&'static str]) -> Self {
        self.failure_tokens = tokens;
        self
    }

    fn failure_in(&self, line: &str) -> bool {
        self.failure_tokens.iter().any(|t| line.contains(t))
    }
}

/// Splits the incoming byte stream into lines and waits for responses by
/// polling `bytes_to_read` between short sleeps until a deadline.
#[derive(Debug)]
pub struct LineReader {
    partial: String,
    poll_interval: Duration,
    bytes_read: u64,
}

impl LineReader {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            partial: String::new(),
            poll_interval,
            bytes_read: 0,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Drop any half-received line.
    pub fn reset(&mut self) {
        self.partial.clear();
    }

    /// Feed raw bytes and return every line they complete. Empty lines are kept,
    /// `\r\n` and `\n` both terminate a line.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.bytes_read += bytes.len() as u64;
        self.partial.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }

        if self.partial.len() > PARTIAL_LIMIT {
            let mut cut = self.partial.len() - PARTIAL_KEEP;
            while !self.partial.is_char_boundary(cut) {
                cut += 1;
            }
            self.partial.drain(..cut);
            log::warn!("Discarded unterminated serial input beyond {} bytes", PARTIAL_LIMIT);
        }

        lines
    }

    /// Read whatever is waiting right now without sleeping.
    pub fn poll_available(&mut self, transport: &mut dyn SerialTransport) -> Result<Vec<String>> {
        let waiting = transport.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; waiting.min(4096)];
        let n = transport.read(&mut buffer)?;
        Ok(self.push_bytes(&buffer[..n]))
    }

    /// Collect trimmed, non-blank lines until the matcher is satisfied, a failure
    /// token arrives, or the deadline passes.
    pub async fn read_until(&mut self, transport: &mut dyn SerialTransport, spec: &CommandSpec) -> Result<Vec<String>> {
        let deadline = Instant::now() + spec.timeout;
        let mut lines: Vec<String> = Vec::new();

        loop {
            for raw in self.poll_available(transport)? {
                let line = raw.trim();
                if line.is_empty() {
                    continue;
                }
                log::trace!("{} <- {}", spec.name, line);
                lines.push(line.to_string());

                if spec.failure_in(line) {
                    return Err(SerialError::ProtocolError(format!("{} refused: {}", spec.name, line)));
                }
                if spec.matcher.is_complete(&lines) {
                    return Ok(lines);
                }
            }

            if Instant::now() >= deadline {
                if lines.is_empty() {
                    log::warn!("Command '{}' timeout after {:?}; no lines received", spec.name, spec.timeout);
                } else {
                    log::warn!("Command '{}' timeout after {:?}; partial lines: {:?}", spec.name, spec.timeout, lines);
                }
                return Err(SerialError::Timeout);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
