//! Command lines for the transmission and relay binaries.

use std::path::Path;

/// Container format written to every destination.
const CONTAINER_FORMAT: &str = "mpegts";

/// Program plus arguments, kept for logging and for respawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Transmit one looping source to a single destination.
    pub fn transmit(binary: &str, source: &Path, destination: &str) -> Self {
        let mut args = input_args(source);
        args.extend(output_args(destination));
        args.extend(diagnostic_args());
        Self::new(binary, args)
    }

    /// Read the source once and write one output per local relay port.
    pub fn splitter(binary: &str, source: &Path, relay_ports: &[u16]) -> Self {
        let mut args = input_args(source);
        for port in relay_ports {
            args.extend(output_args(&loopback_caller(*port)));
        }
        args.extend(diagnostic_args());
        Self::new(binary, args)
    }

    /// Remote leg of a branch: listen on `port` and push to the destination as a caller.
    pub fn remote_relay(binary: &str, port: u16, destination: &str) -> Self {
        Self::new(binary, [listener(port), caller_mode(destination)])
    }

    /// Local leg of a branch: listen on `port` and forward to the remote leg.
    pub fn local_relay(binary: &str, port: u16, remote_port: u16) -> Self {
        Self::new(binary, [listener(port), loopback_caller(remote_port)])
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn input_args(source: &Path) -> Vec<String> {
    vec![
        "-re".to_string(),
        "-stream_loop".to_string(),
        "-1".to_string(),
        "-i".to_string(),
        source.to_string_lossy().to_string(),
    ]
}

fn output_args(destination: &str) -> Vec<String> {
    vec![
        "-aspect".to_string(),
        "16:9".to_string(),
        "-ar".to_string(),
        "48000".to_string(),
        "-f".to_string(),
        CONTAINER_FORMAT.to_string(),
        destination.trim().to_string(),
    ]
}

fn diagnostic_args() -> Vec<String> {
    vec![
        "-progress".to_string(),
        "pipe:2".to_string(),
        "-loglevel".to_string(),
        "info".to_string(),
    ]
}

fn listener(port: u16) -> String {
    format!("srt://:{port}?mode=listener")
}

fn loopback_caller(port: u16) -> String {
    format!("srt://127.0.0.1:{port}?mode=caller")
}

/// Force caller mode on SRT destinations that do not specify a mode.
fn caller_mode(destination: &str) -> String {
    let destination = destination.trim();
    if !destination.starts_with("srt://") || destination.contains("mode=") {
        return destination.to_string();
    }
    let separator = if destination.contains('?') { '&' } else { '?' };
    format!("{destination}{separator}mode=caller")
}
