use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait Orchestrator {
    fn submit(&mut self, template: &str, params: &BTreeMap<String, String>) -> Result<JobHandle>;
}

#[derive(Debug, Clone)]
pub struct CommandOrchestrator {
    argv: Vec<String>,
}

impl CommandOrchestrator {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(anyhow!(sweep_core::SweepError::configuration(
                "submit-command must name a program"
            )));
        }
        Ok(Self { argv })
    }

    pub fn command_line(&self, template: &str, params: &BTreeMap<String, String>) -> Vec<String> {
        let mut out: Vec<String> = self
            .argv
            .iter()
            .map(|a| a.replace("{template}", template))
            .collect();
        for (k, v) in params {
            out.push("-p".to_string());
            out.push(format!("{}={}", k, v));
        }
        out
    }
}

impl Orchestrator for CommandOrchestrator {
    fn submit(&mut self, template: &str, params: &BTreeMap<String, String>) -> Result<JobHandle> {
        let line = self.command_line(template, params);
        debug!(command = %shell_join(&line), "submitting");
        let output = Command::new(&line[0])
            .args(&line[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| anyhow!("failed to start {}: {}", line[0], e))?;
        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("orchestrator client exited without a diagnostic")
                .to_string();
            let status = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(anyhow!("exit status {}: {}", status, stderr_tail));
        }
        let handle = String::from_utf8_lossy(&output.stdout)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "submitted".to_string());
        Ok(JobHandle(handle))
    }
}

#[derive(Debug, Clone)]
pub struct DryRunOrchestrator {
    inner: CommandOrchestrator,
    count: usize,
}

impl DryRunOrchestrator {
    pub fn new(inner: CommandOrchestrator) -> Self {
        Self { inner, count: 0 }
    }
}

impl Orchestrator for DryRunOrchestrator {
    fn submit(&mut self, template: &str, params: &BTreeMap<String, String>) -> Result<JobHandle> {
        self.count += 1;
        let line = self.inner.command_line(template, params);
        info!(command = %shell_join(&line), "dry run, not submitted");
        Ok(JobHandle(format!("dry-run-{}", self.count)))
    }
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
