//! In-memory gateway that records invocations instead of spawning processes
//!
//! Used by the test suites and by the CLI's `--dry-run` mode.

use super::{ToolGateway, ToolOutput};
use crate::error::RelayResult;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

type Handler = dyn Fn(&str, &[String]) -> ToolOutput + Send + Sync;

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCall {
    /// The invocation as a shell-like line
    pub fn line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

pub struct ScriptedGateway {
    handler: Box<Handler>,
    calls: Mutex<Vec<ToolCall>>,
    unavailable: Mutex<HashSet<String>>,
}

impl ScriptedGateway {
    /// Answer every invocation through `handler`
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> ToolOutput + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    /// Every invocation succeeds with empty output
    pub fn succeeding() -> Self {
        Self::new(|_, _| ToolOutput::ok(""))
    }

    /// Make `is_available(binary)` report false
    pub fn mark_unavailable(&self, binary: &str) {
        if let Ok(mut set) = self.unavailable.lock() {
            set.insert(binary.to_string());
        }
    }

    /// Make `is_available(binary)` report true again
    pub fn mark_available(&self, binary: &str) {
        if let Ok(mut set) = self.unavailable.lock() {
            set.remove(binary);
        }
    }

    /// Snapshot of all recorded invocations, oldest first
    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Recorded invocations rendered as command lines
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(ToolCall::line).collect()
    }

    /// Number of recorded invocations of `program`
    pub fn count(&self, program: &str) -> usize {
        self.calls().iter().filter(|c| c.program == program).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

#[async_trait]
impl ToolGateway for ScriptedGateway {
    async fn run(&self, program: &str, args: &[&str]) -> RelayResult<ToolOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = (self.handler)(program, &args);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ToolCall {
                program: program.to_string(),
                args,
            });
        }
        Ok(output)
    }

    async fn is_available(&self, binary: &str) -> bool {
        self.unavailable
            .lock()
            .map(|set| !set.contains(binary))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let gateway = ScriptedGateway::new(|program, args| {
            if program == "echo" {
                ToolOutput::ok(args.join(" "))
            } else {
                ToolOutput::failed(127, "not found")
            }
        });

        let out = gateway.run("echo", &["a", "b"]).await.unwrap();
        assert_eq!(out.stdout, "a b");
        let out = gateway.run("missing", &[]).await.unwrap();
        assert!(!out.success());

        assert_eq!(gateway.lines(), vec!["echo a b".to_string(), "missing".to_string()]);
        assert_eq!(gateway.count("echo"), 1);

        gateway.clear();
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_availability_toggle() {
        let gateway = ScriptedGateway::succeeding();
        assert!(gateway.is_available("warp-cli").await);
        gateway.mark_unavailable("warp-cli");
        assert!(!gateway.is_available("warp-cli").await);
        gateway.mark_available("warp-cli");
        assert!(gateway.is_available("warp-cli").await);
    }
}
