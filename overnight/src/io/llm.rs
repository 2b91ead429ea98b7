//! Local LLM adapter used by the prompt refiner.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

use crate::core::types::ModelId;
use crate::io::process::run_command_with_timeout;

const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Completes a prompt with a locally-hosted model. Seam for tests.
pub trait LocalModel {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Optional remote collaborator consulted during prompt drafting. Only
/// wired in when explicitly enabled in config; production runs pass no
/// provider by default.
pub trait SearchProvider {
    fn search(&self, query: &str) -> Result<String>;
}

/// Pipes the prompt to `ollama run <model>` over stdin.
#[derive(Debug)]
pub struct OllamaCli {
    model: ModelId,
    timeout: Duration,
}

impl OllamaCli {
    pub fn new(model: ModelId, timeout: Duration) -> Self {
        Self { model, timeout }
    }
}

impl LocalModel for OllamaCli {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new("ollama");
        cmd.arg("run").arg(self.model.as_str());
        let out = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            OUTPUT_LIMIT_BYTES,
            None,
        )
        .with_context(|| format!("run ollama model {}", self.model))?;

        if out.timed_out {
            bail!("ollama run {} timed out", self.model);
        }
        if !out.status.success() {
            bail!(
                "ollama run {} failed: {}",
                self.model,
                out.stderr_lossy().trim()
            );
        }
        let text = out.stdout_lossy().trim().to_string();
        debug!(response_len = text.len(), "local model responded");
        Ok(text)
    }
}
