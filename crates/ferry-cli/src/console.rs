use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;
use ferry_plugin_sdk::{Build, Ui};

/// Host-side [`Ui`] writing to the terminal. Errors go to stderr.
pub struct ConsoleUi;

#[async_trait]
impl Ui for ConsoleUi {
    async fn say(&self, message: &str) -> Result<()> {
        writeln!(std::io::stdout().lock(), "==> {message}")?;
        Ok(())
    }

    async fn message(&self, message: &str) -> Result<()> {
        writeln!(std::io::stdout().lock(), "    {message}")?;
        Ok(())
    }

    async fn error(&self, message: &str) -> Result<()> {
        writeln!(std::io::stderr().lock(), "!!  {message}")?;
        Ok(())
    }
}

/// Host-side [`Build`] that names the build and logs progress.
pub struct ConsoleBuild {
    name: String,
}

impl ConsoleBuild {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Build for ConsoleBuild {
    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn progress(&self, step: &str) -> Result<()> {
        tracing::info!(build = %self.name, step, "build progress");
        Ok(())
    }
}
