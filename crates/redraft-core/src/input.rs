/// Source of the shared input text all modes operate on. The orchestrator
/// reads it once per `run_all` and caches the result for refreshes.
pub trait InputSource: Send + Sync {
    fn read(&self) -> anyhow::Result<String>;
}

/// Fixed text source (CLI `--text`, tests).
pub struct StaticSource {
    text: String,
}

impl StaticSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl InputSource for StaticSource {
    fn read(&self) -> anyhow::Result<String> {
        Ok(self.text.clone())
    }
}
