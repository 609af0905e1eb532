use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".sessionview"))
            .unwrap_or_else(|| PathBuf::from(".sessionview"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Where the CLI writes last-frame captures when no explicit path is given.
    pub fn captures_dir(&self) -> PathBuf {
        self.base.join("captures")
    }

    pub fn capture_file(&self, token_prefix: &str) -> PathBuf {
        let safe = token_prefix.replace([':', '/', '\\'], "_");
        self.captures_dir().join(format!("{}.png", safe))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.captures_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
