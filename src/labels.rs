use std::path::Path;

use anyhow::Context;

/// Class names indexed by model output position.
#[derive(Debug, Clone)]
pub struct Labels {
    names: Vec<String>,
    unknown: String,
}

impl Labels {
    pub fn load(path: impl AsRef<Path>, unknown: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read labels {}", path.display()))?;
        Ok(Self::from_lines(text.lines(), unknown))
    }

    pub fn from_lines<I, S>(lines: I, unknown: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: lines.into_iter().map(|l| l.as_ref().trim_end().to_string()).collect(),
            unknown: unknown.to_string(),
        }
    }

    pub fn get(&self, idx: usize) -> &str {
        self.names.get(idx).map(String::as_str).unwrap_or(&self.unknown)
    }

    pub fn unknown(&self) -> &str {
        &self.unknown
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
