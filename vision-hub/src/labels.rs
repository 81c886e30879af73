//! Human readable class names, one per line in output index order.

use std::{fs, path::Path};

use anyhow::Context;

/// Class names of a `synset.txt` file: `<wnid> <label>` per line, the label being everything
/// after the first space. Lines without a space are taken whole.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Synset {
    labels: Vec<String>,
}

impl Synset {
    pub fn parse(content: &str) -> Self {
        let labels = content
            .lines()
            .map(|line| {
                let line = line.trim_end_matches('\r');
                match line.split_once(' ') {
                    Some((_, label)) => label.to_string(),
                    None => line.to_string(),
                }
            })
            .collect();
        Self { labels }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("reading labels {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
