use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_FILE: &str = "run.json";

/// What a fine-tuning run consumed and produced, stored beside the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    timestamp: String,
    base_model: String,
    dataset: String,
    records: usize,
    epochs: usize,
    training_duration: Option<String>,
    final_loss: Option<f64>,
}

impl RunMetadata {
    pub fn new(base_model: &Path, dataset: &Path, records: usize, epochs: usize) -> Self {
        Self {
            timestamp: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            base_model: base_model.display().to_string(),
            dataset: dataset.display().to_string(),
            records,
            epochs,
            training_duration: None,
            final_loss: None,
        }
    }

    pub fn run_path(dir: &Path) -> PathBuf {
        dir.join(RUN_FILE)
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(Self::run_path(dir), content)
    }

    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(Self::run_path(dir))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn get_timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn get_base_model(&self) -> &str {
        &self.base_model
    }

    pub fn get_records(&self) -> usize {
        self.records
    }

    pub fn get_epochs(&self) -> usize {
        self.epochs
    }

    pub fn get_duration(&self) -> &Option<String> {
        &self.training_duration
    }

    pub fn get_final_loss(&self) -> Option<f64> {
        self.final_loss
    }

    pub fn set_duration(&mut self, duration: String) {
        self.training_duration = Some(duration);
    }

    pub fn set_final_loss(&mut self, loss: f64) {
        self.final_loss = Some(loss);
    }
}

pub struct RunEntry {
    pub dir: PathBuf,
    pub metadata: RunMetadata,
}

/// Fine-tuned model directories directly under `root`, newest first.
pub fn list_runs(root: &Path) -> std::io::Result<Vec<RunEntry>> {
    let mut runs = Vec::new();

    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match RunMetadata::load(&path) {
            Ok(metadata) => runs.push(RunEntry {
                dir: path,
                metadata,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(dir = %path.display(), %err, "skipping unreadable run"),
        }
    }

    runs.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
    Ok(runs)
}

/// True when `dir` exists and holds at least one entry.
pub fn is_non_empty_dir(dir: &Path) -> std::io::Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_runs_newest_first() {
        let root = tempfile::tempdir().unwrap();

        for (name, timestamp) in [("old", "20240101_000000"), ("new", "20250101_000000")] {
            let dir = root.path().join(name);
            fs::create_dir(&dir).unwrap();
            let mut metadata = RunMetadata::new(Path::new("base"), Path::new("data.json"), 4, 3);
            metadata.timestamp = timestamp.to_string();
            metadata.set_final_loss(1.5);
            metadata.save(&dir).unwrap();
        }
        fs::create_dir(root.path().join("not_a_run")).unwrap();
        fs::write(root.path().join("stray.txt"), "x").unwrap();

        let runs = list_runs(root.path()).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].dir.ends_with("new"));
        assert_eq!(runs[1].metadata.get_timestamp(), "20240101_000000");
        assert_eq!(runs[0].metadata.get_final_loss(), Some(1.5));
    }

    #[test]
    fn test_is_non_empty_dir() {
        let root = tempfile::tempdir().unwrap();
        assert!(!is_non_empty_dir(root.path()).unwrap());
        assert!(!is_non_empty_dir(&root.path().join("missing")).unwrap());

        fs::write(root.path().join("file"), "x").unwrap();
        assert!(is_non_empty_dir(root.path()).unwrap());
    }
}
