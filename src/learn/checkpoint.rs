use super::optimizer::Adam;
use crate::{nn::Network, result::Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// State that can be written to and read from a file.
pub trait Checkpointable {
    /// Writes the state to `path`.
    fn save_state(&self, path: &Path) -> Result<()>;
    /// Reads the state from `path`.
    fn load_state(&mut self, path: &Path) -> Result<()>;
}

impl<L> Checkpointable for Network<L> {
    fn save_state(&self, path: &Path) -> Result<()> {
        self.save(path)
    }
    fn load_state(&mut self, path: &Path) -> Result<()> {
        self.load(path)
    }
}

impl Checkpointable for Adam {
    fn save_state(&self, path: &Path) -> Result<()> {
        self.save(path)
    }
    fn load_state(&mut self, path: &Path) -> Result<()> {
        self.load(path)
    }
}

/// Contents of the index file.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    /// The most recent checkpoint.
    pub latest: Option<String>,
    /// All checkpoints, oldest first.
    pub all: Vec<String>,
}

/// A directory of numbered checkpoints.
///
/// Each save writes `{prefix}-{n}.{part}.safetensors` for every part and records `{prefix}-{n}`
/// in the json index file "checkpoint".
#[derive(Clone, Debug)]
pub struct Checkpoint {
    dir: PathBuf,
    prefix: String,
}

impl Checkpoint {
    /// The file name of the index.
    pub const INDEX: &'static str = "checkpoint";

    /// Creates a checkpoint in `dir`. The directory is created on the first save.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }
    /// The directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
    fn part_path(&self, name: &str, part: &str) -> PathBuf {
        self.dir.join(format!("{name}.{part}.safetensors"))
    }
    /// Reads the index, which is empty if the directory has no checkpoints.
    pub fn index(&self) -> Result<CheckpointIndex> {
        let path = self.dir.join(Self::INDEX);
        if !path.exists() {
            return Ok(CheckpointIndex::default());
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("failed to parse {}", path.display()))
    }
    fn number(&self, name: &str) -> Option<usize> {
        name.strip_prefix(&self.prefix)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }
    /// Saves all `parts` as the next checkpoint.
    ///
    /// Returns the name of the checkpoint, ie "ckpt-3".
    pub fn save(&self, parts: &[(&str, &dyn Checkpointable)]) -> Result<String> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let mut index = self.index()?;
        let n = index
            .all
            .iter()
            .filter_map(|name| self.number(name))
            .max()
            .unwrap_or(0)
            + 1;
        let name = format!("{}-{n}", self.prefix);
        for (part, state) in parts {
            state.save_state(&self.part_path(&name, part))?;
        }
        index.all.push(name.clone());
        index.latest = Some(name.clone());
        let path = self.dir.join(Self::INDEX);
        fs::write(&path, serde_json::to_string_pretty(&index)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(checkpoint = %name, dir = %self.dir.display(), "saved checkpoint");
        Ok(name)
    }
    /// Restores all `parts` from the latest checkpoint.
    ///
    /// Returns the name of the restored checkpoint, or None if there is none.
    ///
    /// **Errors**
    /// - A part file is missing or does not match the state.
    pub fn restore_latest(
        &self,
        parts: &mut [(&str, &mut dyn Checkpointable)],
    ) -> Result<Option<String>> {
        let Some(name) = self.index()?.latest else {
            return Ok(None);
        };
        for (part, state) in parts.iter_mut() {
            let path = self.part_path(&name, part);
            if !path.exists() {
                bail!("checkpoint part {} not found!", path.display());
            }
            state.load_state(&path)?;
        }
        info!(checkpoint = %name, dir = %self.dir.display(), "restored checkpoint");
        Ok(Some(name))
    }
}
