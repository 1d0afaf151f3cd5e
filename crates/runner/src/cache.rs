//! The per-participant on-disk history cache.
//!
//! One append-only jsonl file per `(match, participant)` pair holds that
//! participant's completed scored trials, so the scorer does not refetch a
//! long history on every iteration. The store stays the source of truth:
//! the cache is a local accelerator whose buffer is always a prefix of the
//! durable success series, and it is written only after the corresponding
//! score record is committed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// One completed trial: both a cache line and the wire form the indicator
/// container receives in its history array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_no: String,
    pub objective: Value,
    pub constraint: Value,
    pub info: Value,
    pub score: Value,
    pub feasible: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to read the cache")]
    Read(#[source] anyhow::Error),
    #[error("failed to write to the cache")]
    Write(#[source] anyhow::Error),
    #[error("no cache file loaded")]
    NotLoaded,
}

pub struct Cache {
    directory: PathBuf,
    loaded: Option<String>,
    values: Vec<Trial>,
}

impl Cache {
    /// Cache under the user's home directory.
    pub fn open_default() -> Result<Self, CacheError> {
        let home = dirs::home_dir()
            .ok_or_else(|| CacheError::Read(anyhow::anyhow!("no home directory")))?;
        Self::open(home.join(".optarena-runner").join("cache"))
    }

    /// Cache rooted at an explicit directory.
    pub fn open(directory: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&directory).map_err(|err| {
            CacheError::Write(anyhow::Error::new(err).context(format!(
                "creating cache directory {}",
                directory.display()
            )))
        })?;
        Ok(Self {
            directory,
            loaded: None,
            values: Vec::new(),
        })
    }

    /// Switch the in-memory buffer to `name`, reading any persisted lines.
    /// Reloading the currently loaded name is a no-op.
    pub fn load(&mut self, name: &str) -> Result<(), CacheError> {
        if self.loaded.as_deref() == Some(name) {
            return Ok(());
        }
        self.loaded = Some(name.to_string());
        self.values.clear();

        let path = self.file_path(name);
        if !path.exists() {
            return Ok(());
        }
        let file = std::fs::File::open(&path).map_err(|err| CacheError::Read(err.into()))?;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| CacheError::Read(err.into()))?;
            let trial = serde_json::from_str(&line).map_err(|err| CacheError::Read(err.into()))?;
            self.values.push(trial);
        }
        Ok(())
    }

    /// Append one completed trial to the loaded file and the buffer.
    pub fn append(&mut self, trial: Trial) -> Result<(), CacheError> {
        let name = self.loaded.clone().ok_or(CacheError::NotLoaded)?;
        let path = self.file_path(&name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| CacheError::Write(err.into()))?;
        let line = serde_json::to_string(&trial).map_err(|err| CacheError::Write(err.into()))?;
        writeln!(file, "{line}").map_err(|err| CacheError::Write(err.into()))?;
        self.values.push(trial);
        Ok(())
    }

    /// The buffered trials, in ascending trial order by construction.
    pub fn values(&self) -> Result<&[Trial], CacheError> {
        if self.loaded.is_none() {
            return Err(CacheError::NotLoaded);
        }
        Ok(&self.values)
    }

    /// Forget the loaded file, removing it from disk if present.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        if let Some(name) = self.loaded.take() {
            let path = self.file_path(&name);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|err| CacheError::Write(err.into()))?;
            }
        }
        self.values.clear();
        Ok(())
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.jsonl"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn trial(n: u64) -> Trial {
        Trial {
            trial_no: format!("{n:05}"),
            objective: json!([0.5]),
            constraint: Value::Null,
            info: json!({}),
            score: json!(0.5),
            feasible: None,
        }
    }

    #[test]
    fn appends_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path().to_path_buf()).unwrap();

        cache.load("M1#P1").unwrap();
        cache.append(trial(1)).unwrap();
        cache.append(trial(2)).unwrap();

        let mut reopened = Cache::open(dir.path().to_path_buf()).unwrap();
        reopened.load("M1#P1").unwrap();
        assert_eq!(reopened.values().unwrap(), &[trial(1), trial(2)]);
    }

    #[test]
    fn reloading_the_same_name_keeps_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path().to_path_buf()).unwrap();

        cache.load("M1#P1").unwrap();
        cache.append(trial(1)).unwrap();
        cache.load("M1#P1").unwrap();
        assert_eq!(cache.values().unwrap().len(), 1);

        // A different name switches the buffer.
        cache.load("M1#P2").unwrap();
        assert!(cache.values().unwrap().is_empty());
    }

    #[test]
    fn append_without_load_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path().to_path_buf()).unwrap();
        assert!(matches!(cache.append(trial(1)), Err(CacheError::NotLoaded)));
    }

    #[test]
    fn clear_forgets_and_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path().to_path_buf()).unwrap();

        cache.load("M1#P1").unwrap();
        cache.append(trial(1)).unwrap();
        cache.clear().unwrap();

        assert!(matches!(cache.values(), Err(CacheError::NotLoaded)));
        assert!(!dir.path().join("M1#P1.jsonl").exists());
    }
}
