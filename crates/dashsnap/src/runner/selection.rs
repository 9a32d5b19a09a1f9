//! Incremental test selection.
//!
//! Maps version-control changes onto affected pages through a caller
//! provided dependency map, then adds a sampled fraction of unchanged
//! pages for regression coverage. Sampling is seeded from the current
//! commit so repeated runs on the same commit select the same pages.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::vcs::VersionControl;

/// Configuration for incremental selection.
#[derive(Debug, Clone)]
pub struct IncrementalConfig {
    /// Version-control ref the working tree is diffed against.
    pub base: String,
    /// Changed file → affected page ids. Files absent from the map fall
    /// back to the identity mapping: the file path itself names the page.
    pub dependency_map: HashMap<PathBuf, Vec<String>>,
    /// Fraction of unchanged pages sampled into the run anyway.
    pub sample_fraction: f64,
}

impl IncrementalConfig {
    pub fn against(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            dependency_map: HashMap::new(),
            sample_fraction: 0.10,
        }
    }

    pub fn with_dependency(mut self, file: impl Into<PathBuf>, pages: Vec<String>) -> Self {
        self.dependency_map.insert(file.into(), pages);
        self
    }
}

/// Why each page was selected or skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSelection {
    /// Page ids to run, in input order.
    pub selected: Vec<String>,
    /// Page ids excluded from this run.
    pub skipped: Vec<String>,
    /// Page id → human-readable reason.
    pub reasons: HashMap<String, String>,
}

/// Choose which of `page_ids` to run given the changes since `base`.
pub fn select_pages(
    page_ids: &[String],
    vcs: &Arc<dyn VersionControl>,
    config: &IncrementalConfig,
) -> Result<TestSelection> {
    let changed_files = vcs.diff_files(&config.base)?;

    let mut affected: HashSet<String> = HashSet::new();
    for file in &changed_files {
        match config.dependency_map.get(file) {
            Some(pages) => affected.extend(pages.iter().cloned()),
            // Identity mapping: a changed file names its own page
            None => {
                affected.insert(file.to_string_lossy().into_owned());
            }
        }
    }

    // Commit-seeded sampling keeps reruns of the same commit deterministic
    let commit = vcs.current_commit()?;
    let mut hasher = Sha256::new();
    hasher.update(commit.as_bytes());
    let seed: [u8; 32] = hasher.finalize().into();
    let mut rng = StdRng::from_seed(seed);

    let mut selection = TestSelection {
        selected: Vec::new(),
        skipped: Vec::new(),
        reasons: HashMap::new(),
    };

    for id in page_ids {
        if affected.contains(id) {
            selection.selected.push(id.clone());
            selection
                .reasons
                .insert(id.clone(), format!("affected by changes since {}", config.base));
        } else if config.sample_fraction > 0.0 && rng.gen::<f64>() < config.sample_fraction {
            selection.selected.push(id.clone());
            selection
                .reasons
                .insert(id.clone(), "sampled for regression coverage".to_string());
        } else {
            selection.skipped.push(id.clone());
            selection
                .reasons
                .insert(id.clone(), "unchanged".to_string());
        }
    }

    Ok(selection)
}
