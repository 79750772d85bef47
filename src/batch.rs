//! Batch processing of many exports
//!
//! Each input file runs an isolated pipeline on a worker pool. A failing
//! file is recorded in the report and never affects its siblings.

use crate::cache::StageCache;
use crate::config::PipelineConfig;
use crate::encoder::TableEncoder;
use crate::error::ComputeError;
use crate::pipeline::{file_identifier, Pipeline};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where the batch finds its input files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchInput {
    /// Every `*.csv` file directly inside a directory
    Directory(PathBuf),
    /// A text file with one input path per line
    Manifest(PathBuf),
}

impl BatchInput {
    /// Directory when `path` is one, manifest otherwise
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            BatchInput::Directory(path)
        } else {
            BatchInput::Manifest(path)
        }
    }

    /// Input files, plus outcomes for manifest entries that are not files
    pub fn resolve(&self) -> Result<(Vec<PathBuf>, Vec<FileOutcome>), ComputeError> {
        match self {
            BatchInput::Directory(dir) => {
                let mut files: Vec<PathBuf> = fs::read_dir(dir)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && p.extension().map_or(false, |e| e == "csv"))
                    .collect();
                files.sort();
                Ok((files, Vec::new()))
            }
            BatchInput::Manifest(manifest) => {
                let base = manifest.parent().unwrap_or_else(|| Path::new("."));
                let text = fs::read_to_string(manifest)?;
                let mut files = Vec::new();
                let mut skipped = Vec::new();
                let mut seen = HashSet::new();
                for line in text.lines().map(str::trim) {
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let path = base.join(line);
                    if path.is_file() {
                        let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
                        if seen.insert(canonical) {
                            files.push(path);
                        } else {
                            warn!(path = %path.display(), "Duplicate manifest entry; skipped");
                            skipped.push(FileOutcome::Skipped {
                                path,
                                reason: "duplicate manifest entry".to_string(),
                            });
                        }
                    } else {
                        warn!(path = %path.display(), "Manifest entry is not a file; skipped");
                        skipped.push(FileOutcome::Skipped {
                            path,
                            reason: "not a readable file".to_string(),
                        });
                    }
                }
                Ok((files, skipped))
            }
        }
    }
}

/// Result of one input file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Succeeded {
        identifier: String,
        path: PathBuf,
        run_id: Uuid,
        dose_rows: usize,
        flagged: usize,
        output_dir: PathBuf,
    },
    Failed {
        identifier: String,
        path: PathBuf,
        kind: String,
        message: String,
    },
    Skipped {
        path: PathBuf,
        reason: String,
    },
}

/// Outcome of a whole batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<FileOutcome>,
}

impl BatchReport {
    fn from_outcomes(outcomes: Vec<FileOutcome>) -> Self {
        let count = |f: fn(&FileOutcome) -> bool| outcomes.iter().filter(|o| f(o)).count();
        Self {
            total: outcomes.len(),
            succeeded: count(|o| matches!(o, FileOutcome::Succeeded { .. })),
            failed: count(|o| matches!(o, FileOutcome::Failed { .. })),
            skipped: count(|o| matches!(o, FileOutcome::Skipped { .. })),
            outcomes,
        }
    }
}

/// Runs the pipeline over many files in parallel
pub struct BatchRunner {
    config: PipelineConfig,
    out_dir: PathBuf,
    workers: Option<usize>,
    cache_dir: Option<PathBuf>,
}

impl BatchRunner {
    pub fn new(config: PipelineConfig, out_dir: impl Into<PathBuf>) -> Result<Self, ComputeError> {
        config.validate()?;
        Ok(Self {
            config,
            out_dir: out_dir.into(),
            workers: None,
            cache_dir: None,
        })
    }

    /// Worker count; defaults to the available parallelism
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn run(&self, input: &BatchInput) -> Result<BatchReport, ComputeError> {
        let (files, mut outcomes) = input.resolve()?;
        info!(files = files.len(), skipped = outcomes.len(), "Batch started");

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = self.workers {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| ComputeError::Configuration(format!("cannot start worker pool: {e}")))?;

        let identifiers = unique_identifiers(&files);
        let processed: Vec<FileOutcome> = pool.install(|| {
            files
                .par_iter()
                .zip(identifiers)
                .map(|(path, identifier)| self.process_file(path, identifier))
                .collect()
        });
        outcomes.extend(processed);

        let report = BatchReport::from_outcomes(outcomes);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Batch finished"
        );
        Ok(report)
    }

    fn process_file(&self, path: &Path, identifier: String) -> FileOutcome {
        match self.run_one(path, &identifier) {
            Ok((run_id, dose_rows, flagged, output_dir)) => FileOutcome::Succeeded {
                identifier,
                path: path.to_path_buf(),
                run_id,
                dose_rows,
                flagged,
                output_dir,
            },
            Err(e) => {
                error!(identifier, kind = e.kind(), error = %e, "File failed");
                FileOutcome::Failed {
                    identifier,
                    path: path.to_path_buf(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    fn run_one(
        &self,
        path: &Path,
        identifier: &str,
    ) -> Result<(Uuid, usize, usize, PathBuf), ComputeError> {
        let mut pipeline = Pipeline::new(self.config.clone())?;
        if let Some(dir) = &self.cache_dir {
            pipeline = pipeline.with_cache(StageCache::open(dir)?);
        }
        let bytes = fs::read(path)?;
        let output = pipeline.run_bytes(identifier, &bytes)?;

        let encoder = TableEncoder::new(&self.out_dir);
        encoder.write(&output)?;

        let flagged = output.reviews.iter().map(|r| r.flagged.len()).sum();
        Ok((
            output.summary.run_id,
            output.features.rows.len(),
            flagged,
            encoder.run_dir(&output.summary.identifier),
        ))
    }
}

/// One run identifier per file: the file stem, suffixed with a short path
/// hash when several files share a stem
fn unique_identifiers(files: &[PathBuf]) -> Vec<String> {
    let stems: Vec<String> = files.iter().map(|p| file_identifier(p)).collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *counts.entry(stem.as_str()).or_default() += 1;
    }
    files
        .iter()
        .zip(&stems)
        .map(|(path, stem)| {
            if counts.get(stem.as_str()).copied().unwrap_or(0) > 1 {
                let digest = hex::encode(Sha256::digest(path.to_string_lossy().as_bytes()));
                format!("{stem}-{}", &digest[..8])
            } else {
                stem.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::{temp_basals, three_day_export};
    use tempfile::TempDir;

    fn write_inputs(dir: &Path) {
        fs::write(dir.join("alice.csv"), three_day_export()).unwrap();
        fs::write(dir.join("bob.csv"), three_day_export() + &temp_basals()).unwrap();
        fs::write(dir.join("broken.csv"), "type,value\ncbg,5.0\n").unwrap();
        fs::write(dir.join("notes.txt"), "not an export").unwrap();
    }

    #[test]
    fn test_directory_batch_isolates_failures() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_inputs(input.path());

        let report = BatchRunner::new(PipelineConfig::default(), out.path())
            .unwrap()
            .with_workers(2)
            .run(&BatchInput::from_path(input.path()))
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);

        let failed = report
            .outcomes
            .iter()
            .find_map(|o| match o {
                FileOutcome::Failed {
                    identifier, kind, ..
                } => Some((identifier.clone(), kind.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(failed, ("broken".to_string(), "DATA_FORMAT_ERROR".to_string()));

        assert!(out.path().join("alice").join("summary.json").exists());
        assert!(out.path().join("bob").join("abnormal_basals.csv").exists());
    }

    #[test]
    fn test_manifest_skips_invalid_paths() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_inputs(input.path());
        let manifest = input.path().join("inputs.txt");
        fs::write(&manifest, "# exports\nalice.csv\n\nmissing.csv\n").unwrap();

        let report = BatchRunner::new(PipelineConfig::default(), out.path())
            .unwrap()
            .run(&BatchInput::from_path(&manifest))
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 1);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["status"], "skipped");
    }

    #[test]
    fn test_duplicate_stems_get_distinct_outputs() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        for sub in ["a", "b"] {
            fs::create_dir(input.path().join(sub)).unwrap();
            fs::write(input.path().join(sub).join("export.csv"), three_day_export()).unwrap();
        }
        let manifest = input.path().join("inputs.txt");
        fs::write(&manifest, "a/export.csv\nb/export.csv\na/export.csv\n").unwrap();

        let report = BatchRunner::new(PipelineConfig::default(), out.path())
            .unwrap()
            .run(&BatchInput::from_path(&manifest))
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.skipped, 1);
        let dirs: HashSet<PathBuf> = report
            .outcomes
            .iter()
            .filter_map(|o| match o {
                FileOutcome::Succeeded { output_dir, .. } => Some(output_dir.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(dirs.len(), 2);
        for dir in &dirs {
            assert!(dir.join("summary.json").exists());
            let name = dir.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("export-") && name.len() == "export-".len() + 8);
        }
    }

    #[test]
    fn test_identical_inputs_share_cache_in_parallel() {
        let input = TempDir::new().unwrap();
        for i in 0..12 {
            fs::write(input.path().join(format!("copy{i:02}.csv")), three_day_export()).unwrap();
        }
        for _ in 0..3 {
            let out = TempDir::new().unwrap();
            let cache = TempDir::new().unwrap();
            let report = BatchRunner::new(PipelineConfig::default(), out.path())
                .unwrap()
                .with_workers(12)
                .with_cache_dir(cache.path())
                .run(&BatchInput::from_path(input.path()))
                .unwrap();
            assert_eq!(report.succeeded, 12, "{:?}", report.outcomes);
        }
    }

    #[test]
    fn test_batch_shares_cache() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        fs::write(input.path().join("alice.csv"), three_day_export()).unwrap();

        let runner = BatchRunner::new(PipelineConfig::default(), out.path())
            .unwrap()
            .with_cache_dir(cache.path());
        let first = runner.run(&BatchInput::from_path(input.path())).unwrap();
        let entries = fs::read_dir(cache.path()).unwrap().count();
        let second = runner.run(&BatchInput::from_path(input.path())).unwrap();

        assert_eq!(first.succeeded, 1);
        assert_eq!(second.succeeded, 1);
        assert_eq!(fs::read_dir(cache.path()).unwrap().count(), entries);
    }
}
