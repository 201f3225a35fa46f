//! Job manifests.
//!
//! A manifest is JSON, either a bare array of jobs or an object with a
//! `jobs` array and an optional `workers` count:
//!
//! ```json
//! {
//!   "workers": 4,
//!   "jobs": [
//!     { "kind": "clock", "name": "Sim1",
//!       "overrides": [{ "path": "[Clock].StartDate", "value": "2020-01-01" }] }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use simpool_core::JobSpec;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Jobs(Vec<JobSpec>),
    Full {
        #[serde(default)]
        workers: Option<usize>,
        jobs: Vec<JobSpec>,
    },
}

/// Parsed manifest.
#[derive(Debug)]
pub struct Manifest {
    pub workers: Option<usize>,
    pub jobs: Vec<JobSpec>,
}

impl Manifest {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let manifest = match serde_json::from_str(text)? {
            ManifestFile::Jobs(jobs) => Self { workers: None, jobs },
            ManifestFile::Full { workers, jobs } => Self { workers, jobs },
        };
        let mut seen = std::collections::HashSet::new();
        for job in &manifest.jobs {
            if !seen.insert(job.id.as_str()) {
                anyhow::bail!("duplicate job id {} in manifest", job.id);
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid manifest {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_array() {
        let manifest = Manifest::parse(r#"[{"kind": "noop", "name": "a"}, {"kind": "noop", "name": "b"}]"#).unwrap();
        assert_eq!(manifest.jobs.len(), 2);
        assert!(manifest.workers.is_none());
        assert_ne!(manifest.jobs[0].id, manifest.jobs[1].id);
    }

    #[test]
    fn test_full_form() {
        let manifest = Manifest::parse(
            r#"{"workers": 2, "jobs": [{"id": "j1", "kind": "clock", "name": "Sim",
                "overrides": [{"path": "[Clock].StartDate", "value": "2020-01-01"}]}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.workers, Some(2));
        assert_eq!(manifest.jobs[0].id, "j1");
        assert_eq!(manifest.jobs[0].overrides[0].value, "2020-01-01");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Manifest::parse(r#"[{"id": "x", "kind": "noop", "name": "a"}, {"id": "x", "kind": "noop", "name": "b"}]"#)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate job id"));
    }
}
