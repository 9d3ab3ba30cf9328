//! Model discovery
//!
//! Lists GGUF files in the models directory and resolves model names.

use crate::inference::backend::read_gguf_header;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A GGUF model file on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    /// Full path to the model file
    pub path: PathBuf,
    /// Filename of the model
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub last_modified: SystemTime,
    /// GGUF format version, when the header is readable
    pub gguf_version: Option<u32>,
}

impl ModelFile {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let gguf_version = read_gguf_header(&path).ok().map(|h| h.version);

        Ok(Self {
            path,
            filename,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
            gguf_version,
        })
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        size_string(self.size_bytes)
    }
}

pub fn size_string(size_bytes: u64) -> String {
    let bytes = size_bytes as f64;

    if bytes < 1024.0 {
        format!("{} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gguf"))
}

/// Scan a directory for GGUF model files, sorted by filename
///
/// A missing directory yields an empty list.
pub fn discover_models(directory: &Path) -> Result<Vec<ModelFile>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() || !has_gguf_extension(&path) {
            continue;
        }
        match ModelFile::from_path(path.clone()) {
            Ok(model) => {
                tracing::debug!("Found model: {}", model.filename);
                models.push(model);
            }
            Err(e) => {
                tracing::warn!("Failed to read model file {:?}: {}", path, e);
            }
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));

    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());

    Ok(models)
}

/// Resolve a model given as a path or as a file name inside `directory`.
///
/// A name without extension also matches `<name>.gguf`.
pub fn resolve_model(name_or_path: &str, directory: &Path) -> Result<PathBuf, StorageError> {
    let direct = PathBuf::from(name_or_path);
    if direct.is_file() {
        return Ok(direct);
    }

    let candidates = [
        directory.join(name_or_path),
        directory.join(format!("{name_or_path}.gguf")),
    ];
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| StorageError::ModelNotFound(name_or_path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::gguf::write_test_header;
    use crate::inference::backend::GGUF_MAGIC;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_model_file_reads_gguf_version() {
        let temp_dir = TempDir::new().unwrap();
        let model_path = temp_dir.path().join("tiny.gguf");
        let mut file = File::create(&model_path).unwrap();
        write_test_header(&mut file, GGUF_MAGIC, 3);
        drop(file);

        let model = ModelFile::from_path(model_path.clone()).unwrap();
        assert_eq!(model.filename, "tiny.gguf");
        assert_eq!(model.path, model_path);
        assert_eq!(model.gguf_version, Some(3));
    }

    #[test]
    fn test_size_string() {
        assert_eq!(size_string(512), "512 B");
        assert_eq!(size_string(1024), "1.00 KB");
        assert_eq!(size_string(5 * 1024 * 1024), "5.00 MB");
        assert!(size_string(1024 * 1024 * 1024 * 3).contains("GB"));
    }

    #[test]
    fn test_discover_models() {
        let temp_dir = TempDir::new().unwrap();

        File::create(temp_dir.path().join("b-model.gguf")).unwrap();
        File::create(temp_dir.path().join("a-model.GGUF")).unwrap();
        File::create(temp_dir.path().join("notes.txt")).unwrap();
        fs::create_dir(temp_dir.path().join("dir.gguf")).unwrap();

        let models = discover_models(temp_dir.path()).unwrap();

        let names: Vec<_> = models.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["a-model.GGUF", "b-model.gguf"]);
        assert!(models.iter().all(|m| m.gguf_version.is_none()));
    }

    #[test]
    fn test_discover_nonexistent_directory() {
        let models = discover_models(Path::new("/this/path/does/not/exist")).unwrap();
        assert!(models.is_empty());
    }

    #[test]
    fn test_resolve_model() {
        let temp_dir = TempDir::new().unwrap();
        let model_path = temp_dir.path().join("tiny.gguf");
        File::create(&model_path).unwrap();

        assert_eq!(resolve_model("tiny.gguf", temp_dir.path()).unwrap(), model_path);
        assert_eq!(resolve_model("tiny", temp_dir.path()).unwrap(), model_path);
        assert_eq!(
            resolve_model(model_path.to_str().unwrap(), Path::new("/elsewhere")).unwrap(),
            model_path
        );
        assert!(matches!(
            resolve_model("missing", temp_dir.path()),
            Err(StorageError::ModelNotFound(_))
        ));
    }
}
