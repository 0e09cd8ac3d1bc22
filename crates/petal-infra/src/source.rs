//! Loads Petal documents from disk.
//!
//! `extends` and `overlays` references resolve against the directory of the
//! document that names them. Document ids are paths relative to the project
//! root, so a lock stays verifiable from the same root after the checkout
//! moves.

use std::path::{Component, Path, PathBuf};

use petal_core::compiler::compose::{DocumentSource, LoadedDocument, SourceError};

#[derive(Debug, Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, reference: &str, from: Option<&str>) -> PathBuf {
        let base = match from {
            Some(from) => {
                let from = self.root.join(from);
                from.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone())
            }
            None => self.root.clone(),
        };
        normalize(&base.join(reference))
    }

    fn id_for(&self, path: &Path) -> String {
        let root = normalize(&self.root);
        path.strip_prefix(&root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

impl DocumentSource for FsDocumentSource {
    fn load(&self, reference: &str, from: Option<&str>) -> Result<LoadedDocument, SourceError> {
        let path = self.resolve(reference, from);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "loaded document");
                Ok(LoadedDocument {
                    id: self.id_for(&path),
                    text,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound(reference.to_string())),
            Err(e) => Err(SourceError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_references_resolve_relative_to_referrer() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("flows/base")).unwrap();
        std::fs::write(tmp.path().join("flows/app.yaml"), "name: app\n").unwrap();
        std::fs::write(tmp.path().join("flows/base/common.yaml"), "name: common\n").unwrap();

        let source = FsDocumentSource::new(tmp.path());
        let app = source.load("flows/app.yaml", None).unwrap();
        assert_eq!(app.id, "flows/app.yaml");

        let base = source.load("./base/common.yaml", Some(&app.id)).unwrap();
        assert_eq!(base.id, "flows/base/common.yaml");
        assert_eq!(base.text, "name: common\n");

        let back = source.load("../app.yaml", Some(&base.id)).unwrap();
        assert_eq!(back.id, "flows/app.yaml");
    }

    #[test]
    fn test_missing_document() {
        let tmp = TempDir::new().unwrap();
        let err = FsDocumentSource::new(tmp.path()).load("nope.yaml", None).unwrap_err();
        assert!(matches!(err, SourceError::NotFound(ref r) if r == "nope.yaml"));
    }
}
