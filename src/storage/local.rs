use super::{ListedObject, ObjectMeta, ObjectStore, StorageError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const META_DIR: &str = ".doc-reader-meta";

/// Filesystem-backed store: `<root>/<container>/<path>`.
///
/// Content type and user metadata of published objects are kept as JSON
/// sidecars under `<root>/.doc-reader-meta/<container>/<path>.json`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root).map_err(|source| StorageError::Io {
            op: "create storage root",
            target: root.display().to_string(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf, StorageError> {
        check_container(container)?;
        Ok(self.root.join(container))
    }

    fn object_path(&self, container: &str, path: &str) -> Result<PathBuf, StorageError> {
        let mut out = self.container_dir(container)?;
        for seg in key_segments(path)? {
            out.push(seg);
        }
        Ok(out)
    }

    fn sidecar_path(&self, container: &str, path: &str) -> Result<PathBuf, StorageError> {
        check_container(container)?;
        let mut out = self.root.join(META_DIR).join(container);
        for seg in key_segments(path)? {
            out.push(seg);
        }
        out.set_extension(match out.extension() {
            Some(ext) => format!("{}.json", ext.to_string_lossy()),
            None => "json".to_string(),
        });
        Ok(out)
    }
}

fn check_segment(seg: &str, key: &str) -> Result<(), StorageError> {
    let reason = if seg.is_empty() {
        Some("empty path segment")
    } else if seg == "." || seg == ".." {
        Some("relative path segment")
    } else if seg.contains('\\') {
        Some("backslash in path segment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn check_container(container: &str) -> Result<(), StorageError> {
    check_segment(container, container)?;
    if container.starts_with('.') || container.contains('/') {
        return Err(StorageError::InvalidKey {
            key: container.to_string(),
            reason: "container names may not start with '.' or contain '/'".to_string(),
        });
    }
    Ok(())
}

fn key_segments(path: &str) -> Result<Vec<&str>, StorageError> {
    if path.is_empty() {
        return Err(StorageError::InvalidKey {
            key: path.to_string(),
            reason: "empty key".to_string(),
        });
    }
    let segs: Vec<&str> = path.split('/').collect();
    for seg in &segs {
        check_segment(seg, path)?;
    }
    Ok(segs)
}

fn io_err<'a>(op: &'static str, target: &'a Path) -> impl FnOnce(std::io::Error) -> StorageError + 'a {
    move |source| StorageError::Io {
        op,
        target: target.display().to_string(),
        source,
    }
}

/// `/`-joined key for `rel`, or `None` when a component is not valid UTF-8.
fn key_for(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for comp in rel.components() {
        parts.push(comp.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}

fn walk(dir: &Path) -> Result<Vec<ListedObject>, StorageError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| io_err("list", dir)(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(dir) else {
            continue;
        };
        let Some(key) = key_for(rel) else {
            warn!(path = %path.display(), "skipping object with non-UTF-8 name");
            continue;
        };
        let meta = entry.metadata().map_err(|e| io_err("stat", path)(e.into()))?;
        out.push(ListedObject {
            path: key,
            size: meta.len(),
        });
    }
    Ok(out)
}

impl ObjectStore for LocalStore {
    fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<ListedObject>, StorageError> {
        let dir = self.container_dir(container)?;
        if !dir.is_dir() {
            return Err(StorageError::NotFound {
                container: container.to_string(),
                path: String::new(),
            });
        }
        let mut out = walk(&dir)?;
        if let Some(prefix) = prefix {
            out.retain(|o| o.path.starts_with(prefix));
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(container, count = out.len(), "listed objects");
        Ok(out)
    }

    fn head(&self, container: &str, path: &str) -> Result<ObjectMeta, StorageError> {
        let file = self.object_path(container, path)?;
        let meta = match std::fs::metadata(&file) {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                return Err(StorageError::NotFound {
                    container: container.to_string(),
                    path: path.to_string(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    container: container.to_string(),
                    path: path.to_string(),
                });
            }
            Err(e) => return Err(io_err("head", &file)(e)),
        };

        let sidecar = self.sidecar_path(container, path)?;
        let mut out = match std::fs::read(&sidecar) {
            Ok(raw) => serde_json::from_slice::<ObjectMeta>(&raw).map_err(|source| {
                StorageError::Metadata {
                    target: sidecar.display().to_string(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ObjectMeta {
                size: 0,
                content_type: None,
                metadata: BTreeMap::new(),
            },
            Err(e) => return Err(io_err("read metadata", &sidecar)(e)),
        };
        out.size = meta.len();
        Ok(out)
    }

    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        let file = self.object_path(container, path)?;
        std::fs::read(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    container: container.to_string(),
                    path: path.to_string(),
                }
            } else {
                io_err("get", &file)(e)
            }
        })
    }

    fn put(
        &self,
        container: &str,
        path: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        let file = self.object_path(container, path)?;
        let sidecar = self.sidecar_path(container, path)?;

        for target in [&file, &sidecar] {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err("create parent", parent))?;
            }
        }

        let meta = ObjectMeta {
            size: body.len() as u64,
            content_type: Some(content_type.to_string()),
            metadata: metadata.clone(),
        };
        let raw = serde_json::to_vec_pretty(&meta).map_err(|source| StorageError::Metadata {
            target: sidecar.display().to_string(),
            source,
        })?;
        // Metadata lands first so a published object is never left without it.
        std::fs::write(&sidecar, raw).map_err(io_err("write metadata", &sidecar))?;
        if let Err(e) = std::fs::write(&file, body) {
            let _ = std::fs::remove_file(&sidecar);
            return Err(io_err("put", &file)(e));
        }

        debug!(container, path, bytes = body.len(), "stored object");
        Ok(())
    }
}
