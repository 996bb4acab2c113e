/// Download and unpack the tunnel CLI.
///
/// The supervisory core only consumes the extracted executable path; this
/// module is the collaborator that produces it. Extraction refuses path
/// traversal (entries resolving outside the target directory) before any
/// file is written.
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_CLI_URL: &str =
    "https://code.visualstudio.com/sha/download?build=stable&os=cli-alpine-x64";
pub const DEFAULT_CLI_ARCHIVE: &str = "vscode_cli.tar.gz";

#[derive(Debug)]
pub enum FetchError {
    Http { url: String, source: reqwest::Error },
    Io { path: PathBuf, source: std::io::Error },
    NotTarGz { path: PathBuf },
    PathTraversal { entry: String },
    Archive { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Http { url, source } => {
                write!(f, "download from {url} failed: {source}")
            }
            FetchError::Io { path, source } => {
                write!(f, "I/O error at {}: {}", path.display(), source)
            }
            FetchError::NotTarGz { path } => {
                write!(f, "{} is not a .tar.gz archive", path.display())
            }
            FetchError::PathTraversal { entry } => {
                write!(f, "path traversal attempt in archive entry: {entry}")
            }
            FetchError::Archive { path, source } => {
                write!(f, "failed to read archive {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Http { source, .. } => Some(source),
            FetchError::Io { source, .. } => Some(source),
            FetchError::NotTarGz { .. } => None,
            FetchError::PathTraversal { .. } => None,
            FetchError::Archive { source, .. } => Some(source),
        }
    }
}

/// Stream the CLI tarball to `dest`.
pub async fn download(url: &str, dest: &Path) -> Result<(), FetchError> {
    if !looks_like_tar_gz(dest) {
        return Err(FetchError::NotTarGz {
            path: dest.to_path_buf(),
        });
    }
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| FetchError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    tracing::info!(url, dest = %dest.display(), "downloading tunnel CLI");
    let mut response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| FetchError::Http {
            url: url.to_string(),
            source: e,
        })?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| FetchError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
    while let Some(chunk) = response.chunk().await.map_err(|e| FetchError::Http {
        url: url.to_string(),
        source: e,
    })? {
        file.write_all(&chunk).await.map_err(|e| FetchError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
    }
    file.flush().await.map_err(|e| FetchError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;

    let size = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    tracing::debug!(bytes = size, "download complete");
    Ok(())
}

/// Extract a `.tar.gz` archive into `dest`.
///
/// All entry paths are validated in a first pass; nothing is written unless
/// every entry stays inside the target directory.
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), FetchError> {
    std::fs::create_dir_all(dest).map_err(|e| FetchError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;

    let open = |p: &Path| {
        File::open(p).map_err(|e| FetchError::Io {
            path: p.to_path_buf(),
            source: e,
        })
    };
    let archive_err = |e: std::io::Error| FetchError::Archive {
        path: archive.to_path_buf(),
        source: e,
    };

    // Pass one: validate every entry path before any write.
    let mut reader = tar::Archive::new(GzDecoder::new(open(archive)?));
    for entry in reader.entries().map_err(archive_err)? {
        let entry = entry.map_err(archive_err)?;
        let path = entry.path().map_err(archive_err)?;
        if !entry_is_safe(&path) {
            return Err(FetchError::PathTraversal {
                entry: path.display().to_string(),
            });
        }
    }

    // Pass two: unpack. The gzip stream cannot be rewound, so reopen.
    tracing::info!(archive = %archive.display(), dest = %dest.display(), "extracting");
    let mut reader = tar::Archive::new(GzDecoder::new(open(archive)?));
    reader.set_preserve_permissions(true);
    reader.unpack(dest).map_err(archive_err)?;
    Ok(())
}

pub fn looks_like_tar_gz(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".tar.gz"))
}

/// An entry is safe when it is relative and never steps above its root.
fn entry_is_safe(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
