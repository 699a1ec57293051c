// Upload transports.
//
// A transport moves one local file to the remote side and returns a shareable
// URL. `FolderTransport` targets a mounted folder (network share, sync client
// folder); anything speaking a vendor API plugs in through the same trait.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;

use super::error::{ErrorCategory, TransportError};
use crate::constants::HASH_CHUNK_SIZE;
use crate::settings::Settings;

pub trait Transport: Send + Sync {
    fn upload(&self, local: &Path, remote_name: &str) -> Result<String, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn upload(&self, local: &Path, remote_name: &str) -> Result<String, TransportError> {
        (**self).upload(local, remote_name)
    }
}

/// Builds the transport for the destination in a settings snapshot.
pub trait Connector: Send + Sync {
    fn connect(&self, settings: &Settings) -> Box<dyn Transport>;
}

pub struct FolderConnector;

impl Connector for FolderConnector {
    fn connect(&self, settings: &Settings) -> Box<dyn Transport> {
        Box::new(FolderTransport::new(settings.remote_folder.clone()))
    }
}

pub trait NetworkStatus: Send + Sync {
    fn is_connected(&self) -> bool;
    fn is_wifi(&self) -> bool;
}

/// For hosts on a fixed link where "Wi-Fi only" has no meaning.
pub struct AssumeOnline;

impl NetworkStatus for AssumeOnline {
    fn is_connected(&self) -> bool {
        true
    }

    fn is_wifi(&self) -> bool {
        true
    }
}

pub struct FolderTransport {
    folder: Option<PathBuf>,
}

impl FolderTransport {
    pub fn new(folder: Option<PathBuf>) -> Self {
        Self { folder }
    }
}

impl Transport for FolderTransport {
    fn upload(&self, local: &Path, remote_name: &str) -> Result<String, TransportError> {
        let folder = self.folder.as_ref().ok_or_else(|| {
            TransportError::categorized(ErrorCategory::Config, "remote folder is not configured")
        })?;

        let source_size = fs::metadata(local)
            .map_err(|e| TransportError::categorized(ErrorCategory::File, format!("{}: {}", local.display(), e)))?
            .len();

        if !folder.is_dir() {
            // Re-created now so the retry finds it
            match fs::create_dir_all(folder) {
                Ok(()) => log::info!("Re-created remote folder {}", folder.display()),
                Err(e) => log::warn!("Could not re-create remote folder {}: {}", folder.display(), e),
            }
            return Err(TransportError::categorized(
                ErrorCategory::FolderNotFound,
                format!("{} does not exist", folder.display()),
            ));
        }

        let dest = folder.join(remote_name);
        let source_hash = hash_file(local)
            .map_err(|e| TransportError::categorized(ErrorCategory::File, format!("{}: {}", local.display(), e)))?;

        // A previous attempt may have finished the copy before the ledger was updated
        if let Ok(meta) = fs::metadata(&dest) {
            if meta.len() == source_size && hash_file(&dest).ok() == Some(source_hash) {
                log::info!("{} already present remotely", remote_name);
                return Ok(file_url(&dest));
            }
        }

        let part = folder.join(format!("{}.part", remote_name));
        let copied = copy_verified(local, &part, source_size, source_hash)
            .and_then(|()| fs::rename(&part, &dest));
        if let Err(e) = copied {
            let _ = fs::remove_file(&part);
            return Err(io_error(&e, format!("copy to {} failed: {}", dest.display(), e)));
        }

        if let Ok(modified) = fs::metadata(local).and_then(|m| m.modified()) {
            let _ = filetime::set_file_mtime(&dest, filetime::FileTime::from_system_time(modified));
        }

        Ok(file_url(&dest))
    }
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Copy with read-back verification by size and BLAKE3.
fn copy_verified(source: &Path, dest: &Path, expected_size: u64, expected_hash: blake3::Hash) -> io::Result<()> {
    let mut reader = File::open(source)?;
    let mut writer = BufWriter::new(File::create(dest)?);
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    let written = fs::metadata(dest)?.len();
    if written != expected_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("verification failed: size mismatch ({} vs {})", expected_size, written),
        ));
    }
    if hash_file(dest)? != expected_hash {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "verification failed: hash mismatch"));
    }
    Ok(())
}

/// Category for an I/O failure on the remote side. Unknown kinds are left to
/// message classification.
fn io_error(e: &io::Error, message: String) -> TransportError {
    let category = match e.kind() {
        io::ErrorKind::PermissionDenied => Some(ErrorCategory::Auth),
        io::ErrorKind::NotFound => Some(ErrorCategory::FolderNotFound),
        io::ErrorKind::InvalidData => Some(ErrorCategory::Server),
        _ => match e.raw_os_error().map(Errno::from_raw) {
            Some(Errno::ENOSPC) | Some(Errno::EDQUOT) => Some(ErrorCategory::Quota),
            Some(Errno::ETIMEDOUT) | Some(Errno::EHOSTUNREACH) | Some(Errno::ENETUNREACH) => Some(ErrorCategory::Network),
            _ => None,
        },
    };
    TransportError { category, message, ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(dir: &Path) -> PathBuf {
        let p = dir.join("EvidenceCam_2024-01-01_00-00-00.mp4");
        fs::write(&p, vec![7u8; 4096]).unwrap();
        p
    }

    #[test]
    fn test_copies_and_returns_file_url() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let src = source(local.path());

        let t = FolderTransport::new(Some(remote.path().to_path_buf()));
        let url = t.upload(&src, "clip.mp4").unwrap();

        let dest = remote.path().join("clip.mp4");
        assert_eq!(url, format!("file://{}", dest.display()));
        assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
        assert!(!remote.path().join("clip.mp4.part").exists());
    }

    #[test]
    fn test_repeat_upload_is_idempotent() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let src = source(local.path());
        let t = FolderTransport::new(Some(remote.path().to_path_buf()));

        let first = t.upload(&src, "clip.mp4").unwrap();
        let second = t.upload(&src, "clip.mp4").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unconfigured_is_config_error() {
        let local = tempfile::tempdir().unwrap();
        let src = source(local.path());
        let err = FolderTransport::new(None).upload(&src, "clip.mp4").unwrap_err();
        assert_eq!(err.category, Some(ErrorCategory::Config));
    }

    #[test]
    fn test_missing_source_is_file_error() {
        let remote = tempfile::tempdir().unwrap();
        let t = FolderTransport::new(Some(remote.path().to_path_buf()));
        let err = t.upload(Path::new("/nonexistent/clip.mp4"), "clip.mp4").unwrap_err();
        assert_eq!(err.category, Some(ErrorCategory::File));
    }

    #[test]
    fn test_missing_folder_is_recreated_for_next_attempt() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let folder = remote.path().join("EvidenceCam");
        let src = source(local.path());
        let t = FolderTransport::new(Some(folder.clone()));

        let err = t.upload(&src, "clip.mp4").unwrap_err();
        assert_eq!(err.category, Some(ErrorCategory::FolderNotFound));
        assert!(folder.is_dir());

        assert!(t.upload(&src, "clip.mp4").is_ok());
    }

    #[test]
    fn test_io_error_mapping() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(io_error(&denied, "x".into()).category, Some(ErrorCategory::Auth));

        let full = io::Error::from_raw_os_error(Errno::ENOSPC as i32);
        assert_eq!(io_error(&full, "x".into()).category, Some(ErrorCategory::Quota));
    }
}
