use sha2::{Digest, Sha256};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("checksum mismatch for {url}: expected sha256 prefix {expected}, got {actual}")]
    Checksum {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("failed to read weights from {path}: {reason}")]
    Record { path: PathBuf, reason: String },
    #[error("no cache directory available, pass the weights file explicitly")]
    NoCacheDir,
}

/// Pretrained ResNet-18 weights published in the torchvision model zoo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResNet18Weights {
    ImageNet1kV1,
}

impl ResNet18Weights {
    pub fn url(&self) -> &'static str {
        match self {
            ResNet18Weights::ImageNet1kV1 => "https://download.pytorch.org/models/resnet18-f37072fd.pth",
        }
    }

    /// Leading hex digits of the file's SHA-256, as embedded in the torchvision file name.
    pub fn sha256_prefix(&self) -> &'static str {
        match self {
            ResNet18Weights::ImageNet1kV1 => "f37072fd",
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            ResNet18Weights::ImageNet1kV1 => 1000,
        }
    }

    fn file_name(&self) -> &'static str {
        self.url().rsplit('/').next().unwrap_or("resnet18.pth")
    }
}

pub(crate) fn default_cache_dir() -> Result<PathBuf, WeightsError> {
    dirs::cache_dir()
        .map(|dir| dir.join("cifar-resnet"))
        .ok_or(WeightsError::NoCacheDir)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> WeightsError + '_ {
    move |source| WeightsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn verify(weights: ResNet18Weights, bytes: &[u8]) -> Result<(), WeightsError> {
    let actual = sha256_hex(bytes);
    if actual.starts_with(weights.sha256_prefix()) {
        Ok(())
    } else {
        Err(WeightsError::Checksum {
            url: weights.url().to_string(),
            expected: weights.sha256_prefix().to_string(),
            actual,
        })
    }
}

/// Returns the path of the weights file in `cache_dir`, downloading it if missing or corrupted.
pub fn fetch(weights: ResNet18Weights, cache_dir: impl AsRef<Path>) -> Result<PathBuf, WeightsError> {
    let cache_dir = cache_dir.as_ref();
    let path = cache_dir.join(weights.file_name());

    if path.is_file() {
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        match verify(weights, &bytes) {
            Ok(()) => return Ok(path),
            Err(err) => warn!(path = %path.display(), "cached weights are corrupted, downloading again: {err}"),
        }
    }

    info!(url = weights.url(), "downloading pretrained weights");
    let download_error = |source| WeightsError::Download {
        url: weights.url().to_string(),
        source,
    };
    let bytes = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .and_then(|client| client.get(weights.url()).send())
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .map_err(download_error)?;
    verify(weights, &bytes)?;

    fs::create_dir_all(cache_dir).map_err(io_error(cache_dir))?;
    let partial = path.with_extension("part");
    fs::File::create(&partial)
        .and_then(|mut file| file.write_all(&bytes))
        .map_err(io_error(&partial))?;
    fs::rename(&partial, &path).map_err(io_error(&path))?;
    info!(path = %path.display(), "pretrained weights cached");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            ResNet18Weights::ImageNet1kV1.file_name(),
            "resnet18-f37072fd.pth"
        );
        assert_eq!(ResNet18Weights::ImageNet1kV1.num_classes(), 1000);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_rejects_wrong_content() {
        let err = verify(ResNet18Weights::ImageNet1kV1, b"not resnet weights").unwrap_err();
        assert!(matches!(err, WeightsError::Checksum { ref expected, .. } if expected == "f37072fd"));
    }
}
