use burn::data::dataset::Dataset;
use flate2::read::GzDecoder;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

const ARCHIVE_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
const BATCHES_DIR: &str = "cifar-10-batches-bin";
const META_FILE: &str = "batches.meta.txt";
const TRAIN_BATCHES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_BATCHES: [&str; 1] = ["test_batch.bin"];

pub(crate) const IMAGE_SIZE: usize = 32;
pub(crate) const CHANNELS: usize = 3;
pub(crate) const IMAGE_BYTES: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
/// One label byte followed by the red, green and blue planes.
const RECORD_BYTES: usize = IMAGE_BYTES + 1;

/// Class names in label order.
pub const CIFAR10_CLASSES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

#[derive(Debug, Error)]
pub enum DatasetError {
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
    #[error("{0} bytes is not a whole number of {size}-byte records", size = RECORD_BYTES)]
    Truncated(usize),
    #[error("record {index} has label {label}, expected one of {count} classes", count = CIFAR10_CLASSES.len())]
    Label { index: usize, label: u8 },
    #[error("no records found under {0}")]
    Empty(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CifarSplit {
    Train,
    Test,
}

impl CifarSplit {
    fn batch_files(self) -> &'static [&'static str] {
        match self {
            CifarSplit::Train => &TRAIN_BATCHES,
            CifarSplit::Test => &TEST_BATCHES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CifarItem {
    /// Channel-first pixels, `[3, 32, 32]` flattened.
    pub image: Vec<u8>,
    pub label: u8,
}

/// CIFAR-10 split held in memory as the raw record buffer.
///
/// The whole training split is 50 000 * 3073 bytes (~154Mb), so the records are kept undecoded and
/// each item is sliced out on demand.
#[derive(Debug, Clone)]
pub struct CifarDataset {
    records: Vec<u8>,
    len: usize,
}

impl CifarDataset {
    /// Loads a split from `root`, downloading the archive first if the batch files are missing.
    pub fn new(root: impl AsRef<Path>, split: CifarSplit) -> Result<Self, DatasetError> {
        let dir = download(root)?;
        let mut records = Vec::new();
        for name in split.batch_files() {
            let path = dir.join(name);
            let bytes = fs::read(&path).map_err(io_error(&path))?;
            debug!(file = %path.display(), records = bytes.len() / RECORD_BYTES, "read batch");
            records.extend(bytes);
        }
        if records.is_empty() {
            return Err(DatasetError::Empty(dir));
        }
        let dataset = Self::from_records(records)?;
        info!(split = ?split, len = dataset.len, "loaded CIFAR-10");
        Ok(dataset)
    }

    pub fn from_records(records: Vec<u8>) -> Result<Self, DatasetError> {
        if records.len() % RECORD_BYTES != 0 {
            return Err(DatasetError::Truncated(records.len()));
        }
        for (index, record) in records.chunks_exact(RECORD_BYTES).enumerate() {
            let label = record[0];
            if label as usize >= CIFAR10_CLASSES.len() {
                return Err(DatasetError::Label { index, label });
            }
        }
        let len = records.len() / RECORD_BYTES;
        Ok(Self { records, len })
    }
}

impl Dataset<CifarItem> for CifarDataset {
    fn get(&self, index: usize) -> Option<CifarItem> {
        let start = index.checked_mul(RECORD_BYTES)?;
        let record = self.records.get(start..start.checked_add(RECORD_BYTES)?)?;
        Some(CifarItem {
            image: record[1..].to_vec(),
            label: record[0],
        })
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Downloads and unpacks the binary archive into `root` unless every batch file is already there.
/// Returns the directory holding the batch files.
pub(crate) fn download(root: impl AsRef<Path>) -> Result<PathBuf, DatasetError> {
    let root = root.as_ref();
    let dir = root.join(BATCHES_DIR);
    if TRAIN_BATCHES
        .iter()
        .chain(TEST_BATCHES.iter())
        .all(|name| dir.join(name).is_file())
    {
        return Ok(dir);
    }
    fs::create_dir_all(root).map_err(io_error(root))?;

    info!(url = ARCHIVE_URL, root = %root.display(), "downloading CIFAR-10");
    let download_error = |source| DatasetError::Download {
        url: ARCHIVE_URL.to_string(),
        source,
    };
    // The archive is ~160Mb, the blocking client's default 30s timeout is too short.
    let response = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .and_then(|client| client.get(ARCHIVE_URL).send())
        .and_then(|response| response.error_for_status())
        .map_err(download_error)?;
    tar::Archive::new(GzDecoder::new(response))
        .unpack(root)
        .map_err(io_error(root))?;
    info!(dir = %dir.display(), "CIFAR-10 extracted");
    Ok(dir)
}

/// Class names from the archive's meta file, falling back to the built-in list.
pub(crate) fn class_names(root: impl AsRef<Path>) -> Vec<String> {
    let path = root.as_ref().join(BATCHES_DIR).join(META_FILE);
    let from_meta = fs::read_to_string(&path)
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if from_meta.len() == CIFAR10_CLASSES.len() {
        from_meta
    } else {
        CIFAR10_CLASSES.iter().map(|name| name.to_string()).collect()
    }
}
