//! Dump discovery and transparent decompression.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use walkdir::WalkDir;

use crate::error::PipelineError;

const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// On-disk encoding of a dump file, decided by its suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Plain,
    Gzip,
    Bzip2,
}

impl DumpKind {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".xml.gz") {
            Some(DumpKind::Gzip)
        } else if name.ends_with(".xml.bz2") {
            Some(DumpKind::Bzip2)
        } else if name.ends_with(".xml") {
            Some(DumpKind::Plain)
        } else {
            None
        }
    }
}

/// Forward-only decoded byte stream over one dump file.
pub type DumpStream = Box<dyn BufRead + Send>;
pub type DumpFiles = Box<dyn Iterator<Item = Result<PathBuf, PipelineError>> + Send>;

pub fn open_decompressed(path: &Path) -> Result<DumpStream, PipelineError> {
    let kind = DumpKind::detect(path).ok_or_else(|| PipelineError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;
    let file = File::open(path).map_err(|e| PipelineError::file_access(path, e))?;

    let stream: DumpStream = match kind {
        DumpKind::Plain => Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file)),
        DumpKind::Gzip => Box::new(BufReader::with_capacity(
            READ_BUFFER_BYTES,
            MultiGzDecoder::new(file),
        )),
        DumpKind::Bzip2 => Box::new(BufReader::with_capacity(
            READ_BUFFER_BYTES,
            MultiBzDecoder::new(file),
        )),
    };
    Ok(stream)
}

/// Lazily walk `root` for dump files, sorted by name at every level.
///
/// A file root is yielded as-is so an unrecognized suffix surfaces as
/// `UnsupportedFormat` when it is opened.
pub fn locate(root: &Path) -> DumpFiles {
    if root.is_file() {
        return Box::new(std::iter::once(Ok(root.to_path_buf())));
    }
    if !root.exists() {
        let err = io::Error::new(io::ErrorKind::NotFound, "dump root does not exist");
        return Box::new(std::iter::once(Err(PipelineError::file_access(root, err))));
    }

    let root = root.to_path_buf();
    let entries = WalkDir::new(&root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| match entry {
            Ok(e) if e.file_type().is_file() && DumpKind::detect(e.path()).is_some() => {
                Some(Ok(e.into_path()))
            }
            Ok(_) => None,
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.clone());
                Some(Err(PipelineError::file_access(path, io::Error::from(err))))
            }
        });
    Box::new(entries)
}
