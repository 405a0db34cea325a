//! POSIX filesystem driver.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use md5::{Digest, Md5};

use super::{AddressStream, Filesystem};
use crate::errors::FilesystemError;

const BLOCKSIZE: usize = 8192;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Driver for POSIX-like filesystems (Lustre, NFS, local disk).
pub struct PosixFilesystem {
    name: String,
    max_concurrency: u32,
}

impl PosixFilesystem {
    pub fn new(name: impl Into<String>, max_concurrency: u32) -> Self {
        assert!(max_concurrency > 0);
        PosixFilesystem {
            name: name.into(),
            max_concurrency,
        }
    }

    fn io_error(&self, source: std::io::Error) -> FilesystemError {
        FilesystemError::Io {
            filesystem: self.name.clone(),
            source,
        }
    }
}

impl Default for PosixFilesystem {
    fn default() -> Self {
        PosixFilesystem::new("POSIX", 1)
    }
}

impl Filesystem for PosixFilesystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    fn accessible(&self, address: &Path) -> bool {
        File::open(address).is_ok()
    }

    fn supported_checksums(&self) -> Vec<String> {
        vec!["md5".to_string()]
    }

    fn read_size(&self, address: &Path) -> Result<u64, FilesystemError> {
        let metadata = std::fs::metadata(address).map_err(|e| self.io_error(e))?;
        Ok(metadata.len())
    }

    fn compute_checksum(
        &self,
        _algorithm: &str,
        address: &Path,
    ) -> Result<String, FilesystemError> {
        let mut file = File::open(address).map_err(|e| self.io_error(e))?;
        let mut hasher = Md5::new();
        let mut block = [0u8; BLOCKSIZE];

        loop {
            let n = file.read(&mut block).map_err(|e| self.io_error(e))?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    fn enumerate_fofn(
        &self,
        fofn: &Path,
        delimiter: u8,
        compressed: Option<bool>,
    ) -> Result<AddressStream, FilesystemError> {
        let reader = open_fofn(fofn, compressed).map_err(|e| self.io_error(e))?;
        Ok(Box::new(FofnRecords { reader, delimiter }))
    }

    fn delete_data(&self, address: &Path) -> Result<(), FilesystemError> {
        std::fs::remove_file(address).map_err(|e| self.io_error(e))
    }
}

/// Open a FoFN, transparently decompressing gzip. With `compressed` unset the
/// format is sniffed from the magic bytes without consuming them.
fn open_fofn(
    path: &Path,
    compressed: Option<bool>,
) -> std::io::Result<Box<dyn BufRead + Send>> {
    let mut reader = BufReader::new(File::open(path)?);

    let gzipped = match compressed {
        Some(flag) => flag,
        None => {
            let head = reader.fill_buf()?;
            head.len() >= 2 && head[..2] == GZIP_MAGIC
        }
    };

    Ok(if gzipped {
        Box::new(BufReader::new(GzDecoder::new(reader)))
    } else {
        Box::new(reader)
    })
}

/// Record-at-a-time FoFN reader. Empty records are skipped; read failures
/// mid-stream are logged and terminate the stream.
struct FofnRecords {
    reader: Box<dyn BufRead + Send>,
    delimiter: u8,
}

impl Iterator for FofnRecords {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            let mut record = Vec::new();
            match self.reader.read_until(self.delimiter, &mut record) {
                Ok(0) => return None,
                Ok(_) => {
                    if record.last() == Some(&self.delimiter) {
                        record.pop();
                    }
                    if record.is_empty() {
                        continue;
                    }
                    return Some(PathBuf::from(String::from_utf8_lossy(&record).into_owned()));
                }
                Err(e) => {
                    log::error!("FoFN read failed: {e}");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fofn(contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fofn");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn collect(fs: &PosixFilesystem, path: &Path, compressed: Option<bool>) -> Vec<PathBuf> {
        fs.enumerate_fofn(path, b'\n', compressed).unwrap().collect()
    }

    #[test]
    fn enumerates_newline_delimited_records() {
        let fs = PosixFilesystem::default();
        let (_dir, path) = write_fofn(b"/a/b\n/c/d\n/e/f\n");
        assert_eq!(
            collect(&fs, &path, Some(false)),
            vec![
                PathBuf::from("/a/b"),
                PathBuf::from("/c/d"),
                PathBuf::from("/e/f")
            ]
        );
    }

    #[test]
    fn final_record_needs_no_trailing_delimiter() {
        let fs = PosixFilesystem::default();
        let (_dir, path) = write_fofn(b"/a\n/b");
        assert_eq!(
            collect(&fs, &path, None),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn empty_records_are_skipped() {
        let fs = PosixFilesystem::default();
        let (_dir, path) = write_fofn(b"\n/a\n\n\n/b\n");
        assert_eq!(
            collect(&fs, &path, None),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn empty_fofn_yields_nothing() {
        let fs = PosixFilesystem::default();
        let (_dir, path) = write_fofn(b"");
        assert!(collect(&fs, &path, None).is_empty());
    }

    #[test]
    fn custom_delimiters_are_honoured() {
        let fs = PosixFilesystem::default();
        let (_dir, path) = write_fofn(b"/a\x00/b\x00");
        let records: Vec<_> = fs
            .enumerate_fofn(&path, 0, Some(false))
            .unwrap()
            .collect();
        assert_eq!(records, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn gzip_fofns_are_detected_and_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fofn.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(File::create(&path).unwrap(), Default::default());
        encoder.write_all(b"/x/y\n/z\n").unwrap();
        encoder.finish().unwrap();

        let fs = PosixFilesystem::default();

        // Explicitly flagged
        assert_eq!(
            collect(&fs, &path, Some(true)),
            vec![PathBuf::from("/x/y"), PathBuf::from("/z")]
        );

        // Auto-detected
        assert_eq!(
            collect(&fs, &path, None),
            vec![PathBuf::from("/x/y"), PathBuf::from("/z")]
        );
    }

    #[test]
    fn md5_checksums_match_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();

        let fs = PosixFilesystem::default();
        assert_eq!(
            fs.checksum("md5", &path).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn size_of_inaccessible_data_is_a_distinct_error() {
        let fs = PosixFilesystem::default();
        let err = fs.size(Path::new("/no/such/file")).unwrap_err();
        assert!(matches!(err, FilesystemError::DataInaccessible { .. }));
    }

    #[test]
    fn checksum_of_inaccessible_data_is_a_distinct_error() {
        let fs = PosixFilesystem::default();
        let err = fs.checksum("md5", Path::new("/no/such/file")).unwrap_err();
        assert!(matches!(err, FilesystemError::DataInaccessible { .. }));
    }

    #[test]
    fn size_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"123456").unwrap();

        let fs = PosixFilesystem::default();
        assert_eq!(fs.size(&path).unwrap(), 6);
    }
}
