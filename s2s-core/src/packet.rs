//! Data packets: the attributes + payload records a transaction carries.
//!
//! Producers are external; the core only needs attributes, a size and a
//! stream yielding exactly `size` bytes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// One record to transfer.
pub trait DataPacket: Send {
    fn attributes(&self) -> &HashMap<String, String>;

    /// Payload length in bytes.
    fn size(&self) -> u64;

    /// Open the payload. The stream must yield `size()` bytes.
    fn open_stream(&self) -> io::Result<Box<dyn Read + '_>>;
}

/// Payload held in memory.
#[derive(Debug, Clone, Default)]
pub struct ByteArrayDataPacket {
    attributes: HashMap<String, String>,
    data: Vec<u8>,
}

impl ByteArrayDataPacket {
    pub fn new(attributes: HashMap<String, String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            attributes,
            data: data.into(),
        }
    }
}

impl DataPacket for ByteArrayDataPacket {
    fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn open_stream(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }
}

/// Attributes only, zero-length payload.
#[derive(Debug, Clone, Default)]
pub struct EmptyDataPacket {
    attributes: HashMap<String, String>,
}

impl EmptyDataPacket {
    pub fn new(attributes: HashMap<String, String>) -> Self {
        Self { attributes }
    }
}

impl DataPacket for EmptyDataPacket {
    fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    fn size(&self) -> u64 {
        0
    }

    fn open_stream(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(io::empty()))
    }
}

/// Payload streamed from a file. Size is taken when the packet is built.
#[derive(Debug, Clone)]
pub struct FileDataPacket {
    attributes: HashMap<String, String>,
    path: PathBuf,
    size: u64,
}

impl FileDataPacket {
    /// Builds a packet for `path` with `filename`, `path` and `absolute.path`
    /// attributes filled in unless `extra` already sets them.
    pub fn new(path: impl AsRef<Path>, extra: HashMap<String, String>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let absolute = std::fs::canonicalize(&path)?;
        let mut attributes = extra;
        if let Some(name) = absolute.file_name() {
            attributes
                .entry("filename".into())
                .or_insert_with(|| name.to_string_lossy().into_owned());
        }
        if let Some(parent) = absolute.parent() {
            let mut dir = parent.to_string_lossy().into_owned();
            if !dir.ends_with('/') {
                dir.push('/');
            }
            attributes.entry("path".into()).or_insert_with(|| dir.clone());
            attributes.entry("absolute.path".into()).or_insert(dir);
        }
        Ok(Self {
            attributes,
            path,
            size: meta.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataPacket for FileDataPacket {
    fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open_stream(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn byte_array_packet() {
        let attrs = HashMap::from([("k".to_string(), "v".to_string())]);
        let p = ByteArrayDataPacket::new(attrs, b"payload".to_vec());
        assert_eq!(p.size(), 7);
        let mut out = Vec::new();
        p.open_stream().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");
        assert_eq!(p.attributes()["k"], "v");
    }

    #[test]
    fn empty_packet_has_no_payload() {
        let p = EmptyDataPacket::new(HashMap::new());
        assert_eq!(p.size(), 0);
        let mut out = Vec::new();
        p.open_stream().unwrap().read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn file_packet_defaults_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let extra = HashMap::from([("filename".to_string(), "renamed.txt".to_string())]);
        let p = FileDataPacket::new(&file_path, extra).unwrap();
        assert_eq!(p.size(), 5);
        assert_eq!(p.attributes()["filename"], "renamed.txt");
        assert!(p.attributes()["path"].ends_with('/'));
        assert_eq!(p.attributes()["path"], p.attributes()["absolute.path"]);

        let mut out = String::new();
        p.open_stream().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn file_packet_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileDataPacket::new(dir.path(), HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
