//! Binary storage for vector embeddings.
//!
//! File format: vectors.bin
//!
//! Header (47 bytes):
//! - version: u8 (2)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, sorted by SKU):
//! - sku_len: u16, sku: [u8; sku_len] (UTF-8)
//! - name_len: u32, name: [u8; name_len] (UTF-8)
//! - price: f64
//! - category_count: u32, category_ids: [u64; category_count]
//! - embedding: [f32; dimensions]
//!
//! All integers and floats are little-endian.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{ProductPayload, VectorEntry};

/// Current file format version
const FORMAT_VERSION: u8 = 2;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for vector embeddings.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load all entries, validating model and dimensions against expectations.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<HashMap<String, VectorEntry>, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = self.read_header(&mut reader)?;
        self.validate_header(&header, expected_model_id, expected_dimensions)?;

        let mut entries = HashMap::with_capacity(header.entry_count.min(1 << 20) as usize);
        for _ in 0..header.entry_count {
            let entry = self.read_entry(&mut reader, header.dimensions as usize)?;
            entries.insert(entry.payload.sku.clone(), entry);
        }

        Ok(entries)
    }

    /// Save entries.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        entries: &HashMap<String, VectorEntry>,
        model_id: &[u8; 32],
        dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, entries, model_id, dimensions);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        entries: &HashMap<String, VectorEntry>,
        model_id: &[u8; 32],
        dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(dimensions).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("{dimensions} dimensions do not fit the header"))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: entries.len() as u64,
        };
        self.write_header(&mut writer, &header)?;

        let mut skus: Vec<&String> = entries.keys().collect();
        skus.sort();
        for sku in skus {
            self.write_entry(&mut writer, &entries[sku], dimensions as usize)?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(&self, reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        read_exact(reader, &mut header_bytes)?;

        let version = header_bytes[0];
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([
            header_bytes[43],
            header_bytes[44],
            header_bytes[45],
            header_bytes[46],
        ]);
        // checksum covers header without the checksum field
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header_bytes[35..43]);

        Ok(Header {
            version,
            model_id,
            dimensions,
            entry_count: u64::from_le_bytes(count_bytes),
        })
    }

    fn validate_header(
        &self,
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn write_header(&self, writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry(
        &self,
        reader: &mut impl Read,
        dimensions: usize,
    ) -> Result<VectorEntry, VectorStorageError> {
        let sku_len = u16::from_le_bytes(read_array(reader)?) as usize;
        let sku = read_string(reader, sku_len)?;

        let name_len = u32::from_le_bytes(read_array(reader)?) as usize;
        let name = read_string(reader, name_len)?;

        let price = f64::from_le_bytes(read_array(reader)?);

        let category_count = u32::from_le_bytes(read_array(reader)?) as usize;
        let mut category_ids = Vec::with_capacity(category_count.min(1024));
        for _ in 0..category_count {
            category_ids.push(u64::from_le_bytes(read_array(reader)?));
        }

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            embedding.push(f32::from_le_bytes(read_array(reader)?));
        }

        Ok(VectorEntry {
            payload: ProductPayload {
                sku,
                name,
                price,
                category_ids,
            },
            embedding,
        })
    }

    fn write_entry(
        &self,
        writer: &mut impl Write,
        entry: &VectorEntry,
        dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        let payload = &entry.payload;
        let sku_len = u16::try_from(payload.sku.len())
            .map_err(|_| VectorStorageError::InvalidFormat(format!("sku too long: {}", payload.sku)))?;
        if entry.embedding.len() != dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: dimensions,
                got: entry.embedding.len(),
            });
        }

        writer.write_all(&sku_len.to_le_bytes())?;
        writer.write_all(payload.sku.as_bytes())?;
        writer.write_all(&(payload.name.len() as u32).to_le_bytes())?;
        writer.write_all(payload.name.as_bytes())?;
        writer.write_all(&payload.price.to_le_bytes())?;
        writer.write_all(&(payload.category_ids.len() as u32).to_le_bytes())?;
        for id in &payload.category_ids {
            writer.write_all(&id.to_le_bytes())?;
        }

        for &value in &entry.embedding {
            writer.write_all(&value.to_le_bytes())?;
        }

        Ok(())
    }
}

/// `read_exact` that reports a short file as a format error rather than I/O.
fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), VectorStorageError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            VectorStorageError::InvalidFormat("unexpected end of file".to_string())
        }
        _ => VectorStorageError::Io(err),
    })
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N], VectorStorageError> {
    let mut buf = [0u8; N];
    read_exact(reader, &mut buf)?;
    Ok(buf)
}

fn read_string(reader: &mut impl Read, len: usize) -> Result<String, VectorStorageError> {
    let mut buf = vec![0u8; len];
    read_exact(reader, &mut buf)?;
    String::from_utf8(buf).map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path() -> PathBuf {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "kiosk-vectors-test-{}-{}.bin",
            std::process::id(),
            counter
        ))
    }

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn entry(sku: &str, embedding: Vec<f32>) -> (String, VectorEntry) {
        (
            sku.to_string(),
            VectorEntry {
                payload: ProductPayload {
                    sku: sku.to_string(),
                    name: format!("Product {sku}"),
                    price: 12.5,
                    category_ids: vec![3, 9],
                },
                embedding,
            },
        )
    }

    #[test]
    fn test_save_and_load_empty() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let model_id = test_model_id();

        storage.save(&HashMap::new(), &model_id, 384).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&model_id, 384).unwrap();
        assert!(loaded.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let model_id = test_model_id();

        let entries: HashMap<_, _> = vec![
            entry("SKU-1", vec![1.0, 0.0, 0.0]),
            entry("SKU-ü", vec![0.0, 1.0, 0.0]),
        ]
        .into_iter()
        .collect();

        storage.save(&entries, &model_id, 3).unwrap();

        let loaded = storage.load(&model_id, 3).unwrap();
        assert_eq!(loaded.len(), 2);

        let first = &loaded["SKU-1"];
        assert_eq!(first.embedding, vec![1.0, 0.0, 0.0]);
        assert_eq!(first.payload, entries["SKU-1"].payload);
        assert_eq!(loaded["SKU-ü"].payload.name, "Product SKU-ü");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_model_mismatch() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        storage.save(&HashMap::new(), &test_model_id(), 3).unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;

        let result = storage.load(&wrong_model_id, 3);
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_dimension_mismatch() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let model_id = test_model_id();
        storage.save(&HashMap::new(), &model_id, 3).unwrap();

        let result = storage.load(&model_id, 384);
        assert!(matches!(result, Err(VectorStorageError::DimensionMismatch { .. })));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/vectors.bin");
        let storage = VectorStorage::new(path.clone());

        let result = storage.save(&HashMap::new(), &test_model_id(), 3);

        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let model_id = test_model_id();

        let entries: HashMap<_, _> = vec![entry("SKU-1", vec![1.0, 0.0, 0.0])].into_iter().collect();
        storage.save(&entries, &model_id, 3).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&model_id, 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_truncated_file_is_invalid_format() {
        let path = temp_path();
        let storage = VectorStorage::new(path.clone());
        let model_id = test_model_id();

        let entries: HashMap<_, _> = vec![entry("SKU-1", vec![1.0, 0.0, 0.0])].into_iter().collect();
        storage.save(&entries, &model_id, 3).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        let result = storage.load(&model_id, 3);
        assert!(matches!(result, Err(VectorStorageError::InvalidFormat(_))));

        let _ = std::fs::remove_file(&path);
    }
}
