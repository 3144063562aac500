//! Convert qcow2 images (versions 2 and 3) to flat images.
//!
//! The layout of the format is described in
//! <https://gitlab.com/qemu-project/qemu/-/blob/master/docs/interop/qcow2.txt>.
//!
//! Only the active L1/L2 tables are used. Snapshots and refcount tables
//! are ignored.

use std::{
    fs::File,
    io::{self, Read},
    os::unix::fs::FileExt,
    path::Path,
};

use crate::{fs::Directory, ImportError};

/// Bits 9-55 of L1 and L2 entries.
const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

const L2_COMPRESSED: u64 = 1 << 62;

const L2_ZERO: u64 = 1;

const INCOMPAT_CORRUPT: u64 = 1 << 1;
const INCOMPAT_DATA_FILE: u64 = 1 << 2;
const INCOMPAT_COMPRESSION: u64 = 1 << 3;
const INCOMPAT_EXTL2: u64 = 1 << 4;

/// Incompatible features that don't affect how clusters are read. Bit 0
/// (dirty) only means that refcounts must be rebuilt.
const INCOMPAT_KNOWN: u64 = 1 | INCOMPAT_CORRUPT | INCOMPAT_COMPRESSION;

const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 21;

/// Size of the header fields common to versions 2 and 3.
const V2_HEADER_LEN: usize = 72;

const V3_HEADER_LEN: usize = 104;

const SECTOR_SIZE: u64 = 512;

#[derive(Copy, Clone, Debug, PartialEq)]
enum CompressionType {
    Deflate,
    Zstd,
}

#[derive(Debug)]
struct Header {
    cluster_bits: u32,
    size: u64,
    l1_size: u32,
    l1_table_offset: u64,
    compression: CompressionType,
}

fn corrupt(message: impl Into<String>) -> ImportError {
    ImportError::CorruptSource(format!("qcow2: {}", message.into()))
}

fn unsupported(message: impl Into<String>) -> ImportError {
    ImportError::UnsupportedFormat(format!("qcow2: {}", message.into()))
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(b)
}

fn be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(b)
}

impl Header {
    /// Parse and validate the header. `head` must contain, at least,
    /// the first [`V3_HEADER_LEN`] + 8 bytes of the file, or the whole
    /// file if it is shorter.
    fn parse(head: &[u8]) -> Result<Self, ImportError> {
        if head.len() < V2_HEADER_LEN {
            return Err(corrupt("truncated header"));
        }

        let version = be_u32(head, 4);
        if version != 2 && version != 3 {
            return Err(unsupported(format!("version {version}")));
        }

        if be_u64(head, 8) != 0 {
            return Err(unsupported("images with a backing file"));
        }

        let cluster_bits = be_u32(head, 20);
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(corrupt(format!("invalid cluster_bits {cluster_bits}")));
        }

        if be_u32(head, 32) != 0 {
            return Err(unsupported("encrypted images"));
        }

        let mut compression = CompressionType::Deflate;

        if version == 3 {
            if head.len() < V3_HEADER_LEN {
                return Err(corrupt("truncated header"));
            }

            let incompatible = be_u64(head, 72);

            if incompatible & INCOMPAT_CORRUPT != 0 {
                return Err(corrupt("image is marked as corrupt"));
            }

            if incompatible & INCOMPAT_DATA_FILE != 0 {
                return Err(unsupported("external data files"));
            }

            if incompatible & INCOMPAT_EXTL2 != 0 {
                return Err(unsupported("extended L2 entries"));
            }

            if incompatible & !INCOMPAT_KNOWN != 0 {
                return Err(unsupported(format!(
                    "incompatible features {:#x}",
                    incompatible & !INCOMPAT_KNOWN
                )));
            }

            let header_length = be_u32(head, 100) as usize;

            if incompatible & INCOMPAT_COMPRESSION != 0 {
                if header_length <= V3_HEADER_LEN || head.len() <= V3_HEADER_LEN {
                    return Err(corrupt("missing compression type"));
                }

                compression = match head[V3_HEADER_LEN] {
                    0 => CompressionType::Deflate,
                    1 => CompressionType::Zstd,
                    other => return Err(unsupported(format!("compression type {other}"))),
                };
            }
        }

        Ok(Header {
            cluster_bits,
            size: be_u64(head, 24),
            l1_size: be_u32(head, 36),
            l1_table_offset: be_u64(head, 40),
            compression,
        })
    }

    fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    /// Number of entries in a L2 table.
    fn l2_entries(&self) -> u64 {
        self.cluster_size() / 8
    }
}

/// A qcow2 image copied to a scratch file.
pub(crate) struct Qcow2Image {
    file: File,
    file_len: u64,
    header: Header,
    l1: Vec<u64>,
}

impl Qcow2Image {
    /// Copy `reader` to an unnamed file in `scratch_dir`, and parse its
    /// header and L1 table.
    pub fn spool(mut reader: impl Read, scratch_dir: &Path) -> Result<Self, ImportError> {
        let scratch_error = |e: io::Error| ImportError::write(scratch_dir.display(), e);

        let mut file = Directory::new(scratch_dir)
            .and_then(|d| d.tmpfile())
            .map_err(|e| scratch_error(e.into()))?;

        let file_len = copy_to_scratch(&mut reader, &mut file).map_err(|e| match e {
            SpoolError::Read(e) => ImportError::from_read(e),
            SpoolError::Write(e) => scratch_error(e),
        })?;

        tracing::debug!(file_len, "qcow2 image copied to scratch space.");

        let mut head = vec![0; (V3_HEADER_LEN + 8).min(file_len as usize)];
        file.read_exact_at(&mut head, 0)
            .map_err(ImportError::from_read)?;

        let header = Header::parse(&head)?;

        // Check that the L1 table can map the whole image.
        let clusters = header.size.div_ceil(header.cluster_size());
        let needed_l1 = clusters.div_ceil(header.l2_entries());
        if u64::from(header.l1_size) < needed_l1 {
            return Err(corrupt(format!(
                "L1 table has {} entries, {needed_l1} needed",
                header.l1_size
            )));
        }

        let l1_len = needed_l1 * 8;
        if l1_len > file_len {
            return Err(corrupt(format!("L1 table with {l1_len} bytes is out of range")));
        }

        let mut image = Qcow2Image {
            file,
            file_len,
            header,
            l1: Vec::new(),
        };

        let mut table = vec![0; needed_l1 as usize * 8];
        image.read_at(&mut table, image.header.l1_table_offset, "L1 table")?;

        image.l1 = table
            .chunks_exact(8)
            .map(|c| be_u64(c, 0))
            .collect();

        Ok(image)
    }

    /// Size of the disk image.
    pub fn virtual_size(&self) -> u64 {
        self.header.size
    }

    pub fn into_reader(self) -> Qcow2Reader {
        let cluster_size = self.header.cluster_size() as usize;
        Qcow2Reader {
            image: self,
            next_cluster: 0,
            cluster: vec![0; cluster_size],
            position: 0,
            filled: 0,
            l2_cache: None,
        }
    }

    /// Read `buf.len()` bytes at `offset` of the scratch file.
    fn read_at(&self, buf: &mut [u8], offset: u64, what: &str) -> Result<(), ImportError> {
        let in_bounds = offset
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= self.file_len);

        if !in_bounds {
            return Err(corrupt(format!("{what} at offset {offset} is out of range")));
        }

        self.file
            .read_exact_at(buf, offset)
            .map_err(ImportError::from_read)
    }
}

enum SpoolError {
    Read(io::Error),
    Write(io::Error),
}

fn copy_to_scratch(reader: &mut impl Read, file: &mut File) -> Result<u64, SpoolError> {
    use std::io::Write;

    let mut buffer = vec![0u8; crate::space::COPY_BUFFER_SIZE];
    let mut total = 0;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SpoolError::Read(e)),
        };

        file.write_all(&buffer[..n]).map_err(SpoolError::Write)?;
        total += n as u64;
    }
}

/// Reader to emit the clusters of the image, in order.
pub(crate) struct Qcow2Reader {
    image: Qcow2Image,

    /// Index of the cluster to load when `cluster` is consumed.
    next_cluster: u64,

    cluster: Vec<u8>,
    position: usize,
    filled: usize,

    /// Last L2 table, and its offset in the file.
    l2_cache: Option<(u64, Vec<u64>)>,
}

impl Qcow2Reader {
    /// Load the next cluster into the buffer.
    ///
    /// Returns `false` if the whole image was read.
    fn load_cluster(&mut self) -> Result<bool, ImportError> {
        let header = &self.image.header;
        let cluster_size = header.cluster_size();

        let start = self.next_cluster * cluster_size;
        if start >= header.size {
            return Ok(false);
        }

        let l1_index = (self.next_cluster / header.l2_entries()) as usize;
        let l2_index = (self.next_cluster % header.l2_entries()) as usize;

        self.position = 0;
        self.filled = (header.size - start).min(cluster_size) as usize;
        self.next_cluster += 1;

        let l2_offset = self.image.l1[l1_index] & OFFSET_MASK;
        if l2_offset == 0 {
            self.cluster.fill(0);
            return Ok(true);
        }

        let entry = self.l2_entry(l2_offset, l2_index)?;

        if entry & L2_COMPRESSED != 0 {
            return self.load_compressed(entry).map(|_| true);
        }

        let offset = entry & OFFSET_MASK;

        if entry & L2_ZERO != 0 || offset == 0 {
            self.cluster.fill(0);
            return Ok(true);
        }

        if offset % cluster_size != 0 {
            return Err(corrupt(format!("unaligned data cluster at {offset}")));
        }

        self.image.read_at(&mut self.cluster, offset, "data cluster")?;
        Ok(true)
    }

    fn l2_entry(&mut self, l2_offset: u64, index: usize) -> Result<u64, ImportError> {
        match &self.l2_cache {
            Some((offset, table)) if *offset == l2_offset => return Ok(table[index]),
            _ => (),
        }

        if l2_offset % self.image.header.cluster_size() != 0 {
            return Err(corrupt(format!("unaligned L2 table at {l2_offset}")));
        }

        let mut table = vec![0; self.image.header.cluster_size() as usize];
        self.image.read_at(&mut table, l2_offset, "L2 table")?;

        let table: Vec<u64> = table.chunks_exact(8).map(|c| be_u64(c, 0)).collect();
        let entry = table[index];

        self.l2_cache = Some((l2_offset, table));
        Ok(entry)
    }

    fn load_compressed(&mut self, entry: u64) -> Result<(), ImportError> {
        let cluster_bits = self.image.header.cluster_bits;

        // The descriptor contains the host offset in the lower `x` bits,
        // and the number of additional sectors after them.
        let x = 62 - (cluster_bits - 8);
        let offset = entry & ((1 << x) - 1);
        let sectors = ((entry >> x) & ((1 << (cluster_bits - 8)) - 1)) + 1;

        let length = (sectors * SECTOR_SIZE - (offset % SECTOR_SIZE))
            .min(self.image.file_len.saturating_sub(offset));

        let mut input = vec![0; length as usize];
        self.image.read_at(&mut input, offset, "compressed cluster")?;

        let result = match self.image.header.compression {
            CompressionType::Deflate => {
                flate2::read::DeflateDecoder::new(&input[..]).read_exact(&mut self.cluster)
            }

            #[cfg(feature = "zstd")]
            CompressionType::Zstd => zstd::stream::read::Decoder::with_buffer(&input[..])
                .and_then(|mut d| d.read_exact(&mut self.cluster)),

            #[cfg(not(feature = "zstd"))]
            CompressionType::Zstd => {
                return Err(unsupported("zstd support is not enabled"));
            }
        };

        result.map_err(|e| corrupt(format!("compressed cluster at {offset}: {e}")))
    }
}

impl Read for Qcow2Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.position == self.filled && !self.load_cluster().map_err(ImportError::into_io)? {
            return Ok(0);
        }

        let n = buf.len().min(self.filled - self.position);
        buf[..n].copy_from_slice(&self.cluster[self.position..self.position + n]);
        self.position += n;

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;

    const CLUSTER: usize = 512;

    /// Build a qcow2 image with 512-byte clusters.
    ///
    /// Virtual clusters:
    ///
    /// 0. Data (`0xAA`).
    /// 1. Unallocated.
    /// 2. Zero flag, pointing to the data of cluster 0.
    /// 3. Compressed (`0x55`).
    /// 4. Data (`0x11`), only 100 bytes in the virtual size.
    fn sample_image() -> (Vec<u8>, Vec<u8>) {
        let size = 4 * CLUSTER as u64 + 100;

        let mut image = vec![0u8; 6 * CLUSTER];

        // Header.
        image[0..4].copy_from_slice(b"QFI\xfb");
        image[4..8].copy_from_slice(&3u32.to_be_bytes());
        image[20..24].copy_from_slice(&9u32.to_be_bytes());
        image[24..32].copy_from_slice(&size.to_be_bytes());
        image[36..40].copy_from_slice(&1u32.to_be_bytes());
        image[40..48].copy_from_slice(&(CLUSTER as u64).to_be_bytes());
        image[96..100].copy_from_slice(&4u32.to_be_bytes());
        image[100..104].copy_from_slice(&112u32.to_be_bytes());

        // L1 table, in cluster 1.
        let copied = 1u64 << 63;
        let l2_offset = 2 * CLUSTER as u64;
        image[CLUSTER..CLUSTER + 8].copy_from_slice(&(l2_offset | copied).to_be_bytes());

        // Compressed data, in cluster 4.
        let mut deflate =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::best());
        deflate.write_all(&[0x55; CLUSTER]).unwrap();
        let compressed = deflate.finish().unwrap();
        assert!(compressed.len() < CLUSTER);
        image[4 * CLUSTER..4 * CLUSTER + compressed.len()].copy_from_slice(&compressed);

        // L2 table, in cluster 2.
        let l2 = [
            (3 * CLUSTER as u64) | copied,
            0,
            (3 * CLUSTER as u64) | L2_ZERO | copied,
            (4 * CLUSTER as u64) | L2_COMPRESSED,
            (5 * CLUSTER as u64) | copied,
        ];

        for (i, entry) in l2.iter().enumerate() {
            let offset = 2 * CLUSTER + i * 8;
            image[offset..offset + 8].copy_from_slice(&entry.to_be_bytes());
        }

        image[3 * CLUSTER..4 * CLUSTER].fill(0xAA);
        image[5 * CLUSTER..6 * CLUSTER].fill(0x11);

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0xAA; CLUSTER]);
        expected.extend_from_slice(&[0; 2 * CLUSTER]);
        expected.extend_from_slice(&[0x55; CLUSTER]);
        expected.extend_from_slice(&[0x11; 100]);

        (image, expected)
    }

    fn convert(image: &[u8]) -> Result<Vec<u8>, ImportError> {
        let scratch = tempfile::tempdir().unwrap();
        let image = Qcow2Image::spool(Cursor::new(image), scratch.path())?;

        let mut output = Vec::new();
        image
            .into_reader()
            .read_to_end(&mut output)
            .map_err(ImportError::from_read)?;

        Ok(output)
    }

    #[test]
    fn emit_clusters_in_order() {
        let (image, expected) = sample_image();

        let scratch = tempfile::tempdir().unwrap();
        let parsed = Qcow2Image::spool(Cursor::new(&image), scratch.path()).unwrap();
        assert_eq!(parsed.virtual_size(), expected.len() as u64);

        assert_eq!(convert(&image).unwrap(), expected);
    }

    #[test]
    fn reject_backing_files() {
        let (mut image, _) = sample_image();
        image[8..16].copy_from_slice(&4000u64.to_be_bytes());

        assert!(matches!(
            convert(&image),
            Err(ImportError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn reject_encrypted_images() {
        let (mut image, _) = sample_image();
        image[32..36].copy_from_slice(&1u32.to_be_bytes());

        assert!(matches!(
            convert(&image),
            Err(ImportError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn reject_corrupt_images() {
        // Corrupt bit.
        let (mut image, _) = sample_image();
        image[72..80].copy_from_slice(&INCOMPAT_CORRUPT.to_be_bytes());
        assert!(matches!(convert(&image), Err(ImportError::CorruptSource(_))));

        // L1 table outside the file.
        let (mut image, _) = sample_image();
        image[40..48].copy_from_slice(&(1u64 << 40).to_be_bytes());
        assert!(matches!(convert(&image), Err(ImportError::CorruptSource(_))));

        // Data cluster outside the file.
        let (mut image, _) = sample_image();
        let entry = (64 * CLUSTER as u64) | (1 << 63);
        image[2 * CLUSTER..2 * CLUSTER + 8].copy_from_slice(&entry.to_be_bytes());
        assert!(matches!(convert(&image), Err(ImportError::CorruptSource(_))));

        // Truncated header.
        assert!(matches!(
            convert(b"QFI\xfb\x00\x00\x00\x03"),
            Err(ImportError::CorruptSource(_))
        ));
    }
}
