//! Decoders applied to a source stream before it reaches the destination.
//!
//! Each stage looks at the first bytes of the stream to detect the format,
//! and then puts those bytes back in front of the stream, so the data is
//! read only once.
//!
//! 1. [`decompress`]: gzip, xz and zstd are removed.
//! 2. [`decode_image`]: qcow2 images are converted to a flat image, and raw
//!    images are passed through.

mod qcow2;

use std::{
    io::{Cursor, Read},
    path::Path,
};

use crate::{source::SourceStream, ImportError};

/// Bytes read from the stream to detect the image format.
///
/// The VDI signature is the furthest from the start of the stream.
const IMAGE_HEAD_LEN: usize = 512;

const GZIP_MAGIC: &[u8] = b"\x1f\x8b";

const XZ_MAGIC: &[u8] = b"\xfd7zXZ\x00";

const ZSTD_MAGIC: &[u8] = b"\x28\xb5\x2f\xfd";

const QCOW2_MAGIC: &[u8] = b"QFI\xfb";

const VMDK_MAGIC: &[u8] = b"KDMV";

const VHDX_MAGIC: &[u8] = b"vhdxfile";

const VHD_MAGIC: &[u8] = b"conectix";

/// Offset and value of the signature in a VDI header.
const VDI_SIGNATURE: (usize, u32) = (64, 0xbeda_107f);

/// Compression detected in the head of a stream.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(GZIP_MAGIC) {
            Some(Compression::Gzip)
        } else if head.starts_with(XZ_MAGIC) {
            Some(Compression::Xz)
        } else if head.starts_with(ZSTD_MAGIC) {
            Some(Compression::Zstd)
        } else {
            None
        }
    }
}

/// Format of a (decompressed) disk image.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum ImageFormat {
    Raw,
    Qcow2,
    Unsupported(&'static str),
}

impl ImageFormat {
    fn detect(head: &[u8]) -> Self {
        if head.starts_with(QCOW2_MAGIC) {
            return ImageFormat::Qcow2;
        }

        if head.starts_with(VMDK_MAGIC) {
            return ImageFormat::Unsupported("vmdk");
        }

        if head.starts_with(VHDX_MAGIC) {
            return ImageFormat::Unsupported("vhdx");
        }

        if head.starts_with(VHD_MAGIC) {
            return ImageFormat::Unsupported("vhd");
        }

        let (offset, signature) = VDI_SIGNATURE;
        let vdi = head
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes);

        if vdi == Some(signature) {
            return ImageFormat::Unsupported("vdi");
        }

        ImageFormat::Raw
    }
}

/// Read up to `len` bytes from the stream, and return them with a new
/// reader that yields the same bytes as the original one.
fn peek(
    mut reader: Box<dyn Read + Send>,
    len: usize,
) -> Result<(Vec<u8>, Box<dyn Read + Send>), ImportError> {
    let mut head = Vec::with_capacity(len);

    reader
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut head)
        .map_err(ImportError::from_read)?;

    let reader: Box<dyn Read + Send> = Box::new(Cursor::new(head.clone()).chain(reader));
    Ok((head, reader))
}

/// Remove the compression of the stream, if any.
///
/// The declared length is discarded when the stream is compressed.
pub(crate) fn decompress(stream: SourceStream) -> Result<SourceStream, ImportError> {
    let (head, reader) = peek(stream.reader, XZ_MAGIC.len())?;

    let reader: Box<dyn Read + Send> = match Compression::detect(&head) {
        None => {
            return Ok(SourceStream {
                reader,
                length: stream.length,
            })
        }

        Some(Compression::Gzip) => Box::new(flate2::read::MultiGzDecoder::new(reader)),

        Some(Compression::Xz) => Box::new(liblzma::read::XzDecoder::new_multi_decoder(reader)),

        #[cfg(feature = "zstd")]
        Some(Compression::Zstd) => Box::new(
            zstd::stream::read::Decoder::new(reader).map_err(ImportError::from_read)?,
        ),

        #[cfg(not(feature = "zstd"))]
        Some(Compression::Zstd) => {
            return Err(ImportError::UnsupportedFormat(
                "zstd support is not enabled".into(),
            ))
        }
    };

    tracing::info!(compression = ?Compression::detect(&head), "Decompressing source.");

    Ok(SourceStream {
        reader,
        length: None,
    })
}

/// Convert the stream to a flat disk image.
///
/// qcow2 images need random access, so they are copied to an unnamed
/// file in `scratch_dir` before decoding.
pub(crate) fn decode_image(
    stream: SourceStream,
    scratch_dir: &Path,
) -> Result<SourceStream, ImportError> {
    let (head, reader) = peek(stream.reader, IMAGE_HEAD_LEN)?;

    match ImageFormat::detect(&head) {
        ImageFormat::Raw => Ok(SourceStream {
            reader,
            length: stream.length,
        }),

        ImageFormat::Qcow2 => {
            let image = qcow2::Qcow2Image::spool(reader, scratch_dir)?;
            let length = image.virtual_size();

            tracing::info!(virtual_size = length, "Converting qcow2 image.");

            Ok(SourceStream {
                reader: Box::new(image.into_reader()),
                length: Some(length),
            })
        }

        ImageFormat::Unsupported(format) => Err(ImportError::UnsupportedFormat(format!(
            "{format} images can't be imported"
        ))),
    }
}
