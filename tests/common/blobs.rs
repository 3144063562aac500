//! Blobs served by the test registry.

use std::{io::Write, path::Path};

use sha2::{Digest, Sha256};

pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";

pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

pub const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

#[derive(Debug)]
pub struct Blob {
    pub media_type: &'static str,

    /// SHA-256 of `data`, as a hex string.
    pub digest: String,

    pub data: Box<[u8]>,
}

impl Blob {
    pub fn new(media_type: &'static str, data: impl Into<Box<[u8]>>) -> Blob {
        let data = data.into();
        let digest = format!("{:x}", Sha256::digest(&data));

        Blob {
            media_type,
            digest,
            data,
        }
    }

    /// Start a layer. The tar stream is compressed according to
    /// `media_type` when the layer is built.
    pub fn archive(media_type: &'static str) -> LayerBuilder {
        LayerBuilder {
            media_type,
            tar: tar::Builder::new(Vec::new()),
        }
    }

    /// Descriptor of this blob in a manifest.
    pub fn descriptor(&self) -> serde_json::Value {
        serde_json::json!({
            "mediaType": self.media_type,
            "digest": format!("sha256:{}", self.digest),
            "size": self.data.len(),
        })
    }
}

pub struct LayerBuilder {
    media_type: &'static str,
    tar: tar::Builder<Vec<u8>>,
}

impl LayerBuilder {
    pub fn directory(mut self, path: impl AsRef<Path>) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        self.tar
            .append_data(&mut header, path, &b""[..])
            .unwrap();
        self
    }

    pub fn regular(mut self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        self.tar.append_data(&mut header, path, data).unwrap();
        self
    }

    pub fn build(self) -> Blob {
        let tar = self.tar.into_inner().unwrap();

        let data = match self.media_type {
            LAYER_GZIP => {
                let mut gz = flate2::write::GzEncoder::new(Vec::new(), Default::default());
                gz.write_all(&tar).unwrap();
                gz.finish().unwrap()
            }

            #[cfg(feature = "zstd")]
            LAYER_ZSTD => zstd::encode_all(&tar[..], 0).unwrap(),

            _ => tar,
        };

        Blob::new(self.media_type, data)
    }
}
