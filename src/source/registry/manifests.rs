use std::{
    borrow::Cow,
    env::consts,
    io::{BufReader, Read},
    str::FromStr,
};

use crate::digest::Digest;

use super::{client::Client, mediatype::MediaType, reference::Reference, RegistryError};

#[derive(serde::Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(super) struct Blob {
    pub media_type: MediaType,
    pub digest: Digest,
    pub size: u64,
}

#[derive(serde::Deserialize, Debug)]
pub(super) struct Manifest {
    pub layers: Vec<Blob>,
}

/// Download the manifest for the `reference`.
///
/// If the registry returns an image index, the manifest for the
/// architecture of the current process is used. Disk images are usually
/// published for all architectures, so the OS is not checked.
///
/// If `reference` contains a digest (like `@sha256:...`), the manifest
/// is verified against it.
pub(super) fn get(reference: &Reference, http_client: &Client) -> Result<Manifest, RegistryError> {
    // Translate to golang architecture names.
    let architecture = match consts::ARCH {
        "aarch64" => "arm64",
        "x86" => "386",
        "x86_64" => "amd64",
        other => other,
    };

    enum Tag<'a> {
        S(&'a str),
        D(Cow<'a, Digest>),
    }

    let accept = MediaType::accepted_manifests();

    let mut tag = match reference.digest.as_ref() {
        Some(d) => Tag::D(Cow::Borrowed(d)),
        None => Tag::S(reference.tag),
    };

    loop {
        let path = match &tag {
            Tag::S(s) => s,
            Tag::D(s) => s.as_str(),
        };

        let response = http_client.get(&format!("manifests/{}", path), Some(accept.as_str()))?;

        let content_type = response
            .header("Content-Type")
            .and_then(|h| h.split(';').next())
            .and_then(|h| MediaType::from_str(h.trim()).ok())
            .ok_or(RegistryError::MissingContentType)?;

        // If we have an expected digest, compute it during the download,
        // and verify it when the download is completed.
        let mut body: Box<dyn Read> = {
            let response = response.into_reader();
            match &tag {
                Tag::D(d) => Box::new(BufReader::new(d.verify(response))),
                Tag::S(_) => Box::new(response),
            }
        };

        tag = match content_type {
            MediaType::DockerManifestList | MediaType::OciImageIndex => {
                Tag::D(Cow::Owned(parse_index(architecture, &mut body)?))
            }

            MediaType::DockerManifestV2 | MediaType::OciManifestV1 => {
                // https://distribution.github.io/distribution/spec/manifest-v2-2/
                return Ok(serde_json::from_reader(&mut body)?);
            }

            unknown => {
                return Err(RegistryError::InvalidContentType(unknown));
            }
        }
    }
}

/// Parse an image index to get the digest for the specified architecture.
///
/// Entries without a platform are accepted as a fallback.
///
/// Refs:
///
/// * https://distribution.github.io/distribution/spec/manifest-v2-2/#manifest-list
/// * https://github.com/opencontainers/image-spec/blob/main/image-index.md
fn parse_index(architecture: &str, response: &mut dyn Read) -> Result<Digest, RegistryError> {
    #[derive(serde::Deserialize, Debug)]
    struct List {
        manifests: Vec<Manifest>,
    }

    #[derive(serde::Deserialize, Debug)]
    struct Manifest {
        digest: String,
        platform: Option<Platform>,
    }

    #[derive(serde::Deserialize, Debug)]
    struct Platform {
        architecture: String,
    }

    let List { manifests } = serde_json::from_reader(response)?;

    let item = manifests
        .iter()
        .find(|i| matches!(&i.platform, Some(p) if p.architecture == architecture))
        .or_else(|| manifests.iter().find(|i| i.platform.is_none()))
        .ok_or(RegistryError::MissingArchitecture)?;

    Ok(Digest::try_from(item.digest.clone())?)
}

#[test]
fn select_manifest_from_index() {
    let index = r#"{
        "manifests": [
            { "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
              "platform": { "architecture": "s390x", "os": "linux" } },
            { "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
              "platform": { "architecture": "amd64", "os": "linux" } }
        ]
    }"#;

    let digest = parse_index("amd64", &mut index.as_bytes()).unwrap();
    assert!(digest.as_str().starts_with("sha256:1111"));

    assert!(matches!(
        parse_index("riscv64", &mut index.as_bytes()),
        Err(RegistryError::MissingArchitecture)
    ));
}
