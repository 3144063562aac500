use std::{fmt, str::FromStr};

/// Media types of the registry objects read to find a container disk.
#[derive(Copy, Clone, PartialEq, Debug, serde::Deserialize)]
#[serde(try_from = "String")]
pub(crate) enum MediaType {
    DockerManifestList,
    DockerManifestV2,
    OciImageIndex,
    OciManifestV1,
    DockerFsTar,
    DockerFsTarGzip,
    OciFsTar,
    OciFsTarGzip,
    OciFsTarZstd,
}

const NAMES: &[(MediaType, &str)] = &[
    (
        MediaType::DockerManifestList,
        "application/vnd.docker.distribution.manifest.list.v2+json",
    ),
    (
        MediaType::DockerManifestV2,
        "application/vnd.docker.distribution.manifest.v2+json",
    ),
    (MediaType::OciImageIndex, "application/vnd.oci.image.index.v1+json"),
    (MediaType::OciManifestV1, "application/vnd.oci.image.manifest.v1+json"),
    (MediaType::DockerFsTar, "application/vnd.docker.image.rootfs.diff.tar"),
    (
        MediaType::DockerFsTarGzip,
        "application/vnd.docker.image.rootfs.diff.tar.gzip",
    ),
    (MediaType::OciFsTar, "application/vnd.oci.image.layer.v1.tar"),
    (MediaType::OciFsTarGzip, "application/vnd.oci.image.layer.v1.tar+gzip"),
    (MediaType::OciFsTarZstd, "application/vnd.oci.image.layer.v1.tar+zstd"),
];

impl MediaType {
    /// Value for the `Accept` header of manifest requests.
    pub(crate) fn accepted_manifests() -> String {
        NAMES
            .iter()
            .filter(|(t, _)| t.is_manifest())
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn is_manifest(self) -> bool {
        matches!(
            self,
            MediaType::DockerManifestList
                | MediaType::DockerManifestV2
                | MediaType::OciImageIndex
                | MediaType::OciManifestV1
        )
    }

    pub fn as_str(self) -> &'static str {
        NAMES
            .iter()
            .find(|(t, _)| *t == self)
            .map_or("", |(_, name)| name)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Unknown media type {0:?}.")]
pub(crate) struct InvalidMediaType(String);

impl FromStr for MediaType {
    type Err = InvalidMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(t, _)| *t)
            .ok_or_else(|| InvalidMediaType(s.to_owned()))
    }
}

impl TryFrom<String> for MediaType {
    type Error = InvalidMediaType;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[test]
fn media_type_in_json() {
    #[derive(serde::Deserialize, Debug)]
    struct Layer {
        #[serde(rename = "mediaType")]
        media_type: MediaType,
    }

    let layer: Layer =
        serde_json::from_str(r#"{"mediaType": "application/vnd.oci.image.layer.v1.tar+zstd"}"#)
            .unwrap();
    assert_eq!(layer.media_type, MediaType::OciFsTarZstd);

    assert!(serde_json::from_str::<Layer>(r#"{"mediaType": "text/plain"}"#).is_err());
}

#[test]
fn accept_only_manifests() {
    let accept = MediaType::accepted_manifests();

    assert!(accept.contains("application/vnd.oci.image.index.v1+json"));
    assert!(accept.contains("application/vnd.docker.distribution.manifest.v2+json"));
    assert!(!accept.contains("layer"));
}
