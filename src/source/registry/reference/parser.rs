//! Parse a reference to an image in a container registry.
//!
//! It tries to be close to what `docker pull` does, but it does not try
//! to be bug-for-bug compatible.

use super::*;

/// Hostname to use when the reference is just the repository,
/// like `fedora` or `kubevirt/fedora-cloud-container-disk-demo`.
const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

const DEFAULT_NAMESPACE: &str = "library";

const DEFAULT_TAG: &str = "latest";

/// Prefix used by importer endpoints for registry sources.
const DOCKER_SCHEME: &str = "docker://";

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<Reference<'_>> {
    let reference = reference.strip_prefix(DOCKER_SCHEME).unwrap_or(reference);

    // Extract the digest after the last `@`.
    let (base, digest) = match reference.rsplit_once('@') {
        None => (reference, None),
        Some((base, d)) => (base, Some(Digest::try_from(d.to_owned())?)),
    };

    // Extract the tag after the last `:`.
    //
    // If the value contains a `/`, it assumes that the value after `:`
    // is a port number, and not a tag.
    let (base, tag) = match base.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => (base, tag),
        _ => (base, DEFAULT_TAG),
    };

    // Imitate the logic from `docker pull` to get the repository.
    let (registry, repository) = match base.split_once('/') {
        // There is no `/`. The reference is an image in the
        // `library` repository.
        None => (
            DEFAULT_REGISTRY,
            Repository::components(DEFAULT_NAMESPACE, base),
        ),

        // There is a `.` or a `:` before the `/`. Parse it as a hostname.
        Some((registry, repository))
            if registry.contains('.') || registry.contains(':') || registry == "localhost" =>
        {
            (registry, Repository::full(repository))
        }

        // Assume it is a repository in the default registry.
        Some(_) => (DEFAULT_REGISTRY, Repository::full(base)),
    };

    if repository.name().is_empty() {
        return Err(ParseError::MissingRepository);
    }

    Ok(Reference {
        registry,
        repository,
        tag,
        digest,
    })
}

#[test]
fn parse_valid_references() {
    use crate::digest::HexString;
    use sha2::{Digest as _, Sha256};

    macro_rules! check {
        ($reference:expr, [ $registry:expr, $repository:expr, $tag:expr, $digest:expr ]) => {
            let reference = $reference;
            assert_eq!(
                Reference::try_from(<_ as AsRef<str>>::as_ref(&reference)).unwrap(),
                Reference {
                    registry: $registry,
                    repository: $repository,
                    tag: $tag,
                    digest: $digest,
                }
            )
        };
    }

    let sha256 = HexString(Sha256::digest(b"\x00\x01"));

    check!(
        "fedora",
        [
            DEFAULT_REGISTRY,
            Repository::components("library", "fedora"),
            DEFAULT_TAG,
            None
        ]
    );

    check!(
        "docker://kubevirt/cirros-container-disk-demo",
        [
            DEFAULT_REGISTRY,
            Repository::full("kubevirt/cirros-container-disk-demo"),
            DEFAULT_TAG,
            None
        ]
    );

    check!(
        "docker://quay.io/containerdisks/fedora:40",
        [
            "quay.io",
            Repository::full("containerdisks/fedora"),
            "40",
            None
        ]
    );

    check!(
        "127.0.0.1:5000/disks/cirros:0.1",
        [
            "127.0.0.1:5000",
            Repository::full("disks/cirros"),
            "0.1",
            None
        ]
    );

    check!(
        &format!("registry.local/disks/cirros:1.2.3@sha256:{sha256}"),
        [
            "registry.local",
            Repository::full("disks/cirros"),
            "1.2.3",
            Digest::try_from(format!("sha256:{sha256}")).ok()
        ]
    );
}

#[test]
fn reject_invalid_references() {
    use crate::digest::DigestError;

    assert!(matches!(
        Reference::try_from("fedora:40@md5:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidAlgorithm)),
    ));

    assert!(matches!(
        Reference::try_from("quay.io/"),
        Err(ParseError::MissingRepository),
    ));
}
