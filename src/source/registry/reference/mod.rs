mod parser;

use crate::digest::Digest;

/// Errors from [`Reference::try_from`].
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("Missing repository.")]
    MissingRepository,

    #[error("{0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
}

/// Reference to an image in a container registry.
///
/// The parser tries to be close to what `docker pull` does:
///
/// * An optional `docker://` prefix is ignored.
/// * If the reference does not include the hostname of the registry,
///   it uses Docker Hub, and the repository namespace defaults to
///   `library` if there is none. `fedora` is parsed as
///   `registry-1.docker.io/library/fedora`.
/// * It accepts any tag value after the last `:` character. If no tag
///   is given, it uses `latest`.
/// * It accepts a fixed digest (the last part after a `@` character), but
///   only SHA256 and SHA512.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Reference<'a> {
    /// Address of the registry server.
    pub registry: &'a str,

    /// Repository name.
    pub repository: Repository<'a>,

    /// Image tag.
    pub tag: &'a str,

    /// Manifest digest, if present.
    pub digest: Option<Digest>,
}

/// Represents a repository name, like `library/fedora`
/// or `kubevirt/cirros-container-disk-demo`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Repository<'a>(RepositoryInner<'a>);

impl<'a> Repository<'a> {
    pub(crate) fn components(namespace: &'a str, name: &'a str) -> Self {
        Repository(RepositoryInner::Components(namespace, name))
    }

    pub(crate) fn full(name: &'a str) -> Self {
        Repository(RepositoryInner::Full(name))
    }

    /// Return the name of this repository.
    pub fn name(&self) -> &str {
        match self.0 {
            RepositoryInner::Full(full) => full.rsplit_once('/').map(|s| s.1).unwrap_or(full),
            RepositoryInner::Components(_, name) => name,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum RepositoryInner<'a> {
    /// Full repository name. Namespace is optional.
    Full(&'a str),

    /// Namespace and name.
    Components(&'a str, &'a str),
}

impl std::fmt::Display for Repository<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            RepositoryInner::Full(full) => f.write_str(full),
            RepositoryInner::Components(a, b) => write!(f, "{a}/{b}"),
        }
    }
}

impl std::fmt::Display for Reference<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;

        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest.as_str())?;
        }

        Ok(())
    }
}

impl<'a> TryFrom<&'a str> for Reference<'a> {
    type Error = ParseError;

    fn try_from(reference: &'a str) -> Result<Self, Self::Error> {
        parser::parse(reference)
    }
}
