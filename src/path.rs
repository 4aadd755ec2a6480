//! Virtual paths of the registry storage layout.
//!
//! ```text
//! /docker/registry/v2/blobs/sha256/<2-hex-prefix>/<digest>/data
//! /docker/registry/v2/repositories/<name>/_layers/sha256/<digest>/link
//! /docker/registry/v2/repositories/<name>/_manifests/revisions/sha256/<digest>/link
//! ```
//!
//! Resolution only checks the shape of a path.  Whether the digests and
//! repositories it names exist is decided by the [`Node`] operations.

use crate::{
    digest::{Digest, ALGORITHM},
    error::{Error, Result},
};

const PREFIX: [&str; 3] = ["docker", "registry", "v2"];

/// `/`, `/docker`, `/docker/registry` and `/docker/registry/v2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directory {
    Root,
    Docker,
    Registry,
    V2,
}

/// Levels of `blobs/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobLevel {
    /// `blobs`
    Root,
    /// `blobs/sha256`
    Algorithm,
    /// `blobs/sha256/<prefix>`
    Prefix(String),
    /// `blobs/sha256/<prefix>/<digest>`
    Digest(Digest),
}

/// Levels of `<repo>/_layers/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerLevel {
    /// `_layers`
    Container,
    /// `_layers/sha256`
    Algorithm,
    /// `_layers/sha256/<digest>`
    Digest(Digest),
}

/// Levels of `<repo>/_manifests/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestLevel {
    /// `_manifests`
    Container,
    /// `_manifests/revisions`
    Revisions,
    /// `_manifests/revisions/sha256`
    Algorithm,
    /// `_manifests/revisions/sha256/<digest>`
    Digest(Digest),
}

/// Which set a link file belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Layer,
    Revision,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Directory(Directory),
    BlobIndex(BlobLevel),
    BlobLeaf(Digest),
    RepositoryIndex,
    Repository(String),
    LayerIndex { repo: String, level: LayerLevel },
    ManifestIndex { repo: String, level: ManifestLevel },
    LinkLeaf { repo: String, kind: LinkKind, digest: Digest },
}

/// A resolved path.  Lives for a single call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    path: String,
    kind: NodeKind,
}

fn digest_under(prefix: &str, hex: &str) -> Option<Digest> {
    Digest::from_hex(hex).ok().filter(|d| d.prefix() == prefix)
}

impl Node {
    /// Maps a virtual path to the node it names.
    ///
    /// Fails with [`Error::PathNotFound`] for anything outside the layout.
    pub fn resolve(path: &str) -> Result<Node> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let segments: Vec<&str> = trimmed.split('/').collect();
        let not_found = || Error::not_found(path);

        if segments == [""] {
            return Ok(Node::new("/".into(), NodeKind::Directory(Directory::Root)));
        }
        if segments.iter().zip(PREFIX).any(|(seg, expected)| *seg != expected) {
            return Err(not_found());
        }
        let normalized = format!("/{trimmed}");

        let kind = match segments.len() {
            1 => NodeKind::Directory(Directory::Docker),
            2 => NodeKind::Directory(Directory::Registry),
            3 => NodeKind::Directory(Directory::V2),
            _ => match segments[3] {
                "blobs" => Self::resolve_blobs(&segments[4..]).ok_or_else(not_found)?,
                "repositories" => {
                    Self::resolve_repositories(&segments[4..]).ok_or_else(not_found)?
                }
                _ => return Err(not_found()),
            },
        };
        log::trace!("resolved {path} to {kind:?}");
        Ok(Node::new(normalized, kind))
    }

    /// `rest` is everything after `blobs`.
    fn resolve_blobs(rest: &[&str]) -> Option<NodeKind> {
        if rest.last() == Some(&"data") {
            return match rest {
                [ALGORITHM, prefix, hex, "data"] => digest_under(prefix, hex).map(NodeKind::BlobLeaf),
                _ => None,
            };
        }
        let level = match rest {
            [] => BlobLevel::Root,
            [ALGORITHM] => BlobLevel::Algorithm,
            [ALGORITHM, prefix] => BlobLevel::Prefix(prefix.to_string()),
            [ALGORITHM, prefix, hex] => BlobLevel::Digest(digest_under(prefix, hex)?),
            _ => return None,
        };
        Some(NodeKind::BlobIndex(level))
    }

    /// `rest` is everything after `repositories`.
    fn resolve_repositories(rest: &[&str]) -> Option<NodeKind> {
        let Some((_, others)) = rest.split_first() else {
            return Some(NodeKind::RepositoryIndex);
        };
        let name_len = 1 + others.iter().take_while(|s| !s.starts_with('_')).count();
        let (name, tail) = rest.split_at(name_len);
        let repo = name.join("/");

        if rest.last() == Some(&"link") {
            let (kind, hex) = match tail {
                ["_layers", ALGORITHM, hex, "link"] => (LinkKind::Layer, hex),
                ["_manifests", "revisions", ALGORITHM, hex, "link"] => (LinkKind::Revision, hex),
                _ => return None,
            };
            let digest = Digest::from_hex(hex).ok()?;
            return Some(NodeKind::LinkLeaf { repo, kind, digest });
        }

        match tail {
            [] => Some(NodeKind::Repository(repo)),
            ["_layers", sub @ ..] => {
                let level = match sub {
                    [] => LayerLevel::Container,
                    [ALGORITHM] => LayerLevel::Algorithm,
                    [ALGORITHM, hex] => LayerLevel::Digest(Digest::from_hex(hex).ok()?),
                    _ => return None,
                };
                Some(NodeKind::LayerIndex { repo, level })
            }
            ["_manifests", sub @ ..] => {
                let level = match sub {
                    [] => ManifestLevel::Container,
                    ["revisions"] => ManifestLevel::Revisions,
                    ["revisions", ALGORITHM] => ManifestLevel::Algorithm,
                    ["revisions", ALGORITHM, hex] => {
                        ManifestLevel::Digest(Digest::from_hex(hex).ok()?)
                    }
                    _ => return None,
                };
                Some(NodeKind::ManifestIndex { repo, level })
            }
            _ => None,
        }
    }

    fn new(path: String, kind: NodeKind) -> Self {
        Node { path, kind }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Full path of the child called `name`.
    pub fn child(&self, name: &str) -> String {
        if self.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.path)
        }
    }
}
