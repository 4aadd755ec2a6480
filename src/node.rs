//! What each kind of path answers to `stat`, `list` and `read`.

use std::collections::BTreeSet;

use crate::{
    context::Context,
    digest::{Digest, ALGORITHM},
    error::{Error, Result},
    path::{BlobLevel, Directory, LayerLevel, LinkKind, ManifestLevel, Node, NodeKind},
    pipe::BlobReader,
    store::Store,
};

/// Metadata reported by `stat`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

impl FileInfo {
    fn dir(path: &str) -> Self {
        FileInfo {
            path: path.to_string(),
            size: 0,
            is_dir: true,
        }
    }

    fn file(path: &str, size: u64) -> Self {
        FileInfo {
            path: path.to_string(),
            size,
            is_dir: false,
        }
    }
}

/// Content of a link file.
fn link_content(digest: &Digest) -> String {
    digest.to_string()
}

impl Node {
    /// Fails with not found unless everything the path names exists.
    ///
    /// Blob leaves are checked by reconciling them, and blob prefix
    /// directories are only checked by [`Node::stat`].
    fn check_exists<S: Store + ?Sized>(&self, ctx: &Context, store: &S) -> Result<()> {
        let present = match self.kind() {
            NodeKind::Directory(_)
            | NodeKind::BlobIndex(BlobLevel::Root | BlobLevel::Algorithm | BlobLevel::Prefix(_))
            | NodeKind::BlobLeaf(_)
            | NodeKind::RepositoryIndex => true,
            NodeKind::BlobIndex(BlobLevel::Digest(digest)) => {
                ctx.check()?;
                store.list_blobs()?.contains(digest)
            }
            NodeKind::Repository(repo)
            | NodeKind::LayerIndex {
                repo,
                level: LayerLevel::Container | LayerLevel::Algorithm,
            }
            | NodeKind::ManifestIndex {
                repo,
                level: ManifestLevel::Container | ManifestLevel::Revisions | ManifestLevel::Algorithm,
            } => repo_exists(ctx, store, repo)?,
            NodeKind::LayerIndex {
                repo,
                level: LayerLevel::Digest(digest),
            }
            | NodeKind::LinkLeaf {
                repo,
                kind: LinkKind::Layer,
                digest,
            } => repo_exists(ctx, store, repo)? && {
                ctx.check()?;
                store.list_repo_layers(repo)?.contains(digest)
            },
            NodeKind::ManifestIndex {
                repo,
                level: ManifestLevel::Digest(digest),
            }
            | NodeKind::LinkLeaf {
                repo,
                kind: LinkKind::Revision,
                digest,
            } => repo_exists(ctx, store, repo)? && {
                ctx.check()?;
                store.list_repo_revisions(repo)?.contains(digest)
            },
        };
        if present {
            Ok(())
        } else {
            Err(Error::not_found(self.path()))
        }
    }

    pub fn stat<S: Store + ?Sized>(&self, ctx: &Context, store: &S) -> Result<FileInfo> {
        ctx.check()?;
        self.check_exists(ctx, store)?;
        match self.kind() {
            NodeKind::BlobLeaf(digest) => {
                let (_, size) = store.get_blob(ctx, digest)?;
                Ok(FileInfo::file(self.path(), size))
            }
            NodeKind::LinkLeaf { digest, .. } => {
                Ok(FileInfo::file(self.path(), link_content(digest).len() as u64))
            }
            NodeKind::BlobIndex(BlobLevel::Prefix(prefix)) => {
                ctx.check()?;
                if store.list_blobs()?.iter().any(|d| d.prefix() == prefix) {
                    Ok(FileInfo::dir(self.path()))
                } else {
                    Err(Error::not_found(self.path()))
                }
            }
            _ => Ok(FileInfo::dir(self.path())),
        }
    }

    /// Full paths of the children, sorted.
    pub fn list<S: Store + ?Sized>(&self, ctx: &Context, store: &S) -> Result<Vec<String>> {
        ctx.check()?;
        // leaves are never directories, whether or not they exist
        if !matches!(self.kind(), NodeKind::BlobLeaf(_) | NodeKind::LinkLeaf { .. }) {
            self.check_exists(ctx, store)?;
        }
        let children: BTreeSet<String> = match self.kind() {
            NodeKind::BlobLeaf(_) | NodeKind::LinkLeaf { .. } => {
                return Err(Error::NotADirectory(self.path().to_string()))
            }
            NodeKind::Directory(dir) => match dir {
                Directory::Root => names(["docker"]),
                Directory::Docker => names(["registry"]),
                Directory::Registry => names(["v2"]),
                Directory::V2 => names(["blobs", "repositories"]),
            },
            NodeKind::BlobIndex(level) => match level {
                BlobLevel::Root => names([ALGORITHM]),
                BlobLevel::Algorithm => store
                    .list_blobs()?
                    .iter()
                    .map(|d| d.prefix().to_string())
                    .collect(),
                BlobLevel::Prefix(prefix) => store
                    .list_blobs()?
                    .into_iter()
                    .filter(|d| d.prefix() == prefix)
                    .map(|d| d.hex().to_string())
                    .collect(),
                BlobLevel::Digest(_) => names(["data"]),
            },
            NodeKind::RepositoryIndex => store.list_repos()?.into_iter().collect(),
            NodeKind::Repository(_) => names(["_layers", "_manifests"]),
            NodeKind::LayerIndex { repo, level } => match level {
                LayerLevel::Container => names([ALGORITHM]),
                LayerLevel::Algorithm => hexes(store.list_repo_layers(repo)?),
                LayerLevel::Digest(_) => names(["link"]),
            },
            NodeKind::ManifestIndex { repo, level } => match level {
                ManifestLevel::Container => names(["revisions"]),
                ManifestLevel::Revisions => names([ALGORITHM]),
                ManifestLevel::Algorithm => hexes(store.list_repo_revisions(repo)?),
                ManifestLevel::Digest(_) => names(["link"]),
            },
        };
        Ok(children.iter().map(|name| self.child(name)).collect())
    }

    /// A stream of the file's content.  May block.
    pub fn read<S: Store + ?Sized>(&self, ctx: &Context, store: &S) -> Result<BlobReader> {
        ctx.check()?;
        match self.kind() {
            NodeKind::BlobLeaf(digest) => {
                let (source, size) = store.get_blob(ctx, digest)?;
                log::debug!("reading {} ({size} bytes) from {source:?}", self.path());
                source.open(ctx)
            }
            NodeKind::LinkLeaf { digest, .. } => {
                self.check_exists(ctx, store)?;
                Ok(BlobReader::memory(link_content(digest).into_bytes().into()))
            }
            _ => Err(Error::IsADirectory(self.path().to_string())),
        }
    }
}

fn repo_exists<S: Store + ?Sized>(ctx: &Context, store: &S, repo: &str) -> Result<bool> {
    ctx.check()?;
    Ok(store.list_repos()?.iter().any(|r| r == repo))
}

fn names<const N: usize>(names: [&str; N]) -> BTreeSet<String> {
    names.into_iter().map(str::to_string).collect()
}

fn hexes(digests: Vec<Digest>) -> BTreeSet<String> {
    digests.into_iter().map(|d| d.hex().to_string()).collect()
}
