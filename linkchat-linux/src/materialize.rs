//! Folder packaging and post-receive fixups. Blocking; callers go through [`blocking`].

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Turns folders into a single archive and back, and hands received items to their owner.
pub trait Materializer: Send + Sync {
    fn pack(&self, folder: &Path, archive: &Path) -> io::Result<()>;
    /// Extract `archive` into `dest`, creating it if needed.
    fn unpack(&self, archive: &Path, dest: &Path) -> io::Result<()>;
    /// Recursively reassign `path`; a no-op when no owner is configured.
    fn fix_ownership(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    uid: u32,
    gid: u32,
}

/// Deflate zip archives; optional chown to the invoking sudo user.
#[derive(Debug, Default)]
pub struct ZipMaterializer {
    owner: Option<Owner>,
}

impl ZipMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Received items go to the user who ran `sudo`, read from SUDO_UID/SUDO_GID.
    pub fn from_sudo_env() -> Self {
        Self::from_env(|k| std::env::var(k).ok())
    }

    fn from_env(var: impl Fn(&str) -> Option<String>) -> Self {
        let id = |k: &str| var(k).and_then(|s| s.trim().parse::<u32>().ok());
        let owner = match (id("SUDO_UID"), id("SUDO_GID")) {
            (Some(uid), Some(gid)) => Some(Owner { uid, gid }),
            _ => None,
        };
        if let Some(o) = owner {
            tracing::debug!(uid = o.uid, gid = o.gid, "received items will be chowned");
        }
        Self { owner }
    }
}

impl Materializer for ZipMaterializer {
    fn pack(&self, folder: &Path, archive: &Path) -> io::Result<()> {
        let mut zip = ZipWriter::new(File::create(archive)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        add_tree(&mut zip, folder, folder, options)?;
        zip.finish().map_err(io::Error::other)?;
        Ok(())
    }

    fn unpack(&self, archive: &Path, dest: &Path) -> io::Result<()> {
        fs::create_dir_all(dest)?;
        let mut zip = ZipArchive::new(File::open(archive)?).map_err(io::Error::other)?;
        zip.extract(dest).map_err(io::Error::other)
    }

    fn fix_ownership(&self, path: &Path) -> io::Result<()> {
        match self.owner {
            Some(owner) => chown_tree(path, owner),
            None => Ok(()),
        }
    }
}

fn add_tree(
    zip: &mut ZipWriter<File>,
    root: &Path,
    dir: &Path,
    options: SimpleFileOptions,
) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let name = archive_name(root, &path)?;
        let kind = entry.file_type()?;
        if kind.is_dir() {
            zip.add_directory(name, options).map_err(io::Error::other)?;
            add_tree(zip, root, &path, options)?;
        } else if kind.is_file() {
            zip.start_file(name, options).map_err(io::Error::other)?;
            io::copy(&mut File::open(&path)?, zip)?;
        } else {
            tracing::debug!(path = %path.display(), "skipping non-regular entry");
        }
    }
    Ok(())
}

/// `path` relative to `root`, '/'-separated.
fn archive_name(root: &Path, path: &Path) -> io::Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

fn chown_tree(path: &Path, owner: Owner) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid))?;
    if fs::symlink_metadata(path)?.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_tree(&entry?.path(), owner)?;
        }
    }
    Ok(())
}

/// Run blocking filesystem work off the async workers.
pub async fn blocking<F, T>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}
