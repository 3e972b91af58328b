// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Collecting source trees and copying them into a staging area.

[collect_files] enumerates a directory into a flat list of [FileEntry]. A
symlink whose target resolves inside the collection base is kept as a link.
Absolute link text is rewritten relative to the link so the link still
resolves once installed. A symlink that escapes the base is dereferenced:
its target is collected in place of the link so the package is
self-contained. A directory link leading back to one of its own ancestors
is an error.

[Copier] materializes such a list under a destination directory, minifying
JavaScript along the way when requested.
*/

use {
    crate::error::{IoResultExt, IpkError, Result},
    log::{debug, warn},
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
    },
};

/// The type of a collected entry.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

/// One unit of a copy plan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileEntry {
    /// What this entry is.
    pub kind: FileKind,
    /// Directory the walk producing this entry was rooted at.
    pub base_path: PathBuf,
    /// Destination path relative to the copy root.
    pub relative_path: PathBuf,
    /// Absolute location of the content to copy.
    pub source_path: PathBuf,
    /// Whether `source_path` lies under the original collection base.
    ///
    /// False for content reached through an external symlink.
    pub is_under_base: bool,
    /// Link text for [FileKind::Symlink] entries.
    pub symlink_target: Option<PathBuf>,
}

impl FileEntry {
    fn new(kind: FileKind, base_path: &Path, relative_path: PathBuf, source_path: PathBuf) -> Self {
        Self {
            kind,
            base_path: base_path.to_path_buf(),
            relative_path,
            source_path,
            is_under_base: true,
            symlink_target: None,
        }
    }
}

/// Collect the entries of `source_path` relative to `base_path`.
///
/// `source_path` must exist. If it is a regular file, a single entry is
/// returned. Directories produce a [FileKind::Dir] entry each, so empty
/// directories survive a copy.
pub fn collect_files(source_path: &Path, base_path: &Path) -> Result<Vec<FileEntry>> {
    if !source_path.exists() {
        return Err(IpkError::SourceNotFound(source_path.to_path_buf()));
    }

    let canonical_base = base_path.canonicalize().with_path(base_path)?;

    if source_path.is_file() {
        let relative_path = match source_path.strip_prefix(base_path) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => PathBuf::from(source_path.file_name().unwrap_or_default()),
        };
        return Ok(vec![FileEntry::new(
            FileKind::File,
            base_path,
            relative_path,
            source_path.to_path_buf(),
        )]);
    }

    let canonical_root = source_path.canonicalize().with_path(source_path)?;
    let mut walk = Walk {
        base_path,
        canonical_base: &canonical_base,
        canonical_root: &canonical_root,
        expanding: HashSet::from([canonical_root.clone()]),
        entries: vec![],
    };
    walk.walk(source_path, Path::new(""), true)?;

    Ok(walk.entries)
}

/// State of one [collect_files] traversal.
struct Walk<'a> {
    base_path: &'a Path,
    canonical_base: &'a Path,
    /// Canonical form of the directory destination paths are relative to.
    canonical_root: &'a Path,
    /// Canonical directories on the current expansion path.
    expanding: HashSet<PathBuf>,
    entries: Vec<FileEntry>,
}

impl<'a> Walk<'a> {
    /// Walk `root`, appending entries whose destination is `dest_prefix/<rel>`.
    fn walk(&mut self, root: &Path, dest_prefix: &Path, under_base: bool) -> Result<()> {
        let walker = walkdir::WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));

        for entry in walker {
            let entry = entry?;
            let rel = entry.path().strip_prefix(root)?;
            let relative_path = dest_prefix.join(rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.push(
                    FileKind::Dir,
                    relative_path,
                    entry.path().to_path_buf(),
                    under_base,
                );
            } else if file_type.is_symlink() {
                let resolved = match entry.path().canonicalize() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("skipping broken symlink {}: {}", entry.path().display(), e);
                        continue;
                    }
                };

                if resolved.starts_with(self.canonical_base) {
                    let link_text = std::fs::read_link(entry.path()).with_path(entry.path())?;
                    let target = if link_text.is_absolute() {
                        self.relative_link(&relative_path, &resolved)
                            .unwrap_or(link_text)
                    } else {
                        link_text
                    };
                    let mut e = FileEntry::new(
                        FileKind::Symlink,
                        self.base_path,
                        relative_path,
                        entry.path().to_path_buf(),
                    );
                    e.symlink_target = Some(target);
                    e.is_under_base = under_base;
                    self.entries.push(e);
                } else if resolved.is_dir() {
                    if self.canonical_base.starts_with(&resolved)
                        || !self.expanding.insert(resolved.clone())
                    {
                        return Err(IpkError::SymlinkCycle {
                            link: entry.path().to_path_buf(),
                            target: resolved,
                        });
                    }
                    debug!(
                        "expanding external directory link {} -> {}",
                        entry.path().display(),
                        resolved.display()
                    );
                    self.push(FileKind::Dir, relative_path.clone(), resolved.clone(), false);
                    self.walk(&resolved, &relative_path, false)?;
                    self.expanding.remove(&resolved);
                } else {
                    let mut e =
                        FileEntry::new(FileKind::File, &resolved, relative_path, resolved.clone());
                    e.is_under_base = false;
                    self.entries.push(e);
                }
            } else {
                self.push(
                    FileKind::File,
                    relative_path,
                    entry.path().to_path_buf(),
                    under_base,
                );
            }
        }

        Ok(())
    }

    fn push(&mut self, kind: FileKind, relative_path: PathBuf, source_path: PathBuf, under_base: bool) {
        let mut e = FileEntry::new(kind, self.base_path, relative_path, source_path);
        e.is_under_base = under_base;
        self.entries.push(e);
    }

    /// Link text leading from the copied link at `relative_path` to `resolved`.
    fn relative_link(&self, relative_path: &Path, resolved: &Path) -> Option<PathBuf> {
        let link = self.canonical_root.join(relative_path);
        pathdiff::diff_paths(resolved, link.parent()?)
    }
}

fn should_minify(relative_path: &Path) -> bool {
    relative_path.extension().map(|e| e == "js").unwrap_or(false)
        && !relative_path
            .components()
            .any(|c| c.as_os_str() == "node_modules")
}

/// Minify JavaScript source.
///
/// Content that is not valid UTF-8 cannot be minified and is an error.
pub fn minify_js(data: &[u8]) -> Option<Vec<u8>> {
    let source = std::str::from_utf8(data).ok()?;

    Some(minifier::js::minify(source).to_string().into_bytes())
}

/// Copies collected entries into a destination tree.
#[derive(Debug, Default)]
pub struct Copier {
    minify: bool,
    minified: bool,
}

impl Copier {
    pub fn new(minify: bool) -> Self {
        Self {
            minify,
            minified: false,
        }
    }

    /// Whether a minifying copy has completed.
    ///
    /// Later copies of the same sources use this to avoid minifying twice.
    pub fn minified(&self) -> bool {
        self.minified
    }

    /// Copy `entries` under `dest_path`.
    ///
    /// Parent directories are created as needed. `.js` files outside
    /// `node_modules` are minified when minification is enabled; a file that
    /// cannot be minified aborts the copy.
    pub fn copy(&mut self, entries: &[FileEntry], dest_path: &Path) -> Result<()> {
        self.copy_with(entries, dest_path, self.minify)
    }

    /// Like [Self::copy] but never minifies if a previous pass already did.
    pub fn copy_remaining(&mut self, entries: &[FileEntry], dest_path: &Path) -> Result<()> {
        let minify = self.minify && !self.minified;
        self.copy_with(entries, dest_path, minify)
    }

    fn copy_with(&mut self, entries: &[FileEntry], dest_path: &Path, minify: bool) -> Result<()> {
        let mut minified_any = false;

        for entry in entries {
            let dest = dest_path.join(&entry.relative_path);

            match entry.kind {
                FileKind::Dir => {
                    std::fs::create_dir_all(&dest).with_path(&dest)?;
                }
                FileKind::Symlink => {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent).with_path(parent)?;
                    }
                    let target = entry
                        .symlink_target
                        .as_ref()
                        .ok_or_else(|| IpkError::SourceNotFound(entry.source_path.clone()))?;
                    create_symlink(target, &dest)?;
                }
                FileKind::File => {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent).with_path(parent)?;
                    }

                    if minify && should_minify(&entry.relative_path) {
                        debug!("minifying {}", entry.source_path.display());
                        let data =
                            std::fs::read(&entry.source_path).with_path(&entry.source_path)?;
                        let output = minify_js(&data)
                            .ok_or_else(|| IpkError::Minify(entry.source_path.clone()))?;
                        std::fs::write(&dest, output).with_path(&dest)?;
                        minified_any = true;
                    } else {
                        std::fs::copy(&entry.source_path, &dest).with_path(&dest)?;
                    }
                }
            }
        }

        if minified_any {
            self.minified = true;
        }

        Ok(())
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, dest: &Path) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        std::fs::remove_file(dest).with_path(dest)?;
    }
    std::os::unix::fs::symlink(target, dest).with_path(dest)
}

#[cfg(not(unix))]
fn create_symlink(target: &Path, dest: &Path) -> Result<()> {
    let source = dest.parent().unwrap_or(dest).join(target);
    if source.is_dir() {
        std::fs::create_dir_all(dest).with_path(dest)?;
    } else {
        std::fs::copy(&source, dest).with_path(dest)?;
    }
    Ok(())
}
