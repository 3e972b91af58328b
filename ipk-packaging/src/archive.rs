// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Assembling `.ipk` archives from a staged tree.

An `.ipk` is an `ar` container with three members, always in this order:

1. `debian-binary` holding `2.0\n`.
2. `control.tar.gz` holding the `control` file and optional signature
   material.
3. `data.tar.gz` holding the staged filesystem tree.

`data.tar.gz` is produced first because its size is recorded in the
`Installed-Size` control field.
*/

use {
    crate::{
        ar::ArWriter,
        control::ControlFile,
        error::{IoResultExt, Result},
        signing::{SigningConfig, SIGNATURE_FILENAME},
    },
    log::{debug, info},
    std::{
        collections::BTreeMap,
        io::{BufWriter, Read, Write},
        path::{Path, PathBuf},
        time::SystemTime,
    },
};

/// Content of the `debian-binary` member.
pub const DEBIAN_BINARY: &[u8] = b"2.0\n";

pub const CONTROL_TAR_NAME: &str = "control.tar.gz";
pub const DATA_TAR_NAME: &str = "data.tar.gz";

/// Read and execute for group and other.
const DIR_MODE_ADD: u32 = 0o055;
/// Write for group and other, for service directories.
const SERVICE_DIR_MODE_ADD: u32 = 0o022;
/// Read for other.
const FILE_MODE_ADD: u32 = 0o004;

/// Identity of a package being assembled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageMeta {
    pub name: String,
    pub version: String,
    /// Detected CPU architecture, if any.
    pub architecture: Option<String>,
}

impl PackageMeta {
    /// Architecture recorded in the control file.
    pub fn control_architecture(&self) -> &str {
        self.architecture.as_deref().unwrap_or("all")
    }

    /// Architecture used in the output filename.
    ///
    /// `i586` packages are named `x86` for installer compatibility.
    pub fn filename_architecture(&self) -> &str {
        match self.control_architecture() {
            "i586" => "x86",
            other => other,
        }
    }

    /// `<name>_<version>_<arch>.ipk`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.ipk",
            self.name,
            self.version,
            self.filename_architecture()
        )
    }
}

/// Seconds since the UNIX epoch for `time`, or now.
pub fn unix_mtime(time: Option<SystemTime>) -> u64 {
    time.unwrap_or_else(SystemTime::now)
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Gzip compress a buffer.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = vec![];

    let header = libflate::gzip::HeaderBuilder::new().finish();
    let mut encoder = libflate::gzip::Encoder::with_options(
        &mut buffer,
        libflate::gzip::EncodeOptions::new().header(header),
    )?;
    encoder.write_all(data)?;
    encoder.finish().into_result()?;

    Ok(buffer)
}

/// Compute the archived mode of an entry at `rel_path` within the data tree.
///
/// Archives must be installable regardless of the permission bits of the
/// filesystem they were built on.
pub fn fix_mode(rel_path: &Path, is_dir: bool, mode: u32) -> u32 {
    if is_dir {
        let mut mode = mode | DIR_MODE_ADD;
        if rel_path.starts_with("usr/palm/services") {
            mode |= SERVICE_DIR_MODE_ADD;
        }
        mode
    } else {
        mode | FILE_MODE_ADD
    }
}

#[cfg(unix)]
fn native_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn native_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Give the staged tree at `root` the modes it will be archived with.
///
/// Every directory and regular file receives its [fix_mode] permissions,
/// or its `file_modes` entry when one exists. Symlinks are left alone.
#[cfg(unix)]
pub fn apply_modes(root: &Path, file_modes: &BTreeMap<PathBuf, u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let rel_path = entry.path().strip_prefix(root)?;
        let metadata = entry.metadata()?;
        let mode = match file_modes.get(rel_path) {
            Some(mode) if !file_type.is_dir() => *mode,
            _ => fix_mode(rel_path, file_type.is_dir(), native_mode(&metadata)),
        };

        if mode != native_mode(&metadata) {
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))
                .with_path(entry.path())?;
        }
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn apply_modes(_root: &Path, _file_modes: &BTreeMap<PathBuf, u32>) -> Result<()> {
    Ok(())
}

fn new_tar_header(mtime: u64) -> Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("root")?;
    header.set_groupname("root")?;
    header.set_mtime(mtime);

    Ok(header)
}

fn set_header_path(
    builder: &mut tar::Builder<impl Write>,
    header: &mut tar::Header,
    path: &Path,
    is_directory: bool,
) -> Result<()> {
    // Package data entries are named `./<path>`, with a trailing `/` for
    // directories. `header.set_path()` would normalize away the leading
    // `./` on anything but the root, so the name field is set directly.

    // Only GNU headers are produced here.
    debug_assert!(header.as_ustar().is_none());

    let value = format!(
        "./{}{}",
        path.display(),
        if is_directory { "/" } else { "" }
    );
    let value_bytes = value.as_bytes();

    let name_buffer = &mut header.as_old_mut().name;

    if value_bytes.len() <= name_buffer.len() {
        name_buffer[0..value_bytes.len()].copy_from_slice(value_bytes);
    } else {
        // GNU long name extension entry precedes the real one.
        let mut long = tar::Header::new_gnu();
        let name = b"././@LongLink";
        long.as_old_mut().name[..name.len()].clone_from_slice(&name[..]);
        long.set_mode(0o644);
        long.set_uid(0);
        long.set_gid(0);
        long.set_mtime(0);
        long.set_size(value_bytes.len() as u64 + 1);
        long.set_entry_type(tar::EntryType::new(b'L'));
        long.set_cksum();
        let mut data = value_bytes.chain(std::io::repeat(0).take(1));
        builder.append(&long, &mut data)?;

        let truncated_bytes = &value_bytes[0..name_buffer.len()];
        name_buffer[0..truncated_bytes.len()].copy_from_slice(truncated_bytes);
    }

    Ok(())
}

/// Write an uncompressed tar of the tree at `root`.
///
/// Entries are named `./<path>` in sorted order, owned by root, with
/// permissions fixed by [fix_mode]. `file_modes` holds explicit modes keyed
/// by root-relative path that replace the computed ones. A fixed `mtime`
/// applies to every entry when given.
pub fn write_data_tar<W: Write>(
    writer: W,
    root: &Path,
    file_modes: &BTreeMap<PathBuf, u32>,
    mtime: Option<u64>,
) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    let root_md = std::fs::metadata(root).with_path(root)?;
    let mut header = new_tar_header(mtime.unwrap_or(0))?;
    header.set_path(Path::new("./"))?;
    header.set_mode(fix_mode(Path::new(""), true, native_mode(&root_md)));
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_cksum();
    builder.append(&header, std::io::empty())?;

    let walk = walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()));

    for entry in walk {
        let entry = entry?;
        let rel_path = entry.path().strip_prefix(root)?;
        let metadata = entry
            .path()
            .symlink_metadata()
            .with_path(entry.path())?;
        let entry_mtime = mtime.unwrap_or_else(|| {
            metadata
                .modified()
                .ok()
                .map(|t| unix_mtime(Some(t)))
                .unwrap_or(0)
        });

        let mut header = new_tar_header(entry_mtime)?;
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).with_path(entry.path())?;
            set_header_path(&mut builder, &mut header, rel_path, false)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_link_name(&target)?;
            header.set_mode(0o777);
            header.set_size(0);
            header.set_cksum();
            builder.append(&header, std::io::empty())?;
        } else if file_type.is_dir() {
            set_header_path(&mut builder, &mut header, rel_path, true)?;
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(fix_mode(rel_path, true, native_mode(&metadata)));
            header.set_size(0);
            header.set_cksum();
            builder.append(&header, std::io::empty())?;
        } else {
            let mode = match file_modes.get(rel_path) {
                Some(mode) => *mode,
                None => fix_mode(rel_path, false, native_mode(&metadata)),
            };
            let fh = std::fs::File::open(entry.path()).with_path(entry.path())?;
            set_header_path(&mut builder, &mut header, rel_path, false)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(mode);
            header.set_size(metadata.len());
            header.set_cksum();
            builder.append(&header, fh)?;
        }
    }

    builder.finish()?;

    Ok(())
}

/// Write an uncompressed tar of in-memory files, in the given order.
pub fn write_memory_tar<W: Write>(writer: W, files: &[(String, Vec<u8>)], mtime: u64) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    let mut header = new_tar_header(mtime)?;
    header.set_path(Path::new("./"))?;
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    header.set_cksum();
    builder.append(&header, std::io::empty())?;

    for (name, data) in files {
        let mut header = new_tar_header(mtime)?;
        set_header_path(&mut builder, &mut header, Path::new(name), false)?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append(&header, data.as_slice())?;
    }

    builder.finish()?;

    Ok(())
}

/// Write the three members of an `.ipk` to `dest`.
pub fn write_ipk(dest: &Path, control_tar_gz: &[u8], data_tar_gz: &[u8], mtime: u64) -> Result<()> {
    let fh = std::fs::File::create(dest).with_path(dest)?;
    let mut writer = ArWriter::new(BufWriter::new(fh), mtime).with_path(dest)?;
    writer.append("debian-binary", DEBIAN_BINARY).with_path(dest)?;
    writer
        .append(CONTROL_TAR_NAME, control_tar_gz)
        .with_path(dest)?;
    writer.append(DATA_TAR_NAME, data_tar_gz).with_path(dest)?;
    writer.into_inner().with_path(dest)?;

    Ok(())
}

/// Settings for [assemble].
#[derive(Clone, Debug, Default)]
pub struct AssembleOptions {
    /// Signing material, if the package is to be signed.
    pub signing: Option<SigningConfig>,
    /// Explicit modes keyed by data-root relative path.
    pub file_modes: BTreeMap<PathBuf, u32>,
    /// Fixed modification time for deterministic output.
    pub mtime: Option<SystemTime>,
}

/// Assemble the data tree at `data_root` into `<out_dir>/<meta.file_name()>`.
///
/// Any existing file at the destination is replaced.
pub fn assemble(
    data_root: &Path,
    meta: &PackageMeta,
    out_dir: &Path,
    options: &AssembleOptions,
) -> Result<PathBuf> {
    let fixed_mtime = options.mtime.map(|t| unix_mtime(Some(t)));
    let mtime = unix_mtime(options.mtime);

    info!("creating {}", DATA_TAR_NAME);
    let mut data_tar = BufWriter::new(Vec::new());
    write_data_tar(&mut data_tar, data_root, &options.file_modes, fixed_mtime)?;
    let data_tar_gz = gzip(&data_tar.into_inner()?)?;

    info!("creating {}", CONTROL_TAR_NAME);
    let control = ControlFile::for_package(
        &meta.name,
        &meta.version,
        meta.control_architecture(),
        data_tar_gz.len() as u64,
        false,
    );

    let mut control_files = vec![("control".to_string(), control.to_bytes())];

    if let Some(signing) = &options.signing {
        info!("signing {}", DATA_TAR_NAME);
        let signature = signing.sign(&data_tar_gz)?;
        control_files.push((signing.certificate_name(), signing.read_certificate()?));
        control_files.push((SIGNATURE_FILENAME.to_string(), signature.into_bytes()));
    }

    let mut control_tar = BufWriter::new(Vec::new());
    write_memory_tar(&mut control_tar, &control_files, mtime)?;
    let control_tar_gz = gzip(&control_tar.into_inner()?)?;

    let dest = out_dir.join(meta.file_name());
    if dest.exists() {
        debug!("removing existing {}", dest.display());
        std::fs::remove_file(&dest).with_path(&dest)?;
    }

    info!("creating package {}", dest.display());
    write_ipk(&dest, &control_tar_gz, &data_tar_gz, mtime)?;

    Ok(dest)
}
