// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Transferring packages to a device.

The transport is abstract. Anything able to run a shell command and copy
files in both directions can implement [RemoteSession].
*/

use {
    crate::error::{IoResultExt, IpkError, Result},
    log::{info, warn},
    md5::{Digest, Md5},
    std::{io::Read, path::Path},
};

/// A remote command and file copy capability.
pub trait RemoteSession {
    /// Run a shell command, returning its standard output.
    fn run(&mut self, command: &str) -> Result<Vec<u8>>;

    /// Copy a local file to `remote_path`.
    fn put(&mut self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Copy `remote_path` to a local file.
    fn get(&mut self, remote_path: &str, local_path: &Path) -> Result<()>;
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// Hex encoded MD5 digest of a file.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut fh = std::fs::File::open(path).with_path(path)?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 32768];

    loop {
        let count = fh.read(&mut buffer).with_path(path)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Extract the digest from `md5sum` output.
fn parse_md5sum(output: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    let digest = text.split_whitespace().next()?;

    if digest.len() == 32 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

/// Upload `local_ipk` into `remote_dir` and verify the transfer.
///
/// Returns the remote path of the package. A remote checksum that cannot be
/// obtained is logged and tolerated. A checksum that differs is an error.
pub fn push_package<S: RemoteSession + ?Sized>(
    session: &mut S,
    local_ipk: &Path,
    remote_dir: &str,
) -> Result<String> {
    let name = local_ipk
        .file_name()
        .ok_or_else(|| IpkError::PackageNotFound(local_ipk.to_path_buf()))?
        .to_string_lossy()
        .to_string();
    if !local_ipk.is_file() {
        return Err(IpkError::PackageNotFound(local_ipk.to_path_buf()));
    }

    let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);

    session.run(&format!("mkdir -p {}", shell_quote(remote_dir)))?;
    info!("uploading {} to {}", local_ipk.display(), remote_path);
    session.put(local_ipk, &remote_path)?;

    let local = file_md5(local_ipk)?;
    let remote = match session.run(&format!("md5sum {}", shell_quote(&remote_path))) {
        Ok(output) => parse_md5sum(&output),
        Err(e) => {
            warn!("unable to obtain checksum of {}: {}", remote_path, e);
            return Ok(remote_path);
        }
    };

    match remote {
        Some(remote) if remote != local => Err(IpkError::ChecksumMismatch {
            path: remote_path,
            local,
            remote,
        }),
        Some(_) => Ok(remote_path),
        None => {
            warn!("unable to verify {}: unrecognized md5sum output", remote_path);
            Ok(remote_path)
        }
    }
}
