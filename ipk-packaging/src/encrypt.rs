// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Encrypted packages.

A fully built plain `.ipk` is encrypted wholesale with AES-256-CBC under a
random key and IV. Key and IV are base64 encoded, wrapped with RSA-OAEP
under a public key, and shipped as the `key` and `iv` members of a fresh
`control.tar.gz`. The ciphertext becomes the `data.tar.gz` member of a new
outer `.ipk` whose control file declares `Encrypt-Algorithm`.
*/

use {
    crate::{
        archive::{gzip, unix_mtime, write_ipk, write_memory_tar, PackageMeta},
        control::ControlFile,
        error::{IoResultExt, IpkError, Result},
    },
    aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit},
    log::info,
    rand::RngCore,
    rsa::{
        pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey, Oaep, RsaPublicKey,
    },
    sha1::Sha1,
    std::{
        io::BufWriter,
        path::{Path, PathBuf},
        time::SystemTime,
    },
};

/// Public key used to wrap package keys unless another is supplied.
pub const BUNDLED_PUBLIC_KEY: &str = include_str!("../keys/encrypt-public.pem");

pub const KEY_FILENAME: &str = "key";
pub const IV_FILENAME: &str = "iv";

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// Parse a PEM encoded RSA public key in SPKI or PKCS#1 form.
pub fn load_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| IpkError::Encryption(format!("unable to parse public key: {}", e)))
}

/// Symmetric key material for one package.
#[derive(Clone)]
pub struct PackageKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl std::fmt::Debug for PackageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageKey").finish_non_exhaustive()
    }
}

impl PackageKey {
    /// Generate a random key and IV.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        Self { key, iv }
    }

    /// Encrypt `data` with AES-256-CBC and PKCS#7 padding.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| IpkError::Encryption(e.to_string()))?;

        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
    }

    /// Wrap the base64 encoded key and IV under `public_key`.
    ///
    /// Returns the raw `(key, iv)` ciphertexts.
    pub fn wrap(&self, public_key: &RsaPublicKey) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut rng = rand::thread_rng();

        let key = public_key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), base64::encode(self.key).as_bytes())
            .map_err(|e| IpkError::Encryption(e.to_string()))?;
        let iv = public_key
            .encrypt(&mut rng, Oaep::new::<Sha1>(), base64::encode(self.iv).as_bytes())
            .map_err(|e| IpkError::Encryption(e.to_string()))?;

        Ok((key, iv))
    }
}

/// Encrypt the plain package at `plain_ipk` into `<out_dir>/<meta.file_name()>`.
///
/// `public_key_path` overrides [BUNDLED_PUBLIC_KEY].
pub fn encrypt_package(
    plain_ipk: &Path,
    public_key_path: Option<&Path>,
    meta: &PackageMeta,
    out_dir: &Path,
    mtime: Option<SystemTime>,
) -> Result<PathBuf> {
    let public_key = match public_key_path {
        Some(path) => load_public_key(&std::fs::read_to_string(path).with_path(path)?)?,
        None => load_public_key(BUNDLED_PUBLIC_KEY)?,
    };

    info!("encrypting {}", plain_ipk.display());
    let plain = std::fs::read(plain_ipk).with_path(plain_ipk)?;
    let package_key = PackageKey::generate();
    let payload = package_key.encrypt(&plain)?;
    let (wrapped_key, wrapped_iv) = package_key.wrap(&public_key)?;

    let mtime = unix_mtime(mtime);
    let control = ControlFile::for_package(
        &meta.name,
        &meta.version,
        meta.control_architecture(),
        payload.len() as u64,
        true,
    );

    let files = vec![
        ("control".to_string(), control.to_bytes()),
        (KEY_FILENAME.to_string(), wrapped_key),
        (IV_FILENAME.to_string(), wrapped_iv),
    ];
    let mut control_tar = BufWriter::new(Vec::new());
    write_memory_tar(&mut control_tar, &files, mtime)?;
    let control_tar_gz = gzip(&control_tar.into_inner()?)?;

    let dest = out_dir.join(meta.file_name());
    if dest.exists() {
        std::fs::remove_file(&dest).with_path(&dest)?;
    }

    info!("creating encrypted package {}", dest.display());
    write_ipk(&dest, &control_tar_gz, &payload, mtime)?;

    Ok(dest)
}
