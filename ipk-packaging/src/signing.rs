// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Detached signatures over `data.tar.gz`.

The signature is RSA PKCS#1 v1.5 over SHA-256, base64 encoded, and stored in
the control archive as [SIGNATURE_FILENAME] next to a copy of the signer's
certificate.
*/

use {
    crate::error::{IoResultExt, IpkError, Result},
    rsa::{
        pkcs1::DecodeRsaPrivateKey,
        pkcs1v15::SigningKey,
        pkcs8::DecodePrivateKey,
        signature::{SignatureEncoding, Signer},
        RsaPrivateKey,
    },
    sha2::Sha256,
    std::path::{Path, PathBuf},
};

/// Name of the signature file inside `control.tar.gz`.
pub const SIGNATURE_FILENAME: &str = "data.tar.gz.sha256.txt";

/// A private key and certificate used to sign packages.
#[derive(Clone, Debug)]
pub struct SigningConfig {
    pub key_path: PathBuf,
    pub certificate_path: PathBuf,
}

impl SigningConfig {
    /// Construct from optional paths.
    ///
    /// Both or neither must be given.
    pub fn from_paths(key: Option<&Path>, certificate: Option<&Path>) -> Result<Option<Self>> {
        match (key, certificate) {
            (Some(key), Some(cert)) => Ok(Some(Self {
                key_path: key.to_path_buf(),
                certificate_path: cert.to_path_buf(),
            })),
            (None, None) => Ok(None),
            _ => Err(IpkError::IncompleteSigningConfig),
        }
    }

    /// Name the certificate is stored under in the control archive.
    pub fn certificate_name(&self) -> String {
        self.certificate_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "certificate.pem".to_string())
    }

    pub fn read_certificate(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.certificate_path).with_path(&self.certificate_path)
    }

    /// Sign `data`, returning the base64 encoded signature.
    pub fn sign(&self, data: &[u8]) -> Result<String> {
        let pem = std::fs::read_to_string(&self.key_path).with_path(&self.key_path)?;
        let key = load_private_key(&pem)?;

        sign_data(&key, data)
    }
}

/// Parse a PEM encoded RSA private key in PKCS#8 or PKCS#1 form.
pub fn load_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| IpkError::Signing(format!("unable to parse private key: {}", e)))
}

/// Produce the base64 RSA-SHA256 signature of `data`.
pub fn sign_data(key: &RsaPrivateKey, data: &[u8]) -> Result<String> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature = signing_key
        .try_sign(data)
        .map_err(|e| IpkError::Signing(e.to_string()))?;

    Ok(base64::encode(signature.to_bytes()))
}
