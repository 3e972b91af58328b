// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {std::path::PathBuf, thiserror::Error};

/// Broad classification of an [IpkError].
///
/// Callers use this to decide how to present a failure without matching on
/// every variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Bad options or manifest content detected before any staging.
    Configuration,
    /// JSON schema violations.
    Validation,
    /// Filesystem or remote transfer failures.
    Io,
    /// Malformed or unsupported archive content.
    Format,
    /// Signing or encryption failures.
    Crypto,
}

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum IpkError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1}")]
    IoPath(PathBuf, std::io::Error),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("path prefix error: {0}")]
    StripPrefix(#[from] std::path::StripPrefixError),

    #[error("invalid exclude pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("source path does not exist: {0}")]
    SourceNotFound(PathBuf),

    #[error("symlink {link} leads back to {target}, which is already being collected")]
    SymlinkCycle { link: PathBuf, target: PathBuf },

    #[error("failed to minify {0}")]
    Minify(PathBuf),

    #[error("referenced asset does not exist: {0}")]
    MissingAsset(PathBuf),

    #[error("asset escapes the application directory: {0}")]
    AssetOutsideApp(PathBuf),

    #[error("invalid JSON in {0}: {1}")]
    InvalidJson(PathBuf, serde_json::Error),

    #[error("{file} is missing required field \"{field}\"")]
    RequiredField { file: String, field: &'static str },

    #[error("invalid id \"{0}\": ids may only contain lowercase letters (a-z), digits (0-9), '.', '+' and '-'")]
    InvalidIdRule(String),

    #[error("invalid version \"{0}\": expected three dot-separated numbers without leading zeros")]
    InvalidVersionRule(String),

    #[error("appinfo.json failed schema validation:\n{0}")]
    SchemaViolation(String),

    #[error("application in {0} uses the legacy enyo framework, which is not supported")]
    UnsupportedLegacyFramework(PathBuf),

    #[error("account-templates.json found in {0}: account based applications are not supported")]
    AccountTemplatesUnsupported(PathBuf),

    #[error("service \"{service}\" must be named with the package id as prefix (\"{package_id}.\")")]
    ServiceIdMismatch { service: String, package_id: String },

    #[error("only one application can be packaged at a time; found appinfo.json in {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    MultipleApps(Vec<PathBuf>),

    #[error("no application, service or package directory found in the inputs")]
    NoPackageContent,

    #[error("a package id is required when packaging services without an application (use --pkgid or --pkginfofile)")]
    MissingPackageId,

    #[error("conflicting options: {0}")]
    ConflictingOptions(&'static str),

    #[error("signing requires both a private key and a certificate")]
    IncompleteSigningConfig,

    #[error("signing error: {0}")]
    Signing(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("package file not found: {0}")]
    PackageNotFound(PathBuf),

    #[error("unsupported compression in package member: {0}")]
    UnsupportedCompression(String),

    #[error("unknown entry in package archive: {0}")]
    UnknownArchiveEntry(String),

    #[error("package archive lacks member: {0}")]
    MissingArchiveEntry(&'static str),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("checksum mismatch for {path}: local {local}, remote {remote}")]
    ChecksumMismatch {
        path: String,
        local: String,
        remote: String,
    },
}

impl IpkError {
    /// Obtain the broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequiredField { .. }
            | Self::InvalidIdRule(_)
            | Self::InvalidVersionRule(_)
            | Self::UnsupportedLegacyFramework(_)
            | Self::AccountTemplatesUnsupported(_)
            | Self::ServiceIdMismatch { .. }
            | Self::MultipleApps(_)
            | Self::NoPackageContent
            | Self::MissingPackageId
            | Self::ConflictingOptions(_)
            | Self::IncompleteSigningConfig
            | Self::AssetOutsideApp(_)
            | Self::Pattern(_) => ErrorKind::Configuration,
            Self::SchemaViolation(_) | Self::InvalidJson(..) => ErrorKind::Validation,
            Self::UnsupportedCompression(_)
            | Self::UnknownArchiveEntry(_)
            | Self::MissingArchiveEntry(_) => ErrorKind::Format,
            Self::Signing(_) | Self::Encryption(_) => ErrorKind::Crypto,
            Self::Io(_)
            | Self::IoPath(..)
            | Self::WalkDir(_)
            | Self::StripPrefix(_)
            | Self::SourceNotFound(_)
            | Self::SymlinkCycle { .. }
            | Self::Minify(_)
            | Self::MissingAsset(_)
            | Self::PackageNotFound(_)
            | Self::Remote(_)
            | Self::ChecksumMismatch { .. } => ErrorKind::Io,
        }
    }
}

impl<W> From<std::io::IntoInnerError<W>> for IpkError {
    fn from(e: std::io::IntoInnerError<W>) -> Self {
        Self::Io(e.into())
    }
}

/// Attach a path to an I/O error.
pub(crate) trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| IpkError::IoPath(path.into(), e))
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, IpkError>;
