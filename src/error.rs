// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, std::path::PathBuf, thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Unified error type for Mach-O code signing operations.
#[derive(Debug, Error)]
pub enum CodesignError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("invalid Mach-O binary: {0}")]
    InvalidBinary(String),

    #[error("unsupported CPU architecture: 0x{0:08x}")]
    UnsupportedArchitecture(u32),

    #[error("load command references data beyond end of file ({0})")]
    TruncatedBinary(&'static str),

    #[error("unable to locate __TEXT segment")]
    MissingText,

    #[error("unable to locate __LINKEDIT segment")]
    MissingLinkedit,

    #[error("__LINKEDIT isn't final Mach-O segment")]
    LinkeditNotLast,

    #[error("__LINKEDIT segment contains data after signature")]
    DataAfterSignature,

    #[error("insufficient room to write code signature load command")]
    LoadCommandNoRoom,

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("signature builder error: {0}")]
    SignatureBuilder(&'static str),

    #[error("signature data too large for reserved space")]
    SignatureDataTooLarge,

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("unknown code signature flag: {0}")]
    CodeSignatureUnknownFlag(String),

    #[error("unknown executable segment flag: {0}")]
    ExecutableSegmentUnknownFlag(String),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("unsupported digest algorithm")]
    DigestUnsupportedAlgorithm,

    #[error("entitlements data not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("error when encoding entitlements to DER: {0}")]
    EntitlementsDerEncode(String),

    #[error("error parsing plist XML: {0}")]
    PlistParseXml(plist::Error),

    #[error("error serializing plist to XML: {0}")]
    PlistSerializeXml(plist::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("error parsing version string: {0}")]
    VersionParse(#[from] semver::Error),

    #[error("malformed credential container: {0}")]
    CredentialMalformed(String),

    #[error("incorrect password for credential container")]
    CredentialWrongPassword,

    #[error("unsupported algorithm in credential container: {0}")]
    CredentialUnsupportedAlgorithm(String),

    #[error("certificate expired at {0}")]
    CertificateExpired(chrono::DateTime<chrono::Utc>),

    #[error("certificate not valid until {0}")]
    CertificateNotYetValid(chrono::DateTime<chrono::Utc>),

    #[error("provisioning profile signature failed verification")]
    ProfileSignatureInvalid,

    #[error("provisioning profile payload is malformed: {0}")]
    ProfileMalformedPayload(String),

    #[error("team identifier not found in provisioning profile")]
    ProfileTeamIdNotFound,

    #[error("no identifier string provided")]
    NoIdentifier,

    #[error("no signing certificate")]
    NoSigningCertificate,

    #[error("no Mach-O binaries found in bundle: {0}")]
    BundleNoBinaries(PathBuf),

    #[error("signing {0}: {1}")]
    SigningBinary(PathBuf, Box<CodesignError>),

    #[error("operation cancelled")]
    Cancelled,
}

impl CodesignError {
    /// Wrap an error with the path of the binary that produced it.
    pub fn for_binary(self, path: impl Into<PathBuf>) -> Self {
        Self::SigningBinary(path.into(), Box::new(self))
    }
}
