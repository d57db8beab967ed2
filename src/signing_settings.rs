// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for signing operations.

use {
    crate::{
        code_directory::{CodeSignatureFlags, ExecutableSegmentFlags},
        embedded_signature::DigestType,
        error::CodesignError,
    },
    std::collections::BTreeSet,
    x509_certificate::{CapturedX509Certificate, KeyInfoSigner},
};

/// Describes the digest type(s) and metadata used when producing signatures.
///
/// An instance is the input to a signing operation. Instances are cheap to
/// clone so per-binary variations can be derived from a base configuration.
#[derive(Clone)]
pub struct SigningSettings<'key> {
    digest_type: DigestType,
    extra_digests: BTreeSet<DigestType>,
    page_size: usize,
    binary_identifier: Option<String>,
    team_id: Option<String>,
    entitlements: Option<plist::Value>,
    designated_requirement: Option<Vec<u8>>,
    code_signature_flags: Option<CodeSignatureFlags>,
    executable_segment_flags: Option<ExecutableSegmentFlags>,
    runtime_version: Option<semver::Version>,
    info_plist_data: Option<Vec<u8>>,
    signing_key: Option<(&'key dyn KeyInfoSigner, CapturedX509Certificate)>,
    certificate_chain: Vec<CapturedX509Certificate>,
}

impl<'key> Default for SigningSettings<'key> {
    fn default() -> Self {
        Self {
            digest_type: DigestType::Sha256,
            extra_digests: BTreeSet::new(),
            page_size: 4096,
            binary_identifier: None,
            team_id: None,
            entitlements: None,
            designated_requirement: None,
            code_signature_flags: None,
            executable_segment_flags: None,
            runtime_version: None,
            info_plist_data: None,
            signing_key: None,
            certificate_chain: vec![],
        }
    }
}

impl<'key> SigningSettings<'key> {
    /// The primary digest type used for code digests.
    pub fn digest_type(&self) -> &DigestType {
        &self.digest_type
    }

    /// Set the primary digest type.
    pub fn set_digest_type(&mut self, digest_type: DigestType) {
        self.digest_type = digest_type;
    }

    /// Extra digest types to emit as alternate code directories.
    pub fn extra_digests(&self) -> &BTreeSet<DigestType> {
        &self.extra_digests
    }

    /// Register an extra digest type, e.g. for legacy SHA-1 support.
    pub fn add_extra_digest(&mut self, digest_type: DigestType) {
        self.extra_digests.insert(digest_type);
    }

    /// All digest types that will be emitted, primary first.
    pub fn all_digests(&self) -> Vec<DigestType> {
        let mut res = vec![self.digest_type];
        res.extend(
            self.extra_digests
                .iter()
                .filter(|v| **v != self.digest_type)
                .copied(),
        );

        res
    }

    /// The page size used when computing code digests.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The signing key and public certificate, if cryptographically signing.
    pub fn signing_key(&self) -> Option<(&'key dyn KeyInfoSigner, &CapturedX509Certificate)> {
        self.signing_key.as_ref().map(|(key, cert)| (*key, cert))
    }

    /// Define the signing key and accompanying public certificate.
    ///
    /// When set, signing produces a CMS signature. Otherwise output is
    /// ad-hoc.
    pub fn set_signing_key(
        &mut self,
        private: &'key dyn KeyInfoSigner,
        public: CapturedX509Certificate,
    ) {
        self.signing_key = Some((private, public));
    }

    /// Additional certificates to include in the CMS certificate chain.
    pub fn certificate_chain(&self) -> &[CapturedX509Certificate] {
        &self.certificate_chain
    }

    /// Append a certificate to the CMS certificate chain.
    pub fn chain_certificate(&mut self, cert: CapturedX509Certificate) {
        self.certificate_chain.push(cert);
    }

    /// The team identifier recorded in produced code directories.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    pub fn set_team_id(&mut self, value: impl ToString) {
        self.team_id = Some(value.to_string());
    }

    /// Derive the team identifier from the signing certificate's subject
    /// Organizational Unit, the convention for Apple issued certificates.
    ///
    /// Returns the resolved value, or `None` if no signing certificate is
    /// registered or it lacks an OU.
    pub fn set_team_id_from_signing_certificate(&mut self) -> Option<&str> {
        if let Some((_, cert)) = &self.signing_key {
            if let Some(ou) = cert
                .subject_name()
                .iter_organizational_unit()
                .next()
                .and_then(|atv| atv.to_string().ok())
            {
                self.team_id = Some(ou);

                return self.team_id.as_deref();
            }
        }

        None
    }

    /// The identifier string written into the code directory.
    pub fn binary_identifier(&self) -> Option<&str> {
        self.binary_identifier.as_deref()
    }

    pub fn set_binary_identifier(&mut self, value: impl ToString) {
        self.binary_identifier = Some(value.to_string());
    }

    /// Entitlements as a parsed plist value.
    pub fn entitlements_plist(&self) -> Option<&plist::Value> {
        self.entitlements.as_ref()
    }

    /// Entitlements serialized to XML, as embedded in the entitlements blob.
    pub fn entitlements_xml(&self) -> Result<Option<String>, CodesignError> {
        if let Some(value) = &self.entitlements {
            let mut buffer = Vec::new();
            let writer = std::io::Cursor::new(&mut buffer);
            value
                .to_writer_xml(writer)
                .map_err(CodesignError::PlistSerializeXml)?;

            Ok(Some(
                String::from_utf8(buffer)
                    .map_err(|e| CodesignError::EntitlementsBadUtf8(e.utf8_error()))?,
            ))
        } else {
            Ok(None)
        }
    }

    /// Register entitlements from an XML string.
    pub fn set_entitlements_xml(&mut self, v: impl AsRef<str>) -> Result<(), CodesignError> {
        let cursor = std::io::Cursor::new(v.as_ref().as_bytes());
        let value =
            plist::Value::from_reader_xml(cursor).map_err(CodesignError::PlistParseXml)?;

        self.entitlements = Some(value);

        Ok(())
    }

    /// Compiled designated requirement expression bytes, if any.
    ///
    /// The bytes are a requirement blob payload as emitted by `csreq -b`.
    pub fn designated_requirement(&self) -> Option<&[u8]> {
        self.designated_requirement.as_deref()
    }

    pub fn set_designated_requirement_bytes(&mut self, data: impl Into<Vec<u8>>) {
        self.designated_requirement = Some(data.into());
    }

    /// Explicit code signature flags.
    pub fn code_signature_flags(&self) -> Option<CodeSignatureFlags> {
        self.code_signature_flags
    }

    pub fn set_code_signature_flags(&mut self, flags: CodeSignatureFlags) {
        self.code_signature_flags = Some(flags);
    }

    /// Explicit executable segment flags.
    pub fn executable_segment_flags(&self) -> Option<ExecutableSegmentFlags> {
        self.executable_segment_flags
    }

    pub fn set_executable_segment_flags(&mut self, flags: ExecutableSegmentFlags) {
        self.executable_segment_flags = Some(flags);
    }

    /// Hardened runtime version override.
    pub fn runtime_version(&self) -> Option<&semver::Version> {
        self.runtime_version.as_ref()
    }

    pub fn set_runtime_version(&mut self, version: semver::Version) {
        self.runtime_version = Some(version);
    }

    /// Raw `Info.plist` content whose digest goes into the Info special slot.
    pub fn info_plist_data(&self) -> Option<&[u8]> {
        self.info_plist_data.as_deref()
    }

    pub fn set_info_plist_data(&mut self, data: Vec<u8>) {
        self.info_plist_data = Some(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_digests_deduplicates_primary() {
        let mut settings = SigningSettings::default();
        settings.add_extra_digest(DigestType::Sha256);
        settings.add_extra_digest(DigestType::Sha1);

        assert_eq!(
            settings.all_digests(),
            vec![DigestType::Sha256, DigestType::Sha1]
        );
    }

    #[test]
    fn entitlements_xml_roundtrip() {
        let mut settings = SigningSettings::default();
        settings
            .set_entitlements_xml(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <plist version=\"1.0\"><dict>\
                 <key>get-task-allow</key><true/>\
                 </dict></plist>",
            )
            .unwrap();

        let xml = settings.entitlements_xml().unwrap().unwrap();
        assert!(xml.contains("get-task-allow"));

        let plist = settings.entitlements_plist().unwrap();
        assert!(matches!(
            plist.as_dictionary().unwrap().get("get-task-allow"),
            Some(plist::Value::Boolean(true))
        ));
    }

    #[test]
    fn invalid_entitlements_xml_rejected() {
        let mut settings = SigningSettings::default();
        assert!(matches!(
            settings.set_entitlements_xml("not xml"),
            Err(CodesignError::PlistParseXml(_))
        ));
    }
}
