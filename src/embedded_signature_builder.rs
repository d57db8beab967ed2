// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental construction of embedded signature superblobs.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        embedded_signature::{
            create_superblob, Blob, BlobData, BlobMagic, BlobWrapperBlob, CodeSigningSlot,
        },
        error::CodesignError,
    },
    bcder::Oid,
    bytes::Bytes,
    cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder},
    log::info,
    std::collections::BTreeMap,
    x509_certificate::{CapturedX509Certificate, KeyInfoSigner},
};

/// OID for the signed attribute carrying a plist of code directory digests.
///
/// 1.2.840.113635.100.9.1
const CD_DIGESTS_PLIST_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// Slots that alternate code directories can occupy, in assignment order.
const ALTERNATE_CODE_DIRECTORY_SLOTS: &[CodeSigningSlot] = &[
    CodeSigningSlot::AlternateCodeDirectory0,
    CodeSigningSlot::AlternateCodeDirectory1,
    CodeSigningSlot::AlternateCodeDirectory2,
    CodeSigningSlot::AlternateCodeDirectory3,
    CodeSigningSlot::AlternateCodeDirectory4,
];

#[derive(Clone, Copy, Debug, PartialEq)]
enum BlobsState {
    Empty,
    SpecialAdded,
    CodeDirectoryAdded,
    SignatureAdded,
}

impl Default for BlobsState {
    fn default() -> Self {
        Self::Empty
    }
}

/// Incrementally builds superblob data.
///
/// Blobs must be registered in dependency order: special blobs first (their
/// digests are recorded in the code directory), then code directories, then
/// the signature, which covers the primary code directory.
#[derive(Default)]
pub struct EmbeddedSignatureBuilder<'a> {
    state: BlobsState,
    blobs: BTreeMap<CodeSigningSlot, BlobData<'a>>,
}

impl<'a> EmbeddedSignatureBuilder<'a> {
    /// Obtain the primary code directory, if registered.
    pub fn code_directory(&self) -> Option<&CodeDirectoryBlob> {
        self.blobs.get(&CodeSigningSlot::CodeDirectory).map(|blob| {
            if let BlobData::CodeDirectory(cd) = blob {
                (*cd).as_ref()
            } else {
                panic!("a non code directory should never occupy the code directory slot");
            }
        })
    }

    /// All registered code directories and their slots, primary first.
    pub fn code_directories(&self) -> Vec<(CodeSigningSlot, &CodeDirectoryBlob)> {
        self.blobs
            .iter()
            .filter_map(|(slot, blob)| {
                if let BlobData::CodeDirectory(cd) = blob {
                    Some((*slot, (*cd).as_ref()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Register a blob into a slot.
    ///
    /// There can only be a single blob per slot. Last write wins.
    ///
    /// Code directories and signatures cannot be registered this way, and
    /// no blob can be registered once a code directory is present, since
    /// that would desynchronize the recorded digests.
    pub fn add_blob(
        &mut self,
        slot: CodeSigningSlot,
        blob: BlobData<'a>,
    ) -> Result<(), CodesignError> {
        match self.state {
            BlobsState::Empty | BlobsState::SpecialAdded => {}
            BlobsState::CodeDirectoryAdded | BlobsState::SignatureAdded => {
                return Err(CodesignError::SignatureBuilder(
                    "cannot add blobs after code directory or signature is registered",
                ));
            }
        }

        if matches!(blob, BlobData::CodeDirectory(_) | BlobData::BlobWrapper(_)) {
            return Err(CodesignError::SignatureBuilder(
                "cannot register code directory or signature blob via add_blob()",
            ));
        }

        self.blobs.insert(slot, blob);
        self.state = BlobsState::SpecialAdded;

        Ok(())
    }

    /// Register the primary [CodeDirectoryBlob].
    ///
    /// Digests of all previously registered blobs are recorded in the code
    /// directory's special slots before insertion, so callers don't need to
    /// keep them in sync manually.
    pub fn add_code_directory(
        &mut self,
        mut cd: CodeDirectoryBlob<'a>,
    ) -> Result<&CodeDirectoryBlob, CodesignError> {
        if matches!(self.state, BlobsState::SignatureAdded) {
            return Err(CodesignError::SignatureBuilder(
                "cannot add code directory after signature data added",
            ));
        }

        for (slot, blob) in &self.blobs {
            if !slot.is_special_digest_expressible() {
                continue;
            }

            let digest = blob.digest_with(cd.digest_type)?;
            cd.set_slot_digest(*slot, digest)?;
        }

        self.blobs.insert(CodeSigningSlot::CodeDirectory, cd.into());
        self.state = BlobsState::CodeDirectoryAdded;

        Ok(self.code_directory().expect("we just inserted this key"))
    }

    /// Register an alternate code directory in the next free alternate slot.
    pub fn add_alternate_code_directory(
        &mut self,
        mut cd: CodeDirectoryBlob<'a>,
    ) -> Result<CodeSigningSlot, CodesignError> {
        if !matches!(self.state, BlobsState::CodeDirectoryAdded) {
            return Err(CodesignError::SignatureBuilder(
                "alternate code directories require a primary code directory",
            ));
        }

        let slot = *ALTERNATE_CODE_DIRECTORY_SLOTS
            .iter()
            .find(|slot| !self.blobs.contains_key(slot))
            .ok_or(CodesignError::SignatureBuilder(
                "no more available alternate code directory slots",
            ))?;

        for (existing_slot, blob) in &self.blobs {
            if !existing_slot.is_special_digest_expressible() {
                continue;
            }

            let digest = blob.digest_with(cd.digest_type)?;
            cd.set_slot_digest(*existing_slot, digest)?;
        }

        self.blobs.insert(slot, cd.into());

        Ok(slot)
    }

    /// Add raw CMS signature data into the signature slot.
    ///
    /// An empty payload denotes an ad-hoc signature.
    pub fn add_cms_signature_data(&mut self, der_data: Vec<u8>) -> Result<(), CodesignError> {
        if !matches!(self.state, BlobsState::CodeDirectoryAdded) {
            return Err(CodesignError::SignatureBuilder(
                "signature data requires a registered code directory",
            ));
        }

        self.blobs.insert(
            CodeSigningSlot::Signature,
            BlobData::BlobWrapper(Box::new(BlobWrapperBlob::from_data_owned(der_data))),
        );
        self.state = BlobsState::SignatureAdded;

        Ok(())
    }

    /// Finalize as an ad-hoc signature: a signature slot with no payload.
    ///
    /// The code directory still seals content integrity. There is no
    /// attestation of authorship.
    pub fn create_adhoc_signature(&mut self) -> Result<(), CodesignError> {
        self.add_cms_signature_data(vec![])
    }

    /// Create a CMS signature over the primary code directory and register it.
    ///
    /// The signature is detached: the signed content is the serialized
    /// primary code directory, digested into the message-digest attribute
    /// rather than embedded. Digests of every registered code directory are
    /// carried in an Apple-defined plist signed attribute so verifiers can
    /// bind alternate code directories to the signature.
    pub fn create_cms_signature(
        &mut self,
        signing_key: &dyn KeyInfoSigner,
        signing_cert: &CapturedX509Certificate,
        certificates: impl Iterator<Item = CapturedX509Certificate>,
    ) -> Result<(), CodesignError> {
        let main_cd = self
            .code_directory()
            .ok_or(CodesignError::SignatureBuilder(
                "cannot create CMS signature without a code directory",
            ))?;

        let main_cd_bytes = main_cd.to_blob_bytes()?;

        let mut cd_digests = Vec::new();
        for (slot, cd) in self.code_directories() {
            // cdhashes are truncated to 20 bytes, the length of the legacy
            // SHA-1 slot they replaced.
            let mut digest = cd.digest_with(cd.digest_type)?;
            digest.truncate(20);

            info!("cdhash for {:?}: {}", slot, hex::encode(&digest));
            cd_digests.push(plist::Value::Data(digest));
        }

        let mut plist_dict = plist::Dictionary::new();
        plist_dict.insert("cdhashes".to_string(), plist::Value::Array(cd_digests));

        let mut plist_xml = Vec::new();
        plist::Value::Dictionary(plist_dict)
            .to_writer_xml(std::io::Cursor::new(&mut plist_xml))
            .map_err(CodesignError::PlistSerializeXml)?;

        let signer = SignerBuilder::new(signing_key, signing_cert.clone())
            .message_id_content(main_cd_bytes)
            .signed_attribute_octet_string(
                Oid(Bytes::copy_from_slice(CD_DIGESTS_PLIST_OID)),
                &plist_xml,
            );

        let mut builder = SignedDataBuilder::default()
            .signer(signer)
            .certificate(signing_cert.clone());

        for cert in certificates {
            builder = builder.certificate(cert);
        }

        let der = builder.build_der()?;

        self.add_cms_signature_data(der)
    }

    /// Create the serialized embedded signature superblob.
    pub fn create_superblob(&self) -> Result<Vec<u8>, CodesignError> {
        if matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(CodesignError::SignatureBuilder(
                "code directory required in order to materialize superblob",
            ));
        }

        // BTreeMap iteration gives ascending slot order, which is the
        // canonical blob order downstream verifiers expect.
        let blobs = self
            .blobs
            .iter()
            .map(|(slot, blob)| {
                let data = blob.to_blob_bytes()?;

                Ok((*slot, data))
            })
            .collect::<Result<Vec<_>, CodesignError>>()?;

        create_superblob(BlobMagic::EmbeddedSignature, blobs.iter())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::embedded_signature::{
            Digest, DigestType, EmbeddedSignature, EntitlementsBlob,
        },
        crate::code_directory::CodeDirectoryBlob,
    };

    fn minimal_code_directory() -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            code_limit: 0x1000,
            digest_size: DigestType::Sha256.digest_len().unwrap() as u8,
            digest_type: DigestType::Sha256,
            ident: "com.example.test".into(),
            code_digests: vec![Digest {
                data: vec![0u8; 32].into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn adhoc_superblob_has_empty_signature_slot() {
        let mut builder = EmbeddedSignatureBuilder::default();
        builder
            .add_blob(
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("<plist/>").into(),
            )
            .unwrap();
        builder.add_code_directory(minimal_code_directory()).unwrap();
        builder.create_adhoc_signature().unwrap();

        let superblob = builder.create_superblob().unwrap();
        let parsed = EmbeddedSignature::from_bytes(&superblob).unwrap();

        assert_eq!(parsed.signature_data().unwrap().unwrap().len(), 0);

        // The entitlements digest was recorded in the code directory.
        let cd = parsed.code_directory().unwrap().unwrap();
        let entitlements_digest = cd.slot_digest(CodeSigningSlot::Entitlements).unwrap();
        assert!(!entitlements_digest.is_null());
    }

    #[test]
    fn blobs_rejected_after_code_directory() {
        let mut builder = EmbeddedSignatureBuilder::default();
        builder.add_code_directory(minimal_code_directory()).unwrap();

        assert!(matches!(
            builder.add_blob(
                CodeSigningSlot::Entitlements,
                EntitlementsBlob::from_string("<plist/>").into(),
            ),
            Err(CodesignError::SignatureBuilder(_))
        ));
    }

    #[test]
    fn superblob_requires_code_directory() {
        let builder = EmbeddedSignatureBuilder::default();
        assert!(matches!(
            builder.create_superblob(),
            Err(CodesignError::SignatureBuilder(_))
        ));
    }

    #[test]
    fn alternate_code_directory_slot_assignment() {
        let mut builder = EmbeddedSignatureBuilder::default();
        builder.add_code_directory(minimal_code_directory()).unwrap();

        let mut alt = minimal_code_directory();
        alt.digest_type = DigestType::Sha1;
        alt.digest_size = DigestType::Sha1.digest_len().unwrap() as u8;

        let slot = builder.add_alternate_code_directory(alt).unwrap();
        assert_eq!(slot, CodeSigningSlot::AlternateCodeDirectory0);

        builder.create_adhoc_signature().unwrap();
        let superblob = builder.create_superblob().unwrap();
        let parsed = EmbeddedSignature::from_bytes(&superblob).unwrap();

        assert_eq!(parsed.all_code_directories().unwrap().len(), 2);
        assert!(parsed
            .code_directory_for_digest(DigestType::Sha1)
            .unwrap()
            .is_some());
    }
}
