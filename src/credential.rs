// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing credentials.

A signing credential is an X.509 certificate paired with its private key,
typically obtained from a PKCS#12 / PFX container such as those exported by
Keychain Access. This module decodes those containers and answers the
questions the signing flow asks before any file is touched: who does this
certificate belong to (the subject Organizational Unit holds the team
identifier on Apple issued certificates) and is it currently valid.

Password and decrypted key material are held in zeroizing buffers so secret
bytes don't outlive the parse.
*/

use {
    crate::error::CodesignError,
    chrono::{DateTime, Utc},
    x509_certificate::{
        asn1time::Time, rfc5280, CapturedX509Certificate, InMemorySigningKeyPair,
    },
    zeroize::Zeroizing,
};

fn time_to_datetime(time: &Time) -> DateTime<Utc> {
    match time {
        Time::UtcTime(utc) => **utc,
        Time::GeneralTime(gt) => DateTime::<Utc>::from(gt.clone()),
    }
}

/// Encode a password in the UCS-2 / BMPString form PKCS#12 ciphers expect.
fn bmp_string(s: &str) -> Zeroizing<Vec<u8>> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    Zeroizing::new(bytes)
}

/// A code signing credential: certificate plus private key.
pub struct Credential {
    certificate: CapturedX509Certificate,
    key_pair: InMemorySigningKeyPair,
}

impl Credential {
    /// Parse a PKCS#12 / PFX container into a credential.
    ///
    /// If the container was created without a password, pass the empty
    /// string.
    pub fn from_pfx(data: &[u8], password: &str) -> Result<Self, CodesignError> {
        let pfx = p12::PFX::parse(data).map_err(|e| {
            CodesignError::CredentialMalformed(format!("data does not appear to be PFX: {:?}", e))
        })?;

        if !pfx.verify_mac(password) {
            return Err(CodesignError::CredentialWrongPassword);
        }

        // Keychain Access exports consist of a plain data ContentInfo whose
        // inner ContentInfos hold the certificate and shrouded key.
        let data = match pfx.auth_safe {
            p12::ContentInfo::Data(data) => data,
            _ => {
                return Err(CodesignError::CredentialMalformed(
                    "unexpected PFX content info".to_string(),
                ));
            }
        };

        let content_infos = yasna::parse_der(&data, |reader| {
            reader.collect_sequence_of(p12::ContentInfo::parse)
        })
        .map_err(|e| {
            CodesignError::CredentialMalformed(format!(
                "failed parsing inner ContentInfo: {:?}",
                e
            ))
        })?;

        let bmp_password = bmp_string(password);

        let mut certificate = None;
        let mut key_pair = None;

        for content in content_infos {
            let bags_data = match content {
                p12::ContentInfo::Data(inner) => inner,
                p12::ContentInfo::EncryptedData(encrypted) => encrypted
                    .data(&bmp_password)
                    .ok_or(CodesignError::CredentialWrongPassword)?,
                p12::ContentInfo::OtherContext(_) => {
                    return Err(CodesignError::CredentialMalformed(
                        "unexpected OtherContext content in inner PFX data".to_string(),
                    ));
                }
            };

            let bags = yasna::parse_ber(&bags_data, |reader| {
                reader.collect_sequence_of(p12::SafeBag::parse)
            })
            .map_err(|e| {
                CodesignError::CredentialMalformed(format!(
                    "failed parsing SafeBag within inner data: {:?}",
                    e
                ))
            })?;

            for bag in bags {
                match bag.bag {
                    p12::SafeBagKind::CertBag(cert_bag) => match cert_bag {
                        p12::CertBag::X509(cert_data) => {
                            certificate = Some(CapturedX509Certificate::from_der(cert_data)?);
                        }
                        p12::CertBag::SDSI(_) => {
                            return Err(CodesignError::CredentialMalformed(
                                "unexpected SDSI certificate data".to_string(),
                            ));
                        }
                    },
                    p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                        let decrypted = Zeroizing::new(
                            key_bag
                                .decrypt(&bmp_password)
                                .ok_or(CodesignError::CredentialWrongPassword)?,
                        );

                        key_pair = Some(
                            InMemorySigningKeyPair::from_pkcs8_der(decrypted.as_ref() as &[u8]).map_err(
                                |e| CodesignError::CredentialUnsupportedAlgorithm(format!("{}", e)),
                            )?,
                        );
                    }
                    p12::SafeBagKind::OtherBagKind(_) => {
                        return Err(CodesignError::CredentialMalformed(
                            "unexpected bag type in inner PFX content".to_string(),
                        ));
                    }
                }
            }
        }

        match (certificate, key_pair) {
            (Some(certificate), Some(key_pair)) => Ok(Self {
                certificate,
                key_pair,
            }),
            (None, Some(_)) => Err(CodesignError::CredentialMalformed(
                "failed to find X.509 certificate in PFX data".to_string(),
            )),
            (_, None) => Err(CodesignError::CredentialMalformed(
                "failed to find signing key in PFX data".to_string(),
            )),
        }
    }

    /// Construct a credential from an already-parsed certificate and key.
    pub fn from_parts(
        certificate: CapturedX509Certificate,
        key_pair: InMemorySigningKeyPair,
    ) -> Self {
        Self {
            certificate,
            key_pair,
        }
    }

    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    pub fn key_pair(&self) -> &InMemorySigningKeyPair {
        &self.key_pair
    }

    /// The subject Organizational Unit of the certificate.
    ///
    /// Apple issued signing certificates carry the team identifier here.
    pub fn organizational_unit(&self) -> Option<String> {
        self.certificate
            .subject_name()
            .iter_organizational_unit()
            .next()
            .and_then(|atv| atv.to_string().ok())
    }

    fn validity(&self) -> &rfc5280::Validity {
        let x509: &x509_certificate::X509Certificate = self.certificate.as_ref();
        let raw: &rfc5280::Certificate = x509.as_ref();

        &raw.tbs_certificate.validity
    }

    /// Start of the certificate's validity window.
    pub fn not_valid_before(&self) -> DateTime<Utc> {
        time_to_datetime(&self.validity().not_before)
    }

    /// End of the certificate's validity window.
    pub fn not_valid_after(&self) -> DateTime<Utc> {
        time_to_datetime(&self.validity().not_after)
    }

    /// Check certificate validity at an arbitrary point in time.
    ///
    /// Pure and repeatable: the credential is not mutated and the result
    /// depends only on the certificate's validity window and `at`. The
    /// window is inclusive at both ends.
    pub fn check_validity_at(&self, at: DateTime<Utc>) -> Result<(), CodesignError> {
        let not_before = self.not_valid_before();
        let not_after = self.not_valid_after();

        if at < not_before {
            Err(CodesignError::CertificateNotYetValid(not_before))
        } else if at > not_after {
            Err(CodesignError::CertificateExpired(not_after))
        } else {
            Ok(())
        }
    }

    /// Check certificate validity against the current time.
    pub fn check_validity(&self) -> Result<(), CodesignError> {
        self.check_validity_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::Duration,
        x509_certificate::{KeyAlgorithm, X509CertificateBuilder},
    };

    fn test_credential(ou: &str, validity: Duration) -> Credential {
        let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ed25519);
        builder
            .subject()
            .append_common_name_utf8_string("Test Signer")
            .unwrap();
        builder
            .subject()
            .append_organizational_unit_utf8_string(ou)
            .unwrap();
        builder.validity_duration(validity);

        let (cert, key_pair, _) = builder.create_with_random_keypair().unwrap();

        Credential::from_parts(cert, key_pair)
    }

    #[test]
    fn garbage_input_is_malformed() {
        assert!(matches!(
            Credential::from_pfx(b"definitely not PFX data", ""),
            Err(CodesignError::CredentialMalformed(_))
        ));
    }

    #[test]
    fn organizational_unit_extraction() {
        let credential = test_credential("DEADBEEF01", Duration::hours(1));
        assert_eq!(
            credential.organizational_unit().as_deref(),
            Some("DEADBEEF01")
        );
    }

    #[test]
    fn validity_window_boundaries() {
        let credential = test_credential("TEAM", Duration::hours(1));

        let not_after = credential.not_valid_after();
        let not_before = credential.not_valid_before();
        assert!(not_after > not_before);

        credential.check_validity().unwrap();

        // One second past the end of the window fails; one second before
        // passes. The window bounds are inclusive.
        assert!(matches!(
            credential.check_validity_at(not_after + Duration::seconds(1)),
            Err(CodesignError::CertificateExpired(_))
        ));
        credential
            .check_validity_at(not_after - Duration::seconds(1))
            .unwrap();

        assert!(matches!(
            credential.check_validity_at(not_before - Duration::seconds(1)),
            Err(CodesignError::CertificateNotYetValid(_))
        ));
        credential
            .check_validity_at(not_before + Duration::seconds(1))
            .unwrap();
    }

    #[test]
    fn validity_check_is_repeatable() {
        let credential = test_credential("TEAM", Duration::hours(1));
        let at = credential.not_valid_after() + Duration::days(1);

        for _ in 0..3 {
            assert!(credential.check_validity_at(at).is_err());
        }
        credential.check_validity().unwrap();
    }

    #[test]
    fn expired_credential_fails_current_time_check() {
        // A certificate whose validity window ended an hour before now.
        let credential = test_credential("TEAM", Duration::hours(-1));

        assert!(matches!(
            credential.check_validity(),
            Err(CodesignError::CertificateExpired(_))
        ));
    }
}
