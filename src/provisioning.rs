// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Provisioning profile parsing.

A mobile provisioning profile is a CMS `SignedData` structure whose
encapsulated content is a property list binding a team and application
identity to entitlement constraints.

The embedded signature is verified before any payload content is exposed:
a profile whose signature does not verify is rejected outright rather than
partially trusted. Callers holding a trust anchor can additionally pin the
signer's certificate chain with [ProvisioningProfile::parse_with_anchors].
*/

use {
    crate::error::CodesignError,
    cryptographic_message_syntax::SignedData,
    log::info,
    x509_certificate::CapturedX509Certificate,
};

/// Well-known entitlement keys used to derive the team identifier.
const TEAM_IDENTIFIER_ENTITLEMENT: &str = "com.apple.developer.team-identifier";
const APPLICATION_IDENTIFIER_ENTITLEMENT: &str = "application-identifier";

/// Whether a certificate chains to one of the given anchors using only
/// certificates embedded in the signed data.
fn chains_to_anchor(
    signed_data: &SignedData,
    cert: &CapturedX509Certificate,
    anchors: &[CapturedX509Certificate],
) -> bool {
    let trusted_bytes = |candidate: &CapturedX509Certificate| {
        anchors
            .iter()
            .any(|anchor| anchor.constructed_data() == candidate.constructed_data())
    };

    if trusted_bytes(cert) {
        return true;
    }

    let mut current = cert;

    // Walk issuers through the embedded chain. Bounded by the certificate
    // count so issuer loops terminate.
    for _ in 0..=signed_data.certificates().count() {
        if anchors
            .iter()
            .any(|anchor| current.verify_signed_by_certificate(anchor).is_ok())
        {
            return true;
        }

        let issuer = signed_data.certificates().find(|candidate| {
            candidate.constructed_data() != current.constructed_data()
                && current.verify_signed_by_certificate(*candidate).is_ok()
        });

        match issuer {
            Some(issuer) => {
                if trusted_bytes(issuer) {
                    return true;
                }
                current = issuer;
            }
            None => return false,
        }
    }

    false
}

/// A parsed and signature-verified provisioning profile.
pub struct ProvisioningProfile {
    payload: plist::Dictionary,
}

impl ProvisioningProfile {
    /// Parse a provisioning profile, verifying its embedded signature.
    ///
    /// Every signer's cryptographic signature and message digest must
    /// verify against the encapsulated payload. Verification failure yields
    /// [CodesignError::ProfileSignatureInvalid] and the payload is never
    /// exposed.
    pub fn parse(data: &[u8]) -> Result<Self, CodesignError> {
        Self::parse_internal(data, None)
    }

    /// Like [Self::parse], additionally requiring the signer's certificate
    /// to chain to one of the supplied trust anchors.
    pub fn parse_with_anchors(
        data: &[u8],
        anchors: &[CapturedX509Certificate],
    ) -> Result<Self, CodesignError> {
        Self::parse_internal(data, Some(anchors))
    }

    fn parse_internal(
        data: &[u8],
        anchors: Option<&[CapturedX509Certificate]>,
    ) -> Result<Self, CodesignError> {
        let signed_data = SignedData::parse_ber(data)?;

        let mut signer_seen = false;

        for signer in signed_data.signers() {
            signer_seen = true;

            signer
                .verify_signature_with_signed_data(&signed_data)
                .map_err(|_| CodesignError::ProfileSignatureInvalid)?;
            signer
                .verify_message_digest_with_signed_data(&signed_data)
                .map_err(|_| CodesignError::ProfileSignatureInvalid)?;

            if let Some(anchors) = anchors {
                let (_, serial) = signer
                    .certificate_issuer_and_serial()
                    .ok_or(CodesignError::ProfileSignatureInvalid)?;

                let signer_cert = signed_data
                    .certificates()
                    .find(|cert| cert.serial_number_asn1() == serial)
                    .ok_or(CodesignError::ProfileSignatureInvalid)?;

                if !chains_to_anchor(&signed_data, signer_cert, anchors) {
                    return Err(CodesignError::ProfileSignatureInvalid);
                }
            }
        }

        if !signer_seen {
            return Err(CodesignError::ProfileSignatureInvalid);
        }

        let content = signed_data
            .signed_content()
            .ok_or_else(|| {
                CodesignError::ProfileMalformedPayload("no encapsulated content".to_string())
            })?;

        let payload = plist::Value::from_reader(std::io::Cursor::new(content))
            .map_err(|e| CodesignError::ProfileMalformedPayload(format!("{}", e)))?
            .into_dictionary()
            .ok_or_else(|| {
                CodesignError::ProfileMalformedPayload("payload is not a dictionary".to_string())
            })?;

        info!(
            "parsed provisioning profile: {}",
            payload
                .get("Name")
                .and_then(|v| v.as_string())
                .unwrap_or("<unnamed>")
        );

        Ok(Self { payload })
    }

    /// The decoded profile payload.
    pub fn payload(&self) -> &plist::Dictionary {
        &self.payload
    }

    /// The entitlements constraints embedded in the profile, if any.
    pub fn entitlements(&self) -> Option<&plist::Dictionary> {
        self.payload.get("Entitlements").and_then(|v| v.as_dictionary())
    }

    /// Derive the team identifier.
    ///
    /// Resolution order: the profile's `TeamIdentifier` list, the explicit
    /// team identifier entitlement, then the prefix of the application
    /// identifier entitlement.
    pub fn team_identifier(&self) -> Result<String, CodesignError> {
        if let Some(team) = self
            .payload
            .get("TeamIdentifier")
            .and_then(|v| v.as_array())
            .and_then(|values| values.first())
            .and_then(|v| v.as_string())
        {
            return Ok(team.to_string());
        }

        if let Some(entitlements) = self.entitlements() {
            if let Some(team) = entitlements
                .get(TEAM_IDENTIFIER_ENTITLEMENT)
                .and_then(|v| v.as_string())
            {
                return Ok(team.to_string());
            }

            // The application identifier is `<team id>.<bundle id>`.
            if let Some(app_id) = entitlements
                .get(APPLICATION_IDENTIFIER_ENTITLEMENT)
                .and_then(|v| v.as_string())
            {
                if let Some((prefix, _)) = app_id.split_once('.') {
                    if !prefix.is_empty() {
                        return Ok(prefix.to_string());
                    }
                }
            }
        }

        Err(CodesignError::ProfileTeamIdNotFound)
    }
}
