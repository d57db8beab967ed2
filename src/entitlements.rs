// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Entitlements handling.

Entitlements are a plist dictionary granting the signed binary OS-enforced
permissions. They are embedded in the superblob twice: verbatim XML and a
DER encoding introduced around macOS 10.14 that modern verifiers prefer.
*/

use {
    crate::{code_directory::ExecutableSegmentFlags, error::CodesignError},
    plist::Value,
    rasn::{
        ber::enc::{Encoder as DerEncoder, Error as DerError},
        enc::Error,
        types::{Class, Tag},
        Encoder,
    },
    std::collections::BTreeMap,
};

/// Encode a plist [Value] to DER, writing to an encoder.
fn der_encode_value(encoder: &mut DerEncoder, value: &Value) -> Result<(), DerError> {
    match value {
        Value::Boolean(v) => encoder.encode_bool(Tag::BOOL, *v),
        Value::Integer(v) => {
            let integer = rasn::types::Integer::from(v.as_signed().unwrap());
            encoder.encode_integer(Tag::INTEGER, &integer)
        }
        Value::String(string) => encoder.encode_utf8_string(Tag::UTF8_STRING, string),
        Value::Array(array) => encoder.encode_sequence(Tag::SEQUENCE, |encoder| {
            for v in array {
                der_encode_value(encoder, v)?;
            }
            Ok(())
        }),
        Value::Dictionary(dict) => {
            // Keys must be emitted in sorted order.
            let map = dict.into_iter().collect::<BTreeMap<_, _>>();
            encoder.encode_sequence(Tag::new(Class::Context, 16), |encoder| {
                for (k, v) in map {
                    encoder.encode_sequence(Tag::SEQUENCE, |encoder| {
                        encoder.encode_utf8_string(Tag::UTF8_STRING, k)?;
                        der_encode_value(encoder, v)?;
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }

        Value::Data(_) => Err(DerError::custom("encoding of data values not supported")),
        Value::Date(_) => Err(DerError::custom("encoding of date values not supported")),
        Value::Real(_) => Err(DerError::custom("encoding of real values not supported")),
        Value::Uid(_) => Err(DerError::custom("encoding of uid values not supported")),
        _ => Err(DerError::custom(
            "encoding of unknown value type not supported",
        )),
    }
}

/// Encode an entitlements plist to DER.
pub fn der_encode_entitlements_plist(value: &Value) -> Result<Vec<u8>, CodesignError> {
    rasn::der::encode_scope(|encoder| {
        encoder.encode_sequence(Tag::new(Class::Application, 16), |encoder| {
            encoder.encode_integer(Tag::INTEGER, &rasn::types::Integer::from(1))?;
            der_encode_value(encoder, value)?;
            Ok(())
        })
    })
    .map_err(|e| CodesignError::EntitlementsDerEncode(format!("{}", e)))
}

/// Derive [ExecutableSegmentFlags] implied by an entitlements plist.
///
/// Some entitlement keys imply features in the executable segment flags of
/// the code directory.
pub fn plist_to_executable_segment_flags(value: &Value) -> ExecutableSegmentFlags {
    let mut flags = ExecutableSegmentFlags::empty();

    if let Value::Dictionary(d) = value {
        if matches!(d.get("get-task-allow"), Some(Value::Boolean(true))) {
            flags |= ExecutableSegmentFlags::ALLOW_UNSIGNED;
        }
        if matches!(d.get("run-unsigned-code"), Some(Value::Boolean(true))) {
            flags |= ExecutableSegmentFlags::ALLOW_UNSIGNED;
        }
        if matches!(
            d.get("com.apple.private.cs.debugger"),
            Some(Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::DEBUGGER;
        }
        if matches!(d.get("dynamic-codesigning"), Some(Value::Boolean(true))) {
            flags |= ExecutableSegmentFlags::JIT;
        }
        if matches!(
            d.get("com.apple.private.skip-library-validation"),
            Some(Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::SKIP_LIBRARY_VALIDATION;
        }
        if matches!(
            d.get("com.apple.private.amfi.can-load-cdhash"),
            Some(Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::CAN_LOAD_CD_HASH;
        }
        if matches!(
            d.get("com.apple.private.amfi.can-execute-cdhash"),
            Some(Value::Boolean(true))
        ) {
            flags |= ExecutableSegmentFlags::CAN_EXEC_CD_HASH;
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use {super::*, plist::Dictionary};

    // Expected encodings captured from Apple's `codesign`
    // --generate-entitlement-der output.
    const DER_EMPTY_DICT: &[u8] = &[112, 5, 2, 1, 1, 176, 0];
    const DER_BOOL_TRUE: &[u8] = &[
        112, 15, 2, 1, 1, 176, 10, 48, 8, 12, 3, 107, 101, 121, 1, 1, 255,
    ];
    const DER_STRING_VALUE: &[u8] = &[
        112, 19, 2, 1, 1, 176, 14, 48, 12, 12, 3, 107, 101, 121, 12, 5, 118, 97, 108, 117, 101,
    ];
    const DER_MULTIPLE_KEYS: &[u8] = &[
        112, 37, 2, 1, 1, 176, 32, 48, 8, 12, 3, 107, 101, 121, 1, 1, 0, 48, 9, 12, 4, 107, 101,
        121, 50, 1, 1, 255, 48, 9, 12, 4, 107, 101, 121, 51, 2, 1, 42,
    ];

    #[test]
    fn der_encoding_known_values() {
        let mut dict = Dictionary::new();
        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(dict.clone())).unwrap(),
            DER_EMPTY_DICT
        );

        dict.insert("key".into(), Value::Boolean(true));
        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(dict.clone())).unwrap(),
            DER_BOOL_TRUE
        );

        dict.insert("key".into(), Value::String("value".into()));
        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(dict)).unwrap(),
            DER_STRING_VALUE
        );
    }

    #[test]
    fn der_encoding_sorts_keys() {
        let mut dict = Dictionary::new();
        dict.insert("key3".into(), Value::Integer(plist::Integer::from(42)));
        dict.insert("key".into(), Value::Boolean(false));
        dict.insert("key2".into(), Value::Boolean(true));

        assert_eq!(
            der_encode_entitlements_plist(&Value::Dictionary(dict)).unwrap(),
            DER_MULTIPLE_KEYS
        );
    }

    #[test]
    fn der_encoding_rejects_unsupported_types() {
        let mut dict = Dictionary::new();
        dict.insert("key".into(), Value::Real(1.5));

        assert!(matches!(
            der_encode_entitlements_plist(&Value::Dictionary(dict)),
            Err(CodesignError::EntitlementsDerEncode(_))
        ));
    }

    #[test]
    fn implied_executable_segment_flags() {
        let mut dict = Dictionary::new();
        dict.insert("get-task-allow".into(), Value::Boolean(true));
        dict.insert("dynamic-codesigning".into(), Value::Boolean(true));

        let flags = plist_to_executable_segment_flags(&Value::Dictionary(dict));
        assert_eq!(
            flags,
            ExecutableSegmentFlags::ALLOW_UNSIGNED | ExecutableSegmentFlags::JIT
        );

        let flags = plist_to_executable_segment_flags(&Value::Dictionary(Dictionary::new()));
        assert!(flags.is_empty());
    }
}
