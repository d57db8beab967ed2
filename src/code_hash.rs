// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Page-granularity content digests.

Binary integrity is established by digesting the signed range of the binary
in fixed size pages (typically 4096 bytes) and recording each page digest in
the code directory. The kernel verifies individual pages against these
digests as they fault in.

Digesting restarts at segment boundaries, which are page aligned in any
linker-produced binary, so the result is equivalent to digesting the raw
file from offset 0 through the code limit.
*/

use {
    crate::{
        embedded_signature::DigestType,
        error::CodesignError,
        macho::Signable,
    },
    goblin::mach::MachO,
};

/// Digest a buffer in pages of `page_size`, returning one digest per page.
///
/// The final page may be short; it is digested as-is, without padding.
pub fn paged_digests(
    data: &[u8],
    digest_type: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, CodesignError> {
    data.chunks(page_size)
        .map(|chunk| digest_type.digest_data(chunk))
        .collect::<Result<Vec<_>, CodesignError>>()
}

/// Compute code digests over the signable content of a Mach-O image.
///
/// Segment data up to (but excluding) any existing signature data is
/// digested in page order. The produced vector is what the code directory's
/// code digest array should contain.
pub fn compute_code_digests(
    macho: &MachO,
    digest_type: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, CodesignError> {
    Ok(macho
        .digestable_segment_data()?
        .into_iter()
        .map(|data| paged_digests(data, digest_type, page_size))
        .collect::<Result<Vec<_>, CodesignError>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_is_ceiling_division() {
        let data = vec![0u8; 4096 * 2 + 1];
        let digests = paged_digests(&data, DigestType::Sha256, 4096).unwrap();
        assert_eq!(digests.len(), 3);

        let data = vec![0u8; 4096 * 2];
        let digests = paged_digests(&data, DigestType::Sha256, 4096).unwrap();
        assert_eq!(digests.len(), 2);
    }

    #[test]
    fn digests_are_deterministic() {
        let data = (0..10000u32).map(|v| v as u8).collect::<Vec<_>>();

        let a = paged_digests(&data, DigestType::Sha256, 4096).unwrap();
        let b = paged_digests(&data, DigestType::Sha256, 4096).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_byte_change_perturbs_a_page_digest() {
        let data = vec![0u8; 4096 * 3];
        let baseline = paged_digests(&data, DigestType::Sha256, 4096).unwrap();

        for offset in [0usize, 4095, 4096, 12287] {
            let mut tampered = data.clone();
            tampered[offset] ^= 0x01;

            let digests = paged_digests(&tampered, DigestType::Sha256, 4096).unwrap();
            let changed = baseline
                .iter()
                .zip(digests.iter())
                .filter(|(a, b)| a != b)
                .count();
            assert_eq!(changed, 1, "exactly one page digest changes");
        }
    }
}
