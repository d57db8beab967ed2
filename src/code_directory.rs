// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, BlobMagic, CodeSigningSlot, Digest, DigestType,
        },
        error::CodesignError,
        macho::{MachoTarget, Platform},
    },
    scroll::{IOwrite, Pread},
    semver::Version,
    std::{borrow::Cow, collections::BTreeMap, io::Write, str::FromStr},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the code directory and govern use of the
    /// embedded signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        ///
        /// This signature should be ignored in any new signing operation.
        const LINKER_SIGNED = 0x20000;
    }
}

impl FromStr for CodeSignatureFlags {
    type Err = CodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::HOST),
            "hard" => Ok(Self::FORCE_HARD),
            "kill" => Ok(Self::FORCE_KILL),
            "expires" => Ok(Self::FORCE_EXPIRATION),
            "library" => Ok(Self::LIBRARY_VALIDATION),
            "runtime" => Ok(Self::RUNTIME),
            "linker-signed" => Ok(Self::LINKER_SIGNED),
            _ => Err(CodesignError::CodeSignatureUnknownFlag(s.to_string())),
        }
    }
}

impl CodeSignatureFlags {
    /// Attempt to convert a series of strings into a [CodeSignatureFlags].
    pub fn from_strs(s: &[&str]) -> Result<CodeSignatureFlags, CodesignError> {
        let mut flags = CodeSignatureFlags::empty();

        for s in s {
            flags |= Self::from_str(s)?;
        }

        Ok(flags)
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of the executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

impl FromStr for ExecutableSegmentFlags {
    type Err = CodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main-binary" => Ok(Self::MAIN_BINARY),
            "allow-unsigned" => Ok(Self::ALLOW_UNSIGNED),
            "debugger" => Ok(Self::DEBUGGER),
            "jit" => Ok(Self::JIT),
            "skip-library-validation" => Ok(Self::SKIP_LIBRARY_VALIDATION),
            "can-load-cd-hash" => Ok(Self::CAN_LOAD_CD_HASH),
            "can-exec-cd-hash" => Ok(Self::CAN_EXEC_CD_HASH),
            _ => Err(CodesignError::ExecutableSegmentUnknownFlag(s.to_string())),
        }
    }
}

/// Version of the code directory data structure.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

fn get_digests(data: &[u8], offset: usize, count: usize, digest_size: usize) -> Vec<Digest<'_>> {
    data[offset..offset + (count * digest_size)]
        .chunks(digest_size)
        .map(|data| Digest { data: data.into() })
        .collect()
}

/// A code directory blob.
///
/// The wire structure is versioned and has been extended over time. This
/// struct is a superset of all versions: the parser leaves `Option<T>`
/// fields as `None` when the version predates their introduction.
///
/// Digest counts and string offsets are not stored explicitly because they
/// are derived from the variable length fields at serialization time.
#[derive(Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// File offset at which code digesting stops.
    ///
    /// This corresponds to the file offset where the embedded signature
    /// superblob begins in the `__LINKEDIT` segment.
    pub code_limit: u32,
    /// Size of each digest in bytes.
    pub digest_size: u8,
    /// Digest algorithm.
    pub digest_type: DigestType,
    /// Platform identifier. 0 if not a platform binary.
    pub platform: u8,
    /// Page size in bytes. (Stored on the wire as log2.)
    pub page_size: u32,
    /// Unused (must be 0).
    pub spare2: u32,
    // Version 0x20100
    /// Offset of optional scatter vector.
    pub scatter_offset: Option<u32>,
    // Version 0x20300
    /// Unused (must be 0).
    pub spare3: Option<u32>,
    /// Limit to main image signature range, 64 bits.
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    /// File offset of the executable segment.
    pub exec_seg_base: Option<u64>,
    /// Length of the executable segment.
    pub exec_seg_limit: Option<u64>,
    /// Executable segment flags.
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    // Version 0x20600
    pub linkage_digest_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub spare4: Option<u16>,
    pub linkage_offset: Option<u32>,
    pub linkage_size: Option<u32>,

    // End of wire header fields / start of derived data.
    /// Identifier string (canonically the bundle identifier).
    pub ident: Cow<'a, str>,
    /// Team identifier, if any.
    pub team_name: Option<Cow<'a, str>>,
    /// Per-page digests over the signed range, in page order.
    pub code_digests: Vec<Digest<'a>>,
    // Keyed writes go through set_slot_digest, which validates slots.
    pub(crate) special_digests: BTreeMap<CodeSigningSlot, Digest<'a>>,
}

impl<'a> Default for CodeDirectoryBlob<'a> {
    fn default() -> Self {
        Self {
            version: CodeDirectoryVersion::Initial as u32,
            flags: CodeSignatureFlags::empty(),
            code_limit: 0,
            digest_size: 0,
            digest_type: DigestType::Sha256,
            platform: 0,
            page_size: 4096,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base: None,
            exec_seg_limit: None,
            exec_seg_flags: None,
            runtime: None,
            pre_encrypt_offset: None,
            linkage_digest_type: None,
            linkage_truncated: None,
            spare4: None,
            linkage_offset: None,
            linkage_size: None,
            ident: "".into(),
            team_name: None,
            code_digests: vec![],
            special_digests: BTreeMap::new(),
        }
    }
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(BlobMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;

        let offset = &mut 8;

        let version = data.gread_with(offset, scroll::BE)?;
        let flags = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = unsafe { CodeSignatureFlags::from_bits_unchecked(flags) };
        assert_eq!(*offset, 0x10);
        let digest_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        assert_eq!(*offset, 0x20);
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let digest_size = data.gread_with(offset, scroll::BE)?;
        let digest_type = data.gread_with::<u8>(offset, scroll::BE)?.into();
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let page_size = 2u32.pow(page_size as u32);
        let spare2 = data.gread_with(offset, scroll::BE)?;

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            let v = data.gread_with::<u32>(offset, scroll::BE)?;

            if v != 0 {
                Some(v)
            } else {
                None
            }
        } else {
            None
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            assert_eq!(*offset, 0x30);
            let v = data.gread_with::<u32>(offset, scroll::BE)?;

            if v != 0 {
                Some(v)
            } else {
                None
            }
        } else {
            None
        };

        let (spare3, code_limit_64) = if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32
        {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
                assert_eq!(*offset, 0x40);
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with::<u64>(offset, scroll::BE)?),
                )
            } else {
                (None, None, None)
            };

        let exec_seg_flags = exec_seg_flags
            .map(|flags| unsafe { ExecutableSegmentFlags::from_bits_unchecked(flags) });

        let (runtime, pre_encrypt_offset) =
            if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                assert_eq!(*offset, 0x58);
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None)
            };

        let (linkage_digest_type, linkage_truncated, spare4, linkage_offset, linkage_size) =
            if version >= CodeDirectoryVersion::SupportsLinkage as u32 {
                assert_eq!(*offset, 0x60);
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None, None, None, None)
            };

        if ident_offset as usize >= data.len() {
            return Err(CodesignError::CodeDirectoryMalformedIdentifier);
        }

        // Identifier and team name are trailing NUL-terminated strings.
        let ident = match data[ident_offset as usize..]
            .split(|&b| b == 0)
            .map(std::str::from_utf8)
            .next()
        {
            Some(res) => {
                Cow::from(res.map_err(|_| CodesignError::CodeDirectoryMalformedIdentifier)?)
            }
            None => {
                return Err(CodesignError::CodeDirectoryMalformedIdentifier);
            }
        };

        let team_name = if let Some(team_offset) = team_offset {
            if team_offset as usize >= data.len() {
                return Err(CodesignError::CodeDirectoryMalformedTeam);
            }

            match data[team_offset as usize..]
                .split(|&b| b == 0)
                .map(std::str::from_utf8)
                .next()
            {
                Some(res) => {
                    Some(Cow::from(
                        res.map_err(|_| CodesignError::CodeDirectoryMalformedTeam)?,
                    ))
                }
                None => {
                    return Err(CodesignError::CodeDirectoryMalformedTeam);
                }
            }
        } else {
            None
        };

        let special_digests_len = (digest_size as usize)
            .checked_mul(n_special_slots as usize)
            .ok_or(CodesignError::SuperblobMalformed)?;
        let code_digests_len = (digest_size as usize)
            .checked_mul(n_code_slots as usize)
            .ok_or(CodesignError::SuperblobMalformed)?;

        if (digest_offset as usize)
            .checked_sub(special_digests_len)
            .is_none()
            || digest_offset as usize + code_digests_len > data.len()
        {
            return Err(CodesignError::SuperblobMalformed);
        }

        let code_digests = get_digests(
            data,
            digest_offset as usize,
            n_code_slots as usize,
            digest_size as usize,
        );

        // Special digests live at "negative" indices before the code digest
        // array, with the digest for slot N at index -N.
        let special_digests = get_digests(
            data,
            digest_offset as usize - special_digests_len,
            n_special_slots as usize,
            digest_size as usize,
        )
        .into_iter()
        .enumerate()
        .map(|(i, digest)| (CodeSigningSlot::from(n_special_slots - i as u32), digest))
        .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            digest_size,
            digest_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            linkage_digest_type,
            linkage_truncated,
            spare4,
            linkage_offset,
            linkage_size,
            ident,
            team_name,
            code_digests,
            special_digests,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // Serialization is 2 phase: write placeholder offsets now, backfill
        // them once the variable length data has been laid out.

        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits, scroll::BE)?;
        let digest_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        assert_eq!(cursor.position(), 0x10);

        // The special digest array is dense from slot 1 through the highest
        // populated slot, with null digests filling any gaps.
        let highest_slot = self
            .special_digests
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(self.code_digests.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.digest_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.digest_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        assert_eq!(cursor.position(), 0x20);
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let mut team_offset_cursor_position = None;

        if self.version >= CodeDirectoryVersion::SupportsScatter as u32 {
            if self.scatter_offset.is_some() {
                return Err(CodesignError::SignatureBuilder(
                    "scatter vector serialization not supported",
                ));
            }
            cursor.iowrite_with(0u32, scroll::BE)?;

            if self.version >= CodeDirectoryVersion::SupportsTeamId as u32 {
                team_offset_cursor_position = Some(cursor.position());
                cursor.iowrite_with(0u32, scroll::BE)?;

                if self.version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
                    cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
                    assert_eq!(cursor.position(), 0x30);
                    cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;

                    if self.version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
                        cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
                        assert_eq!(cursor.position(), 0x40);
                        cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
                        cursor.iowrite_with(
                            self.exec_seg_flags
                                .unwrap_or_else(ExecutableSegmentFlags::empty)
                                .bits,
                            scroll::BE,
                        )?;

                        if self.version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                            assert_eq!(cursor.position(), 0x50);
                            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
                            cursor
                                .iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;

                            if self.version >= CodeDirectoryVersion::SupportsLinkage as u32 {
                                cursor.iowrite_with(
                                    self.linkage_digest_type.unwrap_or(0),
                                    scroll::BE,
                                )?;
                                cursor.iowrite_with(
                                    self.linkage_truncated.unwrap_or(0),
                                    scroll::BE,
                                )?;
                                cursor.iowrite_with(self.spare4.unwrap_or(0), scroll::BE)?;
                                cursor
                                    .iowrite_with(self.linkage_offset.unwrap_or(0), scroll::BE)?;
                                assert_eq!(cursor.position(), 0x60);
                                cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
                            }
                        }
                    }
                }
            }
        }

        // Fixed size fields are done. Now the variable length data.

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        if team_offset_cursor_position.is_some() {
            if let Some(team_name) = &self.team_name {
                cursor.write_all(team_name.as_bytes())?;
                cursor.write_all(b"\0")?;
            }
        }

        // Special digests are written from the highest slot downwards so the
        // digest for slot N ends up N positions before the code digests.
        for slot_index in (1..highest_slot + 1).rev() {
            let slot = CodeSigningSlot::from(slot_index);

            if let Some(digest) = self.special_digests.get(&slot) {
                cursor.write_all(&digest.data)?;
            } else {
                cursor.write_all(&b"\0".repeat(self.digest_size as usize))?;
            }
        }

        let code_digests_start_offset = cursor.position();

        for digest in &self.code_digests {
            cursor.write_all(&digest.data)?;
        }

        // Backfill placeholder offsets. Add 8 to account for the blob header,
        // which isn't part of this buffer.
        cursor.set_position(digest_offset_cursor_position);
        cursor.iowrite_with(code_digests_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if let Some(offset) = team_offset_cursor_position {
            if self.team_name.is_some() {
                cursor.set_position(offset);
                cursor.iowrite_with(team_offset as u32 + 8, scroll::BE)?;
            }
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Adjust the version of the data structure according to what fields are set.
    ///
    /// Returns the old version.
    pub fn adjust_version(&mut self, target: Option<MachoTarget>) -> u32 {
        let old_version = self.version;

        let mut minimum_version = CodeDirectoryVersion::Initial;

        if self.scatter_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsScatter;
        }
        if self.team_name.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsTeamId;
        }
        if self.spare3.is_some() || self.code_limit_64.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsCodeLimit64;
        }
        if self.exec_seg_base.is_some()
            || self.exec_seg_limit.is_some()
            || self.exec_seg_flags.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsExecutableSegment;
        }
        if self.runtime.is_some() || self.pre_encrypt_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsRuntime;
        }
        if self.linkage_digest_type.is_some()
            || self.linkage_truncated.is_some()
            || self.spare4.is_some()
            || self.linkage_offset.is_some()
            || self.linkage_size.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsLinkage;
        }

        // Some platforms have hard requirements for the minimum version. If
        // targeting settings are in effect, raise the minimum accordingly.
        if let Some(target) = target {
            let target_minimum = match target.platform {
                // iOS >= 15 requires a modern code signature format.
                Platform::IOs | Platform::IosSimulator => {
                    if target.minimum_os_version >= Version::new(15, 0, 0) {
                        CodeDirectoryVersion::SupportsExecutableSegment
                    } else {
                        CodeDirectoryVersion::Initial
                    }
                }
                Platform::MacOs => {
                    if target.minimum_os_version >= Version::new(12, 0, 0) {
                        CodeDirectoryVersion::SupportsExecutableSegment
                    } else {
                        CodeDirectoryVersion::Initial
                    }
                }
                _ => CodeDirectoryVersion::Initial,
            };

            if target_minimum as u32 > minimum_version as u32 {
                minimum_version = target_minimum;
            }
        }

        self.version = minimum_version as u32;

        old_version
    }

    /// Clears optional fields that are newer than the current version.
    ///
    /// The wire structure is versioned and our struct is a superset of all
    /// versions. The serializer omits too-new fields for a given version,
    /// but optional fields can still be set when they wouldn't serialize.
    /// This clears them so the struct matches what will be written.
    pub fn clear_newer_fields(&mut self) {
        if self.version < CodeDirectoryVersion::SupportsScatter as u32 {
            self.scatter_offset = None;
        }
        if self.version < CodeDirectoryVersion::SupportsTeamId as u32 {
            self.team_name = None;
        }
        if self.version < CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            self.spare3 = None;
            self.code_limit_64 = None;
        }
        if self.version < CodeDirectoryVersion::SupportsExecutableSegment as u32 {
            self.exec_seg_base = None;
            self.exec_seg_limit = None;
            self.exec_seg_flags = None;
        }
        if self.version < CodeDirectoryVersion::SupportsRuntime as u32 {
            self.runtime = None;
            self.pre_encrypt_offset = None;
        }
        if self.version < CodeDirectoryVersion::SupportsLinkage as u32 {
            self.linkage_digest_type = None;
            self.linkage_truncated = None;
            self.spare4 = None;
            self.linkage_offset = None;
            self.linkage_size = None;
        }
    }

    /// Obtain the special digest for a slot, if present.
    pub fn slot_digest(&self, slot: CodeSigningSlot) -> Option<&Digest<'a>> {
        self.special_digests.get(&slot)
    }

    /// Set the special digest for a slot.
    ///
    /// Errors if the slot cannot be expressed in the special digest array.
    pub fn set_slot_digest(
        &mut self,
        slot: CodeSigningSlot,
        digest: impl Into<Digest<'a>>,
    ) -> Result<(), CodesignError> {
        if !slot.is_special_digest_expressible() {
            return Err(CodesignError::SignatureBuilder(
                "slot cannot be expressed in code directory special digests",
            ));
        }

        self.special_digests.insert(slot, digest.into());

        Ok(())
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            digest_size: self.digest_size,
            digest_type: self.digest_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
            linkage_digest_type: self.linkage_digest_type,
            linkage_truncated: self.linkage_truncated,
            spare4: self.spare4,
            linkage_offset: self.linkage_offset,
            linkage_size: self.linkage_size,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_digests: self
                .code_digests
                .iter()
                .map(|h| h.to_owned())
                .collect::<Vec<_>>(),
            special_digests: self
                .special_digests
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_blob() -> CodeDirectoryBlob<'static> {
        let mut cd = CodeDirectoryBlob {
            version: CodeDirectoryVersion::SupportsExecutableSegment as u32,
            flags: CodeSignatureFlags::ADHOC,
            code_limit: 0x2000,
            digest_size: 32,
            digest_type: DigestType::Sha256,
            page_size: 4096,
            exec_seg_base: Some(0),
            exec_seg_limit: Some(0x1000),
            exec_seg_flags: Some(ExecutableSegmentFlags::MAIN_BINARY),
            ident: "com.example.app".into(),
            team_name: Some("DEADBEEF01".into()),
            code_digests: vec![vec![0xaa; 32].into(), vec![0xbb; 32].into()],
            ..Default::default()
        };

        cd.set_slot_digest(CodeSigningSlot::RequirementSet, vec![0x11; 32])
            .unwrap();
        cd.set_slot_digest(CodeSigningSlot::Entitlements, vec![0x22; 32])
            .unwrap();

        cd
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let cd = test_blob();
        let data = cd.to_blob_bytes().unwrap();

        let parsed = CodeDirectoryBlob::from_blob_bytes(&data).unwrap();

        assert_eq!(parsed.version, cd.version);
        assert_eq!(parsed.flags, cd.flags);
        assert_eq!(parsed.code_limit, cd.code_limit);
        assert_eq!(parsed.ident, cd.ident);
        assert_eq!(parsed.team_name, cd.team_name);
        assert_eq!(parsed.code_digests, cd.code_digests);
        assert_eq!(
            parsed.slot_digest(CodeSigningSlot::Entitlements),
            cd.slot_digest(CodeSigningSlot::Entitlements)
        );

        // Missing slots between populated ones parse as null digests.
        assert!(parsed
            .slot_digest(CodeSigningSlot::ResourceDir)
            .unwrap()
            .is_null());

        // Re-serializing the parsed form reproduces identical bytes.
        assert_eq!(parsed.to_blob_bytes().unwrap(), data);
    }

    #[test]
    fn serialization_is_deterministic() {
        let cd = test_blob();
        assert_eq!(cd.to_blob_bytes().unwrap(), cd.to_blob_bytes().unwrap());
    }

    #[test]
    fn version_adjustment() {
        let mut cd = CodeDirectoryBlob {
            ident: "test".into(),
            ..Default::default()
        };

        cd.adjust_version(None);
        assert_eq!(cd.version, CodeDirectoryVersion::Initial as u32);

        cd.team_name = Some("TEAM".into());
        cd.adjust_version(None);
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsTeamId as u32);

        cd.exec_seg_base = Some(0);
        cd.adjust_version(None);
        assert_eq!(
            cd.version,
            CodeDirectoryVersion::SupportsExecutableSegment as u32
        );

        cd.runtime = Some(0x000d0000);
        cd.adjust_version(None);
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsRuntime as u32);
    }

    #[test]
    fn clear_newer_fields_drops_unserializable() {
        let mut cd = test_blob();
        cd.version = CodeDirectoryVersion::SupportsTeamId as u32;
        cd.clear_newer_fields();

        assert!(cd.exec_seg_base.is_none());
        assert!(cd.exec_seg_flags.is_none());
        assert!(cd.team_name.is_some());
    }

    #[test]
    fn signature_flags_from_str() {
        assert_eq!(
            CodeSignatureFlags::from_str("runtime").unwrap(),
            CodeSignatureFlags::RUNTIME
        );
        assert_eq!(
            CodeSignatureFlags::from_strs(&["hard", "kill"]).unwrap(),
            CodeSignatureFlags::FORCE_HARD | CodeSignatureFlags::FORCE_KILL
        );
        assert!(CodeSignatureFlags::from_str("bogus").is_err());
    }
}
