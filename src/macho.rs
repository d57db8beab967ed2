// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O primitives related to code signing.

Code signature data lives at the tail of the `__LINKEDIT` segment. An
`LC_CODE_SIGNATURE` load command in the Mach-O header points at it. See
[find_signature_data] for the location logic.

The data pointed at is an embedded signature superblob, parsed by
[crate::embedded_signature::EmbeddedSignature].
*/

use {
    crate::{
        code_hash::compute_code_digests, embedded_signature::EmbeddedSignature,
        error::CodesignError, signing_settings::SigningSettings,
    },
    goblin::mach::{
        constants::{SEG_LINKEDIT, SEG_PAGEZERO, SEG_TEXT},
        cputype::{CpuType, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86_64},
        load_command::{
            CommandVariant, LinkeditDataCommand, LC_BUILD_VERSION, SIZEOF_LINKEDIT_DATA_COMMAND,
        },
        parse_magic_and_ctx, Mach, MachO,
    },
    scroll::Pread,
};

/// CPU types this crate knows how to re-sign.
const SUPPORTED_CPU_TYPES: &[CpuType] = &[
    CPU_TYPE_ARM,
    CPU_TYPE_ARM64,
    CPU_TYPE_ARM64_32,
    CPU_TYPE_X86_64,
];

/// Extends [MachO] with code signing functionality.
pub trait Signable {
    /// Obtain the parsed code signature, if one is present.
    ///
    /// Returns `Ok(None)` if no signature exists, `Ok(Some)` if it does, or
    /// `Err` on parse error.
    fn code_signature(&self) -> Result<Option<EmbeddedSignature>, CodesignError>;

    /// Determine the start and end file offsets of the `__TEXT` segment.
    fn executable_segment_boundary(&self) -> Result<(u64, u64), CodesignError>;

    /// The start offset of signature data within the `__LINKEDIT` segment.
    fn code_signature_linkedit_start_offset(&self) -> Option<u32>;

    /// The end offset of signature data within the `__LINKEDIT` segment.
    fn code_signature_linkedit_end_offset(&self) -> Option<u32>;

    /// The file offset at which signed code stops.
    ///
    /// If a signature is present this is where the signature starts.
    /// Otherwise it is the end of the file.
    fn code_limit_binary_offset(&self) -> Result<u64, CodesignError>;

    /// Obtain `__LINKEDIT` data preceding the signature data.
    fn linkedit_data_before_signature(&self) -> Option<&[u8]>;

    /// Obtain segment data slices in file order, suitable for digesting.
    fn digestable_segment_data(&self) -> Result<Vec<&[u8]>, CodesignError>;

    /// Resolve the `LC_CODE_SIGNATURE` load command, if present.
    fn code_signature_load_command(&self) -> Option<LinkeditDataCommand>;

    /// Fail if the image's CPU type is not one we can sign.
    fn validate_architecture(&self) -> Result<(), CodesignError>;

    /// Determine whether this image can be re-signed by this crate.
    ///
    /// Our Mach-O rewriting is limited to appending signature data to a
    /// trailing `__LINKEDIT` segment. This validates the preconditions:
    /// `__LINKEDIT` is the final segment, nothing follows an existing
    /// signature, and there is load command space for `LC_CODE_SIGNATURE`
    /// when one needs to be added.
    fn check_signing_capability(&self) -> Result<(), CodesignError>;

    /// Estimate the size in bytes of an embedded signature for this image.
    ///
    /// The estimate is deliberately generous: the signing flow reserves this
    /// much space up front and pads the actual superblob with zeroes.
    fn estimate_embedded_signature_size(
        &self,
        settings: &SigningSettings,
    ) -> Result<usize, CodesignError>;
}

impl<'a> Signable for MachO<'a> {
    fn code_signature(&self) -> Result<Option<EmbeddedSignature>, CodesignError> {
        if let Some(signature) = find_signature_data(self)? {
            Ok(Some(EmbeddedSignature::from_bytes(
                signature.signature_data,
            )?))
        } else {
            Ok(None)
        }
    }

    fn executable_segment_boundary(&self) -> Result<(u64, u64), CodesignError> {
        let segment = self
            .segments
            .iter()
            .find(|segment| matches!(segment.name(), Ok(SEG_TEXT)))
            .ok_or(CodesignError::MissingText)?;

        Ok((segment.fileoff, segment.fileoff + segment.data.len() as u64))
    }

    fn code_signature_linkedit_start_offset(&self) -> Option<u32> {
        let segment = self
            .segments
            .iter()
            .find(|segment| matches!(segment.name(), Ok(SEG_LINKEDIT)));

        if let (Some(segment), Some(command)) = (segment, self.code_signature_load_command()) {
            Some((command.dataoff as u64 - segment.fileoff) as u32)
        } else {
            None
        }
    }

    fn code_signature_linkedit_end_offset(&self) -> Option<u32> {
        let start_offset = self.code_signature_linkedit_start_offset()?;

        self.code_signature_load_command()
            .map(|command| start_offset + command.datasize)
    }

    fn code_limit_binary_offset(&self) -> Result<u64, CodesignError> {
        let last_segment = self.segments.last().ok_or(CodesignError::MissingLinkedit)?;
        if !matches!(last_segment.name(), Ok(SEG_LINKEDIT)) {
            return Err(CodesignError::LinkeditNotLast);
        }

        if let Some(offset) = self.code_signature_linkedit_start_offset() {
            Ok(last_segment.fileoff + offset as u64)
        } else {
            Ok(last_segment.fileoff + last_segment.data.len() as u64)
        }
    }

    fn linkedit_data_before_signature(&self) -> Option<&[u8]> {
        let segment = self
            .segments
            .iter()
            .find(|segment| matches!(segment.name(), Ok(SEG_LINKEDIT)));

        if let Some(segment) = segment {
            if let Some(offset) = self.code_signature_linkedit_start_offset() {
                Some(&segment.data[0..offset as usize])
            } else {
                Some(segment.data)
            }
        } else {
            None
        }
    }

    fn digestable_segment_data(&self) -> Result<Vec<&[u8]>, CodesignError> {
        self.segments
            .iter()
            .filter(|segment| !matches!(segment.name(), Ok(SEG_PAGEZERO)))
            .map(|segment| {
                if matches!(segment.name(), Ok(SEG_LINKEDIT)) {
                    self.linkedit_data_before_signature()
                        .ok_or(CodesignError::MissingLinkedit)
                } else {
                    Ok(segment.data)
                }
            })
            .collect()
    }

    fn code_signature_load_command(&self) -> Option<LinkeditDataCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let CommandVariant::CodeSignature(command) = lc.command {
                Some(command)
            } else {
                None
            }
        })
    }

    fn validate_architecture(&self) -> Result<(), CodesignError> {
        let cputype = self.header.cputype();

        if SUPPORTED_CPU_TYPES.contains(&cputype) {
            Ok(())
        } else {
            Err(CodesignError::UnsupportedArchitecture(cputype))
        }
    }

    fn check_signing_capability(&self) -> Result<(), CodesignError> {
        self.validate_architecture()?;

        let last_segment = self.segments.last().ok_or(CodesignError::MissingLinkedit)?;

        // The last segment needs to be __LINKEDIT so appending signature data
        // doesn't invalidate file offsets elsewhere in the binary.
        if !matches!(last_segment.name(), Ok(SEG_LINKEDIT)) {
            return Err(CodesignError::LinkeditNotLast);
        }

        if let Some(offset) = self.code_signature_linkedit_end_offset() {
            // An existing signature must be the trailing content of
            // __LINKEDIT. We don't know how to update references to data
            // following it.
            if offset as usize == last_segment.data.len() {
                Ok(())
            } else {
                Err(CodesignError::DataAfterSignature)
            }
        } else {
            // No existing signature. There must be room between the last load
            // command and the first section to splice in LC_CODE_SIGNATURE.
            let last_load_command = self
                .load_commands
                .iter()
                .last()
                .ok_or_else(|| CodesignError::InvalidBinary("no load commands".into()))?;

            let first_section = self
                .segments
                .iter()
                .map(|segment| segment.sections())
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .next()
                .ok_or_else(|| CodesignError::InvalidBinary("no sections".into()))?;

            let load_commands_end_offset =
                last_load_command.offset + last_load_command.command.cmdsize();

            if first_section.0.offset as usize - load_commands_end_offset
                >= SIZEOF_LINKEDIT_DATA_COMMAND
            {
                Ok(())
            } else {
                Err(CodesignError::LoadCommandNoRoom)
            }
        }
    }

    fn estimate_embedded_signature_size(
        &self,
        settings: &SigningSettings,
    ) -> Result<usize, CodesignError> {
        // Assume the fixed data structures fit in 1kb.
        let mut size = 1024;

        // Code digests are proportional to binary size and dominate for large
        // binaries. Account for every digest type that will be emitted.
        for digest_type in settings.all_digests() {
            size += compute_code_digests(self, digest_type, settings.page_size())?
                .into_iter()
                .map(|x| x.len())
                .sum::<usize>();
        }

        if let Some(entitlements) = settings.entitlements_xml()? {
            // Entitlements appear twice: XML and DER.
            size += entitlements.len() * 2;
        }

        if let Some(requirement) = settings.designated_requirement() {
            size += requirement.len();
        }

        // Assume a fixed size for the CMS structure, plus the certificate
        // chain, which can be arbitrarily long.
        if settings.signing_key().is_some() {
            size += 4096;

            for cert in settings.certificate_chain() {
                size += cert.constructed_data().len();
            }
        }

        // Align on 1k boundaries.
        size += 1024 - size % 1024;

        Ok(size)
    }
}

/// Describes the location of signature data within a Mach-O image.
pub struct MachOSignatureData<'a> {
    /// Index of the `__LINKEDIT` segment in the segment list.
    pub linkedit_segment_index: usize,

    /// Start offset of `__LINKEDIT` within the binary.
    pub linkedit_segment_start_offset: usize,

    /// End offset of `__LINKEDIT` within the binary.
    pub linkedit_segment_end_offset: usize,

    /// Start offset of signature data within the binary.
    pub linkedit_signature_start_offset: usize,

    /// End offset of signature data within the binary.
    pub linkedit_signature_end_offset: usize,

    /// Start offset of signature data within `__LINKEDIT`.
    pub signature_start_offset: usize,

    /// End offset of signature data within `__LINKEDIT`.
    pub signature_end_offset: usize,

    /// Raw data of the `__LINKEDIT` segment.
    pub linkedit_segment_data: &'a [u8],

    /// The signature data itself.
    pub signature_data: &'a [u8],
}

/// Locate raw signature data in a Mach-O image.
///
/// Returns `Ok(None)` when no `LC_CODE_SIGNATURE` load command exists.
/// Errors if the load command references data outside the file.
pub fn find_signature_data<'a>(
    obj: &'a MachO,
) -> Result<Option<MachOSignatureData<'a>>, CodesignError> {
    if let Some(linkedit_data_command) = obj.load_commands.iter().find_map(|load_command| {
        if let CommandVariant::CodeSignature(command) = &load_command.command {
            Some(command)
        } else {
            None
        }
    }) {
        let (linkedit_segment_index, linkedit) = obj
            .segments
            .iter()
            .enumerate()
            .find(|(_, segment)| matches!(segment.name(), Ok(SEG_LINKEDIT)))
            .ok_or(CodesignError::MissingLinkedit)?;

        let linkedit_segment_start_offset = linkedit.fileoff as usize;
        let linkedit_segment_end_offset = linkedit_segment_start_offset + linkedit.data.len();
        let linkedit_signature_start_offset = linkedit_data_command.dataoff as usize;
        let linkedit_signature_end_offset =
            linkedit_signature_start_offset + linkedit_data_command.datasize as usize;

        if linkedit_signature_start_offset < linkedit_segment_start_offset
            || linkedit_signature_end_offset > linkedit_segment_end_offset
        {
            return Err(CodesignError::TruncatedBinary("code signature data"));
        }

        let signature_start_offset =
            linkedit_data_command.dataoff as usize - linkedit.fileoff as usize;
        let signature_end_offset = signature_start_offset + linkedit_data_command.datasize as usize;

        let signature_data = &linkedit.data[signature_start_offset..signature_end_offset];

        Ok(Some(MachOSignatureData {
            linkedit_segment_index,
            linkedit_segment_start_offset,
            linkedit_segment_end_offset,
            linkedit_signature_start_offset,
            linkedit_signature_end_offset,
            signature_start_offset,
            signature_end_offset,
            linkedit_segment_data: linkedit.data,
            signature_data,
        }))
    } else {
        Ok(None)
    }
}

/// Parse a binary into per-architecture images.
///
/// Thin binaries produce a single element. Fat/universal binaries produce
/// one element per architecture slice, each paired with the slice of the
/// input data backing it.
pub fn parse_macho_images(data: &[u8]) -> Result<Vec<(&[u8], MachO)>, CodesignError> {
    match Mach::parse(data)? {
        Mach::Binary(macho) => Ok(vec![(data, macho)]),
        Mach::Fat(multiarch) => {
            let mut images = Vec::with_capacity(multiarch.narches);

            for (index, arch) in multiarch.iter_arches().enumerate() {
                let arch = arch?;
                let end_offset = arch.offset as usize + arch.size as usize;

                if end_offset > data.len() {
                    return Err(CodesignError::TruncatedBinary("fat arch slice"));
                }

                let macho_data = &data[arch.offset as usize..end_offset];
                images.push((macho_data, multiarch.get(index)?));
            }

            Ok(images)
        }
    }
}

/// Content of an `LC_BUILD_VERSION` load command.
#[derive(Clone, Debug, Pread)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    /// Size of load command data.
    pub cmdsize: u32,
    /// Platform identifier.
    pub platform: u32,
    /// Minimum operating system version.
    ///
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz.
    pub minos: u32,
    /// SDK version, with the same nibble encoding.
    pub sdk: u32,
    /// Number of tools entries following this structure.
    pub ntools: u32,
}

/// Represents `PLATFORM_` Mach-O constants.
pub enum Platform {
    MacOs,
    IOs,
    TvOs,
    WatchOs,
    BridgeOs,
    MacCatalyst,
    IosSimulator,
    TvOsSimulator,
    WatchOsSimulator,
    DriverKit,
    Unknown(u32),
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MacOs => f.write_str("macOS"),
            Self::IOs => f.write_str("iOS"),
            Self::TvOs => f.write_str("tvOS"),
            Self::WatchOs => f.write_str("watchOS"),
            Self::BridgeOs => f.write_str("bridgeOS"),
            Self::MacCatalyst => f.write_str("macCatalyst"),
            Self::IosSimulator => f.write_str("iOSSimulator"),
            Self::TvOsSimulator => f.write_str("tvOSSimulator"),
            Self::WatchOsSimulator => f.write_str("watchOSSimulator"),
            Self::DriverKit => f.write_str("driverKit"),
            Self::Unknown(v) => f.write_fmt(format_args!("Unknown ({})", v)),
        }
    }
}

impl From<u32> for Platform {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::MacOs,
            2 => Self::IOs,
            3 => Self::TvOs,
            4 => Self::WatchOs,
            5 => Self::BridgeOs,
            6 => Self::MacCatalyst,
            7 => Self::IosSimulator,
            8 => Self::TvOsSimulator,
            9 => Self::WatchOsSimulator,
            10 => Self::DriverKit,
            _ => Self::Unknown(v),
        }
    }
}

/// OS targeting settings expressed by a Mach-O binary.
pub struct MachoTarget {
    /// The OS/platform being targeted.
    pub platform: Platform,
    /// Minimum required OS version.
    pub minimum_os_version: semver::Version,
    /// SDK version targeted at build time.
    pub sdk_version: semver::Version,
}

/// Parse an integer with nibbles xxxx.yy.zz into a [semver::Version].
pub fn parse_version_nibbles(v: u32) -> semver::Version {
    let major = v >> 16;
    let minor = v << 16 >> 24;
    let patch = v & 0xff;

    semver::Version::new(major as _, minor as _, patch as _)
}

/// Convert a [semver::Version] to the nibble encoding used by Mach-O.
pub fn semver_to_macho_target_version(version: &semver::Version) -> u32 {
    let major = version.major as u32;
    let minor = version.minor as u32;
    let patch = version.patch as u32;

    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

/// Resolve the OS targeting settings for a Mach-O image.
///
/// Looks for `LC_BUILD_VERSION` first, falling back to the legacy
/// `LC_VERSION_MIN_*` commands.
pub fn find_macho_targeting(
    macho_data: &[u8],
    macho: &MachO,
) -> Result<Option<MachoTarget>, CodesignError> {
    let ctx = parse_magic_and_ctx(macho_data, 0)?
        .1
        .ok_or_else(|| CodesignError::InvalidBinary("no parse context".into()))?;

    for lc in &macho.load_commands {
        if lc.command.cmd() == LC_BUILD_VERSION {
            let build_version = macho_data.pread_with::<BuildVersionCommand>(lc.offset, ctx.le)?;

            return Ok(Some(MachoTarget {
                platform: build_version.platform.into(),
                minimum_os_version: parse_version_nibbles(build_version.minos),
                sdk_version: parse_version_nibbles(build_version.sdk),
            }));
        }
    }

    for lc in &macho.load_commands {
        let command = match lc.command {
            CommandVariant::VersionMinMacosx(c) => Some((c, Platform::MacOs)),
            CommandVariant::VersionMinIphoneos(c) => Some((c, Platform::IOs)),
            CommandVariant::VersionMinTvos(c) => Some((c, Platform::TvOs)),
            CommandVariant::VersionMinWatchos(c) => Some((c, Platform::WatchOs)),
            _ => None,
        };

        if let Some((command, platform)) = command {
            return Ok(Some(MachoTarget {
                platform,
                minimum_os_version: parse_version_nibbles(command.version),
                sdk_version: parse_version_nibbles(command.sdk),
            }));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::MachOBuilder};

    #[test]
    fn version_nibbles() {
        assert_eq!(
            parse_version_nibbles(12 << 16 | 1 << 8 | 2),
            semver::Version::new(12, 1, 2)
        );
        assert_eq!(
            parse_version_nibbles(11 << 16 | 10 << 8 | 15),
            semver::Version::new(11, 10, 15)
        );
        assert_eq!(
            semver_to_macho_target_version(&semver::Version::new(12, 1, 2)),
            12 << 16 | 1 << 8 | 2
        );
    }

    #[test]
    fn synthetic_binary_analysis() {
        let data = MachOBuilder::new_aarch64().build();
        let macho = MachO::parse(&data, 0).unwrap();

        macho.validate_architecture().unwrap();
        macho.check_signing_capability().unwrap();

        // No signature yet, so the code limit is the end of the file.
        assert_eq!(macho.code_limit_binary_offset().unwrap(), data.len() as u64);
        assert!(macho.code_signature().unwrap().is_none());
        assert!(find_signature_data(&macho).unwrap().is_none());

        let (text_start, text_end) = macho.executable_segment_boundary().unwrap();
        assert_eq!(text_start, 0);
        assert!(text_end > 0);

        let segments = macho.digestable_segment_data().unwrap();
        let total: usize = segments.iter().map(|s| s.len()).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn unsupported_cpu_type_rejected() {
        // A PowerPC cputype is not in the supported set.
        let data = MachOBuilder::new_aarch64().cputype(0x12).build();
        let macho = MachO::parse(&data, 0).unwrap();

        assert!(matches!(
            macho.validate_architecture(),
            Err(CodesignError::UnsupportedArchitecture(0x12))
        ));
    }

    #[test]
    fn thin_binary_yields_single_image() {
        let data = MachOBuilder::new_aarch64().build();
        let images = parse_macho_images(&data).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].0.len(), data.len());
    }
}
