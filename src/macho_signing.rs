// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing Mach-O binaries.

This module rewrites Mach-O binaries to embed signature superblobs.

# Circular dependency

The code directory digests binary content, including the load commands. But
the load commands reference the size of the signature data, which isn't
known until the code directory, CMS blob, and superblob are all created.

The resolution is to estimate the size of the embedded signature, rewrite
the binary with a zero-filled placeholder of that size, digest the result,
and write the real superblob (padded with zeroes up to the placeholder
length) into the reserved region.
*/

use {
    crate::{
        code_directory::{CodeDirectoryBlob, CodeSignatureFlags},
        code_hash::compute_code_digests,
        embedded_signature::{
            Blob, BlobData, CodeSigningSlot, Digest, EmbeddedSignature, EntitlementsBlob,
            EntitlementsDerBlob, RequirementBlob, RequirementSetBlob, RequirementType,
        },
        embedded_signature_builder::EmbeddedSignatureBuilder,
        entitlements::plist_to_executable_segment_flags,
        error::CodesignError,
        macho::{
            find_macho_targeting, parse_macho_images, parse_version_nibbles,
            semver_to_macho_target_version, Signable,
        },
        signing_settings::SigningSettings,
        ExecutableSegmentFlags,
    },
    goblin::mach::{
        constants::{SEG_LINKEDIT, SEG_PAGEZERO},
        fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
        load_command::{
            CommandVariant, LinkeditDataCommand, SegmentCommand32, SegmentCommand64,
            LC_CODE_SIGNATURE, SIZEOF_LINKEDIT_DATA_COMMAND,
        },
        parse_magic_and_ctx, MachO,
    },
    log::{info, warn},
    scroll::{ctx::SizeWith, IOwrite, Pwrite},
    std::{borrow::Cow, cmp::Ordering, collections::BTreeMap, io::Write},
};

/// Compute a file offset after signature space is resized at an insertion point.
///
/// Offsets at or after the insertion point move by `delta`. A zero offset
/// means "absent" in every load command that carries one and is never
/// shifted.
fn shifted_offset(offset: u32, insertion_offset: u64, delta: i64) -> u32 {
    if offset != 0 && offset as u64 >= insertion_offset {
        (offset as i64 + delta) as u32
    } else {
        offset
    }
}

/// Derive a new Mach-O binary with new signature data.
///
/// The new signature replaces the region from the signature insertion point
/// (the current code limit) through end of file. All load commands holding
/// file offsets are recomputed in a single pass keyed by their original
/// values: `__LINKEDIT` sizes are updated, `LC_CODE_SIGNATURE` is updated
/// or appended, and any symbol table or dyld metadata offsets at or after
/// the insertion point are shifted by the size delta.
fn create_macho_with_signature(
    macho_data: &[u8],
    macho: &MachO,
    signature_data: &[u8],
) -> Result<Vec<u8>, CodesignError> {
    // This should have already been called. But we do it again out of paranoia.
    macho.check_signing_capability()?;

    let insertion_offset = macho.code_limit_binary_offset()?;
    let old_signature_len = macho
        .code_signature_load_command()
        .map(|command| command.datasize as u64)
        .unwrap_or(0);
    let delta = signature_data.len() as i64 - old_signature_len as i64;

    // The replacement __LINKEDIT is the existing segment truncated at the
    // signature start, followed by the new signature data.
    let new_linkedit_segment_size = macho
        .linkedit_data_before_signature()
        .ok_or(CodesignError::MissingLinkedit)?
        .len()
        + signature_data.len();

    // `codesign` rounds the segment vmsize up to the nearest 16kb boundary.
    // We emulate that behavior.
    let remainder = new_linkedit_segment_size % 16384;
    let new_linkedit_segment_vmsize = if remainder == 0 {
        new_linkedit_segment_size
    } else {
        new_linkedit_segment_size + 16384 - remainder
    };

    let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

    // Mach-O data structures are variable endian, defined by the magic.
    let ctx = parse_magic_and_ctx(macho_data, 0)?
        .1
        .ok_or_else(|| CodesignError::InvalidBinary("no parse context".into()))?;

    // If there isn't a code signature presently, a load command for it is
    // introduced.
    let mut header = macho.header;
    if macho.code_signature_load_command().is_none() {
        header.ncmds += 1;
        header.sizeofcmds += SIZEOF_LINKEDIT_DATA_COMMAND as u32;
    }

    cursor.iowrite_with(header, ctx)?;

    let mut seen_signature_load_command = false;

    for load_command in &macho.load_commands {
        let original_command_data =
            &macho_data[load_command.offset..load_command.offset + load_command.command.cmdsize()];

        let written_len = match &load_command.command {
            CommandVariant::CodeSignature(command) => {
                seen_signature_load_command = true;

                let mut command = *command;
                command.datasize = signature_data.len() as _;

                cursor.iowrite_with(command, ctx.le)?;

                LinkeditDataCommand::size_with(&ctx.le)
            }
            CommandVariant::Segment32(segment) => {
                let segment = match segment.name() {
                    Ok(SEG_LINKEDIT) => {
                        let mut segment = *segment;
                        segment.filesize = new_linkedit_segment_size as _;
                        segment.vmsize = new_linkedit_segment_vmsize as _;

                        segment
                    }
                    _ => *segment,
                };

                cursor.iowrite_with(segment, ctx.le)?;

                SegmentCommand32::size_with(&ctx.le)
            }
            CommandVariant::Segment64(segment) => {
                let segment = match segment.name() {
                    Ok(SEG_LINKEDIT) => {
                        let mut segment = *segment;
                        segment.filesize = new_linkedit_segment_size as _;
                        segment.vmsize = new_linkedit_segment_vmsize as _;

                        segment
                    }
                    _ => *segment,
                };

                cursor.iowrite_with(segment, ctx.le)?;

                SegmentCommand64::size_with(&ctx.le)
            }
            CommandVariant::Symtab(command) => {
                let mut command = *command;
                command.symoff = shifted_offset(command.symoff, insertion_offset, delta);
                command.stroff = shifted_offset(command.stroff, insertion_offset, delta);

                cursor.iowrite_with(command, ctx.le)?;

                goblin::mach::load_command::SymtabCommand::size_with(&ctx.le)
            }
            CommandVariant::Dysymtab(command) => {
                let mut command = *command;
                command.tocoff = shifted_offset(command.tocoff, insertion_offset, delta);
                command.modtaboff = shifted_offset(command.modtaboff, insertion_offset, delta);
                command.extrefsymoff =
                    shifted_offset(command.extrefsymoff, insertion_offset, delta);
                command.indirectsymoff =
                    shifted_offset(command.indirectsymoff, insertion_offset, delta);
                command.extreloff = shifted_offset(command.extreloff, insertion_offset, delta);
                command.locreloff = shifted_offset(command.locreloff, insertion_offset, delta);

                cursor.iowrite_with(command, ctx.le)?;

                goblin::mach::load_command::DysymtabCommand::size_with(&ctx.le)
            }
            CommandVariant::DyldInfo(command) | CommandVariant::DyldInfoOnly(command) => {
                let mut command = *command;
                command.rebase_off = shifted_offset(command.rebase_off, insertion_offset, delta);
                command.bind_off = shifted_offset(command.bind_off, insertion_offset, delta);
                command.weak_bind_off =
                    shifted_offset(command.weak_bind_off, insertion_offset, delta);
                command.lazy_bind_off =
                    shifted_offset(command.lazy_bind_off, insertion_offset, delta);
                command.export_off = shifted_offset(command.export_off, insertion_offset, delta);

                // DyldInfoCommand derives `Pwrite`/`SizeWith` but not `IOwrite`,
                // so serialize into a buffer via `pwrite_with` and write the bytes.
                let mut command_buf =
                    [0u8; std::mem::size_of::<goblin::mach::load_command::DyldInfoCommand>()];
                command_buf.pwrite_with(command, 0, ctx.le)?;
                cursor.write_all(&command_buf)?;

                goblin::mach::load_command::DyldInfoCommand::size_with(&ctx.le)
            }
            CommandVariant::FunctionStarts(command)
            | CommandVariant::DataInCode(command)
            | CommandVariant::DylibCodeSignDrs(command)
            | CommandVariant::LinkerOptimizationHint(command) => {
                let mut command = *command;
                command.dataoff = shifted_offset(command.dataoff, insertion_offset, delta);

                cursor.iowrite_with(command, ctx.le)?;

                LinkeditDataCommand::size_with(&ctx.le)
            }
            _ => {
                // Reflect the original bytes.
                cursor.write_all(original_command_data)?;
                original_command_data.len()
            }
        };

        // For commands we rewrote, there may be trailing data after the load
        // command header (e.g. section headers). Preserve it.
        cursor.write_all(&original_command_data[written_len..])?;
    }

    // If there was no signature load command, append one now.
    if !seen_signature_load_command {
        let command = LinkeditDataCommand {
            cmd: LC_CODE_SIGNATURE,
            cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as _,
            dataoff: insertion_offset as _,
            datasize: signature_data.len() as _,
        };

        cursor.iowrite_with(command, ctx.le)?;
    }

    // Write out segment data, substituting the rebuilt __LINKEDIT.
    for segment in macho.segments.iter() {
        // Segment file ranges must remain contiguous and non-overlapping
        // after a rewrite. A segment starting anywhere but the current write
        // position (or 0, for segments overlapping the header) violates that.
        if segment.fileoff != 0 && segment.fileoff != cursor.position() {
            return Err(CodesignError::InvalidBinary(format!(
                "segment at file offset {} not contiguous with previous content",
                segment.fileoff
            )));
        }

        // __PAGEZERO contains no file data and overlaps __TEXT.
        if matches!(segment.name(), Ok(SEG_PAGEZERO)) {
            continue;
        }

        match segment.name() {
            Ok(SEG_LINKEDIT) => {
                cursor.write_all(
                    macho
                        .linkedit_data_before_signature()
                        .ok_or(CodesignError::MissingLinkedit)?,
                )?;
                cursor.write_all(signature_data)?;
            }
            _ => {
                // __TEXT has fileoff 0 and overlaps the header and load
                // commands already written. Only emit bytes the writer
                // hasn't yet produced.
                if segment.fileoff < cursor.position() {
                    let remaining =
                        &segment.data[cursor.position() as usize..segment.filesize as usize];
                    cursor.write_all(remaining)?;
                } else {
                    cursor.write_all(segment.data)?;
                }
            }
        }
    }

    Ok(cursor.into_inner())
}

/// Write a universal (fat) binary from per-architecture Mach-O images.
///
/// Architecture slices are aligned on 16kb boundaries, matching what Apple
/// tooling emits for arm64.
pub fn write_universal_binary<'a>(
    writer: &mut impl Write,
    binaries: impl Iterator<Item = &'a [u8]>,
) -> Result<(), CodesignError> {
    const ALIGN_VALUE: u32 = 14;
    let align: u32 = 2u32.pow(ALIGN_VALUE);

    let mut records = vec![];
    let mut offset: u32 = align;

    for binary in binaries {
        let macho = MachO::parse(binary, 0)?;

        let pad_bytes = match offset % align {
            0 => 0,
            x => align - x,
        };

        offset += pad_bytes;

        let arch = FatArch {
            cputype: macho.header.cputype,
            cpusubtype: macho.header.cpusubtype,
            offset,
            size: binary.len() as u32,
            align: ALIGN_VALUE,
        };

        offset += arch.size;

        records.push((arch, pad_bytes as usize, binary));
    }

    writer.iowrite_with(FAT_MAGIC, scroll::BE)?;
    writer.iowrite_with(records.len() as u32, scroll::BE)?;

    for (fat_arch, _, _) in &records {
        let mut buffer = [0u8; SIZEOF_FAT_ARCH];
        buffer.pwrite_with(fat_arch, 0, scroll::BE)?;
        writer.write_all(&buffer)?;
    }

    let current_offset = SIZEOF_FAT_HEADER + records.len() * SIZEOF_FAT_ARCH;
    if current_offset > align as usize {
        return Err(CodesignError::InvalidBinary(
            "too many architectures for universal header".into(),
        ));
    }

    // Pad NULL until the first Mach-O slice.
    writer.write_all(&b"\0".repeat(align as usize - current_offset % align as usize))?;

    for (_, pad_bytes, macho_data) in records {
        writer.write_all(&b"\0".repeat(pad_bytes))?;
        writer.write_all(macho_data)?;
    }

    Ok(())
}

/// Signs Mach-O binaries.
///
/// This type provides the high level API for signing individual Mach-O
/// binaries, thin or fat/universal. Each architecture slice receives its own
/// code directory and signature, since each is an independently loadable
/// image.
pub struct MachOSigner<'data> {
    /// Raw data backing the parsed binary.
    macho_data: &'data [u8],

    /// Parsed per-architecture images and their backing slices.
    machos: Vec<(&'data [u8], MachO<'data>)>,
}

impl<'data> MachOSigner<'data> {
    /// Construct an instance from unparsed Mach-O data.
    ///
    /// The data is parsed (thin or fat) and each architecture slice is
    /// validated for signing compatibility, so incompatible input fails
    /// before any file is touched.
    pub fn new(macho_data: &'data [u8]) -> Result<Self, CodesignError> {
        let machos = parse_macho_images(macho_data)?;

        for (_, macho) in &machos {
            macho.check_signing_capability()?;
        }

        Ok(Self { macho_data, machos })
    }

    /// The number of architecture slices that will be signed.
    pub fn image_count(&self) -> usize {
        self.machos.len()
    }

    /// Write signed Mach-O data to the given writer using signing settings.
    pub fn write_signed_binary(
        &self,
        settings: &SigningSettings,
        writer: &mut impl Write,
    ) -> Result<(), CodesignError> {
        // A true streaming writer requires knowing final per-arch sizes
        // before the fat header can be written, so individual binaries are
        // buffered internally.

        let binaries = self
            .machos
            .iter()
            .enumerate()
            .map(|(index, (macho_data, original_macho))| {
                info!("signing Mach-O image at index {}", index);

                let signature_len = original_macho.estimate_embedded_signature_size(settings)?;

                // Derive an intermediate Mach-O with placeholder NULLs for
                // signature data so code digests over the load commands are
                // correct.
                let placeholder_signature_data = b"\0".repeat(signature_len);

                let intermediate_macho_data = create_macho_with_signature(
                    macho_data,
                    original_macho,
                    &placeholder_signature_data,
                )?;

                // A side-effect of this parse is that it catches bugs if we
                // write a malformed Mach-O.
                let intermediate_macho = MachO::parse(&intermediate_macho_data, 0)?;

                let mut signature_data = self.create_superblob(
                    settings,
                    &intermediate_macho_data,
                    &intermediate_macho,
                    original_macho.code_signature()?.as_ref(),
                )?;
                info!("total signature size: {} bytes", signature_data.len());

                // Pad to the reserved placeholder length so load command
                // values computed for the intermediate binary hold.
                match signature_data.len().cmp(&placeholder_signature_data.len()) {
                    Ordering::Greater => {
                        return Err(CodesignError::SignatureDataTooLarge);
                    }
                    Ordering::Equal => {}
                    Ordering::Less => {
                        signature_data.extend_from_slice(
                            &b"\0".repeat(placeholder_signature_data.len() - signature_data.len()),
                        );
                    }
                }

                create_macho_with_signature(
                    &intermediate_macho_data,
                    &intermediate_macho,
                    &signature_data,
                )
            })
            .collect::<Result<Vec<_>, CodesignError>>()?;

        if binaries.len() > 1 {
            write_universal_binary(writer, binaries.iter().map(|x| x.as_slice()))?;
        } else {
            writer.write_all(&binaries[0])?;
        }

        Ok(())
    }

    /// Access the raw data backing this signer.
    pub fn macho_data(&self) -> &[u8] {
        self.macho_data
    }

    /// Create the superblob to embed in the `__LINKEDIT` segment.
    ///
    /// Takes an explicit Mach-O to operate on due to the circular dependency
    /// between writing the binary and digesting its content. See the module
    /// docs.
    pub fn create_superblob(
        &self,
        settings: &SigningSettings,
        macho_data: &[u8],
        macho: &MachO,
        previous_signature: Option<&EmbeddedSignature>,
    ) -> Result<Vec<u8>, CodesignError> {
        let mut builder = EmbeddedSignatureBuilder::default();

        for (slot, blob) in self.create_special_blobs(settings)? {
            builder.add_blob(slot, blob)?;
        }

        let code_directory =
            self.create_code_directory(settings, macho_data, macho, previous_signature)?;
        info!("code directory version: 0x{:x}", code_directory.version);

        builder.add_code_directory(code_directory)?;

        for digest_type in settings.extra_digests() {
            if digest_type == settings.digest_type() {
                continue;
            }

            // Everything consults settings for the digest to use, so derive
            // per-digest settings for the alternate directory.
            let mut alt_settings = settings.clone();
            alt_settings.set_digest_type(*digest_type);

            info!("adding alternate code directory using digest {}", digest_type);
            let cd = self.create_code_directory(
                &alt_settings,
                macho_data,
                macho,
                previous_signature,
            )?;

            builder.add_alternate_code_directory(cd)?;
        }

        if let Some((signing_key, signing_cert)) = settings.signing_key() {
            builder.create_cms_signature(
                signing_key,
                signing_cert,
                settings.certificate_chain().iter().cloned(),
            )?;
        } else {
            builder.create_adhoc_signature()?;
        }

        builder.create_superblob()
    }

    /// Create the [CodeDirectoryBlob] for the current configuration.
    pub fn create_code_directory(
        &self,
        settings: &SigningSettings,
        macho_data: &[u8],
        macho: &MachO,
        previous_signature: Option<&EmbeddedSignature>,
    ) -> Result<CodeDirectoryBlob<'static>, CodesignError> {
        let target = find_macho_targeting(macho_data, macho)?;

        if let Some(target) = &target {
            info!(
                "binary targets {} >= {} with SDK {}",
                target.platform, target.minimum_os_version, target.sdk_version,
            );
        }

        let previous_cd = previous_signature.and_then(|signature| {
            signature
                .code_directory_for_digest(*settings.digest_type())
                .unwrap_or(None)
        });

        let mut flags = settings.code_signature_flags().unwrap_or_else(CodeSignatureFlags::empty);

        // The adhoc flag records the absence of a CMS signature.
        if settings.signing_key().is_none() {
            info!("creating ad-hoc signature");
            flags |= CodeSignatureFlags::ADHOC;
        } else if flags.contains(CodeSignatureFlags::ADHOC) {
            info!("removing ad-hoc code signature flag");
            flags -= CodeSignatureFlags::ADHOC;
        }

        // We're not a linker.
        if flags.contains(CodeSignatureFlags::LINKER_SIGNED) {
            info!("removing linker signed flag from code signature");
            flags -= CodeSignatureFlags::LINKER_SIGNED;
        }

        // The code limit is the file offset where the superblob begins in
        // __LINKEDIT.
        let (code_limit, code_limit_64) = match macho.code_limit_binary_offset()? {
            x if x > u32::MAX as u64 => (0, Some(x)),
            x => (x as u32, None),
        };

        let platform = 0;
        let page_size = settings.page_size();

        let (exec_seg_base, exec_seg_limit) = macho.executable_segment_boundary()?;
        let (exec_seg_base, exec_seg_limit) = (Some(exec_seg_base), Some(exec_seg_limit));

        let mut exec_seg_flags = settings.executable_segment_flags();

        // Some entitlements imply executable segment flags. Flags derived
        // from entitlements are always set.
        if let Some(entitlements) = settings.entitlements_plist() {
            let implied_flags = plist_to_executable_segment_flags(entitlements);

            if !implied_flags.is_empty() {
                info!(
                    "entitlements imply executable segment flags: {:?}",
                    implied_flags
                );

                exec_seg_flags = Some(
                    exec_seg_flags.unwrap_or_else(ExecutableSegmentFlags::empty) | implied_flags,
                );
            }
        }

        // The hardened runtime requires a runtime version. Prefer an existing
        // value, then an explicit override, then the SDK version from the
        // binary's targeting commands.
        let runtime = previous_cd.as_ref().and_then(|cd| {
            if let Some(version) = cd.runtime {
                info!(
                    "copying hardened runtime version {} from previous code directory",
                    parse_version_nibbles(version)
                );
            }
            cd.runtime
        });

        let runtime = match settings.runtime_version() {
            Some(version) => {
                info!("using hardened runtime version {} from settings", version);
                Some(semver_to_macho_target_version(version))
            }
            None => runtime,
        };

        let runtime = if runtime.is_none() && flags.contains(CodeSignatureFlags::RUNTIME) {
            if let Some(target) = &target {
                info!(
                    "using hardened runtime version {} derived from SDK version",
                    target.sdk_version
                );
                Some(semver_to_macho_target_version(&target.sdk_version))
            } else {
                warn!("hardened runtime version required but no suitable version could be derived; signature will likely fail verification");
                None
            }
        } else {
            runtime
        };

        let code_digests = compute_code_digests(macho, *settings.digest_type(), page_size)?
            .into_iter()
            .map(|v| Digest { data: v.into() })
            .collect::<Vec<_>>();

        let mut special_digests = BTreeMap::new();

        // Info.plist content lives outside the embedded signature; only its
        // digest is recorded.
        if let Some(data) = settings.info_plist_data() {
            special_digests.insert(
                CodeSigningSlot::Info,
                Digest {
                    data: settings.digest_type().digest_data(data)?.into(),
                },
            );
        }

        // Likewise the resource directory digest. We don't seal resources
        // ourselves, but an existing seal is carried forward.
        if let Some(previous_cd) = &previous_cd {
            if let Some(digest) = previous_cd.slot_digest(CodeSigningSlot::ResourceDir) {
                if !digest.is_null() {
                    special_digests
                        .insert(CodeSigningSlot::ResourceDir, digest.to_owned());
                }
            }
        }

        let ident = Cow::Owned(
            settings
                .binary_identifier()
                .ok_or(CodesignError::NoIdentifier)?
                .to_string(),
        );

        let team_name = match settings.team_id() {
            Some(team_name) => Some(Cow::Owned(team_name.to_string())),
            None => previous_cd.as_ref().and_then(|cd| {
                cd.team_name
                    .as_ref()
                    .map(|name| Cow::Owned(name.clone().into_owned()))
            }),
        };

        let mut cd = CodeDirectoryBlob {
            flags,
            code_limit,
            digest_size: settings.digest_type().digest_len()? as u8,
            digest_type: *settings.digest_type(),
            platform,
            page_size: page_size as u32,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            ident,
            team_name,
            code_digests,
            ..Default::default()
        };

        for (slot, digest) in special_digests {
            cd.set_slot_digest(slot, digest)?;
        }

        cd.adjust_version(target);
        cd.clear_newer_fields();

        Ok(cd)
    }

    /// Create blobs for the special slots given the current configuration.
    ///
    /// Emits every blob except the code directories and signature, which are
    /// derived from the blobs emitted here.
    pub fn create_special_blobs(
        &self,
        settings: &SigningSettings,
    ) -> Result<Vec<(CodeSigningSlot, BlobData<'static>)>, CodesignError> {
        let mut res = Vec::new();

        if let Some(requirement_data) = settings.designated_requirement() {
            let mut blob = RequirementSetBlob::default();
            blob.set_requirements(
                RequirementType::Designated,
                RequirementBlob::from_blob_bytes(requirement_data)?.to_owned(),
            );

            res.push((CodeSigningSlot::RequirementSet, blob.to_owned().into()));
        }

        if let Some(entitlements_xml) = settings.entitlements_xml()? {
            info!("adding entitlements XML blob");
            let blob = EntitlementsBlob::from_string(&entitlements_xml);

            res.push((CodeSigningSlot::Entitlements, blob.into()));
        }

        // DER entitlements appeared around macOS 10.14 and are emitted by
        // `codesign` whenever entitlements are present. Mimic that behavior.
        if let Some(value) = settings.entitlements_plist() {
            info!("adding DER entitlements blob");
            let blob = EntitlementsDerBlob::from_plist(value)?;

            res.push((CodeSigningSlot::EntitlementsDer, blob.into()));
        }

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{embedded_signature::DigestType, testutil::MachOBuilder},
        goblin::mach::Mach,
    };

    fn adhoc_settings(ident: &str) -> SigningSettings<'static> {
        let mut settings = SigningSettings::default();
        settings.set_binary_identifier(ident);
        settings
    }

    fn sign_to_vec(data: &[u8], settings: &SigningSettings) -> Vec<u8> {
        let signer = MachOSigner::new(data).unwrap();
        let mut out = Vec::new();
        signer.write_signed_binary(settings, &mut out).unwrap();
        out
    }

    #[test]
    fn shifted_offset_semantics() {
        // Zero means absent and never moves.
        assert_eq!(shifted_offset(0, 0x1000, 64), 0);
        // Offsets before the insertion point are stable.
        assert_eq!(shifted_offset(0x800, 0x1000, 64), 0x800);
        // Offsets at or after the insertion point move by the delta.
        assert_eq!(shifted_offset(0x1000, 0x1000, 64), 0x1040);
        assert_eq!(shifted_offset(0x2000, 0x1000, -64), 0x2000 - 64);
    }

    #[test]
    fn adhoc_sign_produces_valid_superblob() {
        let data = MachOBuilder::new_aarch64().build();
        let signed = sign_to_vec(&data, &adhoc_settings("com.example.app"));

        let macho = MachO::parse(&signed, 0).unwrap();
        let signature = macho.code_signature().unwrap().unwrap();

        let cd = signature.code_directory().unwrap().unwrap();
        assert_eq!(cd.ident, "com.example.app");
        assert!(cd.flags.contains(CodeSignatureFlags::ADHOC));
        assert_eq!(cd.page_size, 4096);

        // Empty signature slot for ad-hoc.
        assert_eq!(signature.signature_data().unwrap().unwrap().len(), 0);

        // Load command and __LINKEDIT agree about the signature region.
        let command = macho.code_signature_load_command().unwrap();
        assert_eq!(
            command.dataoff as u64,
            macho.code_limit_binary_offset().unwrap()
        );
    }

    #[test]
    fn embedded_code_digests_match_recomputation() {
        let data = MachOBuilder::new_aarch64().build();
        let signed = sign_to_vec(&data, &adhoc_settings("com.example.app"));

        let macho = MachO::parse(&signed, 0).unwrap();
        let signature = macho.code_signature().unwrap().unwrap();
        let cd = signature.code_directory().unwrap().unwrap();

        // Recompute page digests over the signed range of the output and
        // compare with what's embedded.
        let recomputed = compute_code_digests(&macho, DigestType::Sha256, 4096).unwrap();

        assert_eq!(cd.code_digests.len(), recomputed.len());
        for (embedded, fresh) in cd.code_digests.iter().zip(recomputed.iter()) {
            assert_eq!(embedded.data.as_ref(), fresh.as_slice());
        }

        // Digest count covers the code limit in page sized steps.
        let expected_pages =
            (cd.code_limit as usize + cd.page_size as usize - 1) / cd.page_size as usize;
        assert_eq!(cd.code_digests.len(), expected_pages);
    }

    #[test]
    fn signing_is_deterministic() {
        let data = MachOBuilder::new_aarch64().build();
        let settings = adhoc_settings("com.example.app");

        assert_eq!(sign_to_vec(&data, &settings), sign_to_vec(&data, &settings));
    }

    #[test]
    fn tampered_page_fails_digest_comparison() {
        let data = MachOBuilder::new_aarch64().build();
        let mut signed = sign_to_vec(&data, &adhoc_settings("com.example.app"));

        // Capture embedded digests before tampering.
        let baseline = {
            let macho = MachO::parse(&signed, 0).unwrap();
            let signature = macho.code_signature().unwrap().unwrap();
            let cd = signature.code_directory().unwrap().unwrap();
            cd.code_digests
                .iter()
                .map(|d| d.to_vec())
                .collect::<Vec<_>>()
        };

        // Flip a byte within the signed range (inside __TEXT content).
        signed[0x400] ^= 0xff;

        let macho = MachO::parse(&signed, 0).unwrap();
        let recomputed = compute_code_digests(&macho, DigestType::Sha256, 4096).unwrap();

        let differing = baseline
            .iter()
            .zip(recomputed.iter())
            .filter(|(a, b)| a != b)
            .count();
        assert!(differing >= 1, "tampering must perturb at least one page digest");
    }

    #[test]
    fn resign_with_larger_signature_grows_file_consistently() {
        let data = MachOBuilder::new_aarch64().build();

        let signed_once = sign_to_vec(&data, &adhoc_settings("com.example.app"));

        // Re-sign with bulky entitlements. The new superblob exceeds the
        // space the previous signature occupied, forcing the signature
        // region to grow.
        let groups = (0..24)
            .map(|i| format!("<string>ABCDE12345.com.example.app.group{}</string>", i))
            .collect::<String>();
        let mut settings = adhoc_settings("com.example.app");
        settings
            .set_entitlements_xml(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <plist version=\"1.0\"><dict>\
                 <key>get-task-allow</key><true/>\
                 <key>com.apple.security.application-groups</key>\
                 <array>{}</array>\
                 </dict></plist>",
                groups
            ))
            .unwrap();
        settings.add_extra_digest(DigestType::Sha1);

        let signed_twice = sign_to_vec(&signed_once, &settings);

        let first = MachO::parse(&signed_once, 0).unwrap();
        let second = MachO::parse(&signed_twice, 0).unwrap();

        let first_command = first.code_signature_load_command().unwrap();
        let second_command = second.code_signature_load_command().unwrap();

        // Insertion point is stable; only the signature size changes.
        assert_eq!(first_command.dataoff, second_command.dataoff);

        let delta = second_command.datasize as i64 - first_command.datasize as i64;
        assert!(delta > 0, "second signature must be larger");
        assert_eq!(
            signed_twice.len() as i64,
            signed_once.len() as i64 + delta,
            "file length changes by exactly the signature size delta"
        );

        // The re-signed binary parses and carries the new blobs.
        let signature = second.code_signature().unwrap().unwrap();
        assert!(signature.entitlements().unwrap().is_some());
        assert_eq!(signature.all_code_directories().unwrap().len(), 2);

        // Pre-existing linkedit offsets (symbol table) were not disturbed
        // because they precede the insertion point.
        let first_symtab = first.load_commands.iter().find_map(|lc| {
            if let CommandVariant::Symtab(cmd) = lc.command {
                Some(cmd)
            } else {
                None
            }
        });
        let second_symtab = second.load_commands.iter().find_map(|lc| {
            if let CommandVariant::Symtab(cmd) = lc.command {
                Some(cmd)
            } else {
                None
            }
        });
        assert_eq!(
            first_symtab.map(|c| (c.symoff, c.stroff)),
            second_symtab.map(|c| (c.symoff, c.stroff))
        );
    }

    #[test]
    fn universal_binary_writing_roundtrips() {
        let aarch64 = MachOBuilder::new_aarch64().build();
        let x86_64 = MachOBuilder::new_x86_64().build();

        let mut out = Vec::new();
        write_universal_binary(&mut out, [aarch64.as_slice(), x86_64.as_slice()].into_iter())
            .unwrap();

        match Mach::parse(&out).unwrap() {
            Mach::Fat(multiarch) => {
                assert_eq!(multiarch.narches, 2);
                let images = parse_macho_images(&out).unwrap();
                assert_eq!(images.len(), 2);
                assert_ne!(
                    images[0].1.header.cputype(),
                    images[1].1.header.cputype()
                );
            }
            Mach::Binary(_) => panic!("expected a fat binary"),
        }
    }

    #[test]
    fn signing_rejects_unsupported_architecture() {
        let data = MachOBuilder::new_aarch64().cputype(0x12).build();

        assert!(matches!(
            MachOSigner::new(&data),
            Err(CodesignError::UnsupportedArchitecture(_))
        ));
    }
}
