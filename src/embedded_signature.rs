// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures (superblobs, blobs, magic values).
//!
//! The signature region of a Mach-O binary holds a *SuperBlob*: a header
//! (magic, total length, blob count) followed by an index of (slot, offset)
//! pairs and then the individual blobs. Each blob itself starts with a u32
//! magic and u32 length, both big-endian.
//!
//! There is no official specification for these structures. The layout here
//! follows Apple's open source `cs_blobs.h` from xnu.

use {
    crate::{code_directory::CodeDirectoryBlob, error::CodesignError},
    cryptographic_message_syntax::SignedData,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        collections::BTreeMap,
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Header magic values identifying blob payload types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobMagic {
    /// Single code requirement expression.
    Requirement,
    /// Set of code requirements, keyed by requirement type.
    RequirementSet,
    /// Code directory.
    CodeDirectory,
    /// Embedded signature superblob.
    EmbeddedSignature,
    /// XML entitlements.
    Entitlements,
    /// DER encoded entitlements.
    EntitlementsDer,
    /// Generic wrapper. Used for the CMS signature slot.
    BlobWrapper,
    /// Unrecognized magic.
    Unknown(u32),
}

impl From<u32> for BlobMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<BlobMagic> for u32 {
    fn from(magic: BlobMagic) -> u32 {
        match magic {
            BlobMagic::Requirement => 0xfade0c00,
            BlobMagic::RequirementSet => 0xfade0c01,
            BlobMagic::CodeDirectory => 0xfade0c02,
            BlobMagic::EmbeddedSignature => 0xfade0cc0,
            BlobMagic::Entitlements => 0xfade7171,
            BlobMagic::EntitlementsDer => 0xfade7172,
            BlobMagic::BlobWrapper => 0xfade0b01,
            BlobMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within embedded signature data.
///
/// Slot numbering determines both the index position of special digests in
/// the code directory and the canonical ordering of blobs in a superblob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    Signature,
    Unknown(u32),
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// Whether digests for this slot can appear in a code directory's
    /// special digest array.
    pub fn is_special_digest_expressible(&self) -> bool {
        u32::from(*self) >= 1 && u32::from(*self) < 0x1000
    }

    /// Whether this slot holds an alternate code directory.
    pub fn is_alternate_code_directory(&self) -> bool {
        (0x1000..0x1005).contains(&u32::from(*self))
    }
}

/// Requirement types within a requirement set blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(v: RequirementType) -> Self {
        match v {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

/// A digest algorithm used within code signature data structures.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha256Truncated => f.write_str("sha256-truncated"),
            Self::Sha384 => f.write_str("sha384"),
            Self::Sha512 => f.write_str("sha512"),
            Self::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl DigestType {
    /// The size in bytes of digests produced by this algorithm.
    pub fn digest_len(&self) -> Result<usize, CodesignError> {
        Ok(self.digest_data(&[])?.len())
    }

    /// Obtain a hashing context for this algorithm.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, CodesignError> {
        match self {
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::None | Self::Unknown(_) => Err(CodesignError::DigestUnknownAlgorithm),
        }
    }

    /// Digest a buffer with this algorithm.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, CodesignError> {
        let mut hasher = self.as_hasher()?;
        hasher.update(data);
        let mut digest = hasher.finish().as_ref().to_vec();

        // Truncated SHA-256 is SHA-256 with only the first 20 bytes retained,
        // making it the same width as SHA-1.
        if matches!(self, Self::Sha256Truncated) {
            digest.truncate(20);
        }

        Ok(digest)
    }
}

/// A digest value within code signature data.
#[derive(Clone, PartialEq, Eq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether this is the null digest (all zeroes).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Read a blob header, returning (magic, declared length, payload).
///
/// The declared length includes the 8 byte header.
fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), scroll::Error> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize, &data[8..]))
}

pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], CodesignError> {
    let (magic, _, payload) = read_blob_header(data)?;

    if magic != expected_magic {
        Err(CodesignError::BadMagic(what))
    } else {
        Ok(payload)
    }
}

/// Serialize a collection of (slot, blob bytes) pairs into superblob bytes.
///
/// Blob offsets in the index are assigned in iteration order. Callers are
/// expected to iterate slots in ascending numeric order so verifiers relying
/// on positional convention succeed.
pub fn create_superblob<'a>(
    magic: BlobMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, CodesignError> {
    let blobs = blobs.collect::<Vec<_>>();

    let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

    // Superblob header is magic + total length + blob count, then an index
    // of 8 byte entries.
    let mut total_length: u32 = 4 + 4 + 4;
    total_length += 8 * blobs.len() as u32;

    let mut indices = Vec::with_capacity(blobs.len());
    let mut payloads = Vec::with_capacity(blobs.len());

    for (slot, blob) in blobs {
        indices.push(BlobIndex {
            slot: u32::from(*slot),
            offset: total_length,
        });
        total_length += blob.len() as u32;
        payloads.push(blob);
    }

    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length, scroll::BE)?;
    cursor.iowrite_with(indices.len() as u32, scroll::BE)?;
    for index in indices {
        cursor.iowrite_with(index.slot, scroll::BE)?;
        cursor.iowrite_with(index.offset, scroll::BE)?;
    }
    for payload in payloads {
        cursor.write_all(payload)?;
    }

    Ok(cursor.into_inner())
}

#[repr(C)]
#[derive(Clone, Pread)]
struct BlobIndex {
    /// Corresponds to a [CodeSigningSlot] variant.
    slot: u32,
    offset: u32,
}

/// A single blob as located by a superblob index entry.
///
/// The payload is unparsed here. Use [BlobEntry::into_parsed_blob] to
/// interpret it.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Index of this blob within the superblob.
    pub index: usize,

    /// The slot this blob occupies.
    pub slot: CodeSigningSlot,

    /// Start offset of this blob within the superblob.
    pub offset: usize,

    /// Magic value at the start of the blob.
    pub magic: BlobMagic,

    /// Declared length of the blob, header included.
    pub length: usize,

    /// Raw blob data, header included.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("magic", &self.magic)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    pub fn into_parsed_blob(self) -> Result<ParsedBlob<'a>, CodesignError> {
        self.try_into()
    }

    /// Obtain the payload without the 8 byte blob header.
    pub fn payload(&self) -> Result<&'a [u8], CodesignError> {
        Ok(read_blob_header(self.data)?.2)
    }

    /// Digest the raw blob content (header included) with an algorithm.
    pub fn digest_with(&self, digest_type: DigestType) -> Result<Vec<u8>, CodesignError> {
        digest_type.digest_data(self.data)
    }
}

/// Common behavior for parsed blob types.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic identifying this blob format.
    fn magic() -> u32;

    /// Parse an instance from bytes starting with the 8 byte blob header.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError>;

    /// Serialize the blob payload, excluding the header.
    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError>;

    /// Serialize the full blob, header included.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodesignError> {
        let mut res = Vec::new();
        res.iowrite_with(Self::magic(), scroll::BE)?;

        let payload = self.serialize_payload()?;
        // Declared length includes the header itself.
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
        res.extend(payload);

        Ok(res)
    }

    /// Digest the serialized blob with an algorithm.
    fn digest_with(&self, digest_type: DigestType) -> Result<Vec<u8>, CodesignError> {
        digest_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// A single code requirement expression, carried as opaque compiled bytes.
///
/// `csreq -b` emits this format, header included. We do not interpret the
/// expression opcodes.
pub struct RequirementBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic() -> u32 {
        u32::from(BlobMagic::Requirement)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for RequirementBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("RequirementBlob({})", hex::encode(&self.data)))
    }
}

impl<'a> RequirementBlob<'a> {
    pub fn to_owned(&self) -> RequirementBlob<'static> {
        RequirementBlob {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }
}

/// A set of requirement blobs keyed by requirement type.
///
/// Uses an ordered map so serialization is deterministic.
#[derive(Debug, Default)]
pub struct RequirementSetBlob<'a> {
    pub requirements: BTreeMap<RequirementType, RequirementBlob<'a>>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        u32::from(BlobMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;

        // After the header, a u32 count then (type, offset) u32 pairs.
        let offset = &mut 8;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let mut indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            indices.push((
                data.gread_with::<u32>(offset, scroll::BE)?,
                data.gread_with::<u32>(offset, scroll::BE)?,
            ));
        }

        let mut requirements = BTreeMap::new();

        for (i, (typ, offset)) in indices.iter().enumerate() {
            let end_offset = if i == indices.len() - 1 {
                data.len()
            } else {
                indices[i + 1].1 as usize
            };

            if *offset as usize >= data.len() || end_offset > data.len() {
                return Err(CodesignError::SuperblobMalformed);
            }

            let requirement_data = &data[*offset as usize..end_offset];
            requirements.insert(
                RequirementType::from(*typ),
                RequirementBlob::from_blob_bytes(requirement_data)?,
            );
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        let mut res = Vec::new();

        // Offsets in the index are relative to the blob start, so account for
        // the header plus the index itself.
        let data_start_offset = 8 + 4 + (8 * self.requirements.len() as u32);
        let mut written = 0;

        res.iowrite_with(self.requirements.len() as u32, scroll::BE)?;

        for (typ, requirement) in &self.requirements {
            res.iowrite_with(u32::from(*typ), scroll::BE)?;
            res.iowrite_with(data_start_offset + written, scroll::BE)?;
            written += requirement.to_blob_bytes()?.len() as u32;
        }

        for requirement in self.requirements.values() {
            res.write_all(&requirement.to_blob_bytes()?)?;
        }

        Ok(res)
    }
}

impl<'a> RequirementSetBlob<'a> {
    pub fn to_owned(&self) -> RequirementSetBlob<'static> {
        RequirementSetBlob {
            requirements: self
                .requirements
                .iter()
                .map(|(typ, blob)| (*typ, blob.to_owned()))
                .collect(),
        }
    }

    pub fn set_requirements(&mut self, typ: RequirementType, blob: RequirementBlob<'a>) {
        self.requirements.insert(typ, blob);
    }
}

/// XML plist entitlements.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(BlobMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(CodesignError::EntitlementsBadUtf8)?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Construct an instance from a plist XML string.
    pub fn from_string(s: &(impl ToString + ?Sized)) -> Self {
        Self {
            plist: s.to_string().into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

impl<'a> Display for EntitlementsBlob<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.plist)
    }
}

/// DER encoded entitlements.
#[derive(Debug)]
pub struct EntitlementsDerBlob<'a> {
    der: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for EntitlementsDerBlob<'a> {
    fn magic() -> u32 {
        u32::from(BlobMagic::EntitlementsDer)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        let der = read_and_validate_blob_header(data, Self::magic(), "DER entitlements blob")?;

        Ok(Self { der: der.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        Ok(self.der.to_vec())
    }
}

impl<'a> EntitlementsDerBlob<'a> {
    /// DER encode a plist value into an instance.
    ///
    /// Not all plist value types are DER encodable. Encoding is performed
    /// immediately, so illegal values error here. The outermost value should
    /// be a dictionary.
    pub fn from_plist(v: &plist::Value) -> Result<Self, CodesignError> {
        let der = crate::entitlements::der_encode_entitlements_plist(v)?;

        Ok(Self { der: der.into() })
    }
}

/// Generic blob wrapper. The CMS signature is carried in this type.
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(BlobMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(&self.data)))
    }
}

impl<'a> BlobWrapperBlob<'a> {
    pub fn from_data_borrowed(data: &'a [u8]) -> BlobWrapperBlob<'a> {
        Self { data: data.into() }
    }
}

impl BlobWrapperBlob<'static> {
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        Self { data: data.into() }
    }
}

/// A blob whose magic we don't recognize.
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: &'a [u8],
}

impl<'a> Blob<'a> for OtherBlob<'a> {
    fn magic() -> u32 {
        // There is no static magic for this type. Serialization uses the
        // stored magic instead.
        u32::MAX
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        let (magic, _, data) = read_blob_header(data)?;

        Ok(Self { magic, data })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        Ok(self.data.to_vec())
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodesignError> {
        let mut res = Vec::with_capacity(self.data.len() + 8);
        res.iowrite_with(self.magic, scroll::BE)?;
        res.iowrite_with(self.data.len() as u32 + 8, scroll::BE)?;
        res.write_all(self.data)?;

        Ok(res)
    }
}

impl<'a> std::fmt::Debug for OtherBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(self.data)))
    }
}

/// A parsed blob, dispatched by magic.
#[derive(Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    EntitlementsDer(Box<EntitlementsDerBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> Blob<'a> for BlobData<'a> {
    fn magic() -> u32 {
        u32::MAX
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        let (magic, length, _) = read_blob_header(data)?;

        if length > data.len() {
            return Err(CodesignError::SuperblobMalformed);
        }
        let data = &data[0..length];

        Ok(match BlobMagic::from(magic) {
            BlobMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            BlobMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            BlobMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            BlobMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            BlobMagic::EntitlementsDer => {
                Self::EntitlementsDer(Box::new(EntitlementsDerBlob::from_blob_bytes(data)?))
            }
            BlobMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        match self {
            Self::Requirement(b) => b.serialize_payload(),
            Self::RequirementSet(b) => b.serialize_payload(),
            Self::CodeDirectory(b) => b.serialize_payload(),
            Self::Entitlements(b) => b.serialize_payload(),
            Self::EntitlementsDer(b) => b.serialize_payload(),
            Self::BlobWrapper(b) => b.serialize_payload(),
            Self::Other(b) => b.serialize_payload(),
        }
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, CodesignError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::RequirementSet(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::EntitlementsDer(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }
}

impl<'a> From<RequirementBlob<'a>> for BlobData<'a> {
    fn from(b: RequirementBlob<'a>) -> Self {
        Self::Requirement(Box::new(b))
    }
}

impl<'a> From<RequirementSetBlob<'a>> for BlobData<'a> {
    fn from(b: RequirementSetBlob<'a>) -> Self {
        Self::RequirementSet(Box::new(b))
    }
}

impl<'a> From<CodeDirectoryBlob<'a>> for BlobData<'a> {
    fn from(b: CodeDirectoryBlob<'a>) -> Self {
        Self::CodeDirectory(Box::new(b))
    }
}

impl<'a> From<EntitlementsBlob<'a>> for BlobData<'a> {
    fn from(b: EntitlementsBlob<'a>) -> Self {
        Self::Entitlements(Box::new(b))
    }
}

impl<'a> From<EntitlementsDerBlob<'a>> for BlobData<'a> {
    fn from(b: EntitlementsDerBlob<'a>) -> Self {
        Self::EntitlementsDer(Box::new(b))
    }
}

impl<'a> From<BlobWrapperBlob<'a>> for BlobData<'a> {
    fn from(b: BlobWrapperBlob<'a>) -> Self {
        Self::BlobWrapper(Box::new(b))
    }
}

impl<'a> From<OtherBlob<'a>> for BlobData<'a> {
    fn from(b: OtherBlob<'a>) -> Self {
        Self::Other(Box::new(b))
    }
}

/// The parsed content of a blob entry.
#[derive(Debug)]
pub struct ParsedBlob<'a> {
    /// The superblob entry this blob came from.
    pub blob_entry: BlobEntry<'a>,

    /// The parsed blob data.
    pub blob: BlobData<'a>,
}

impl<'a> ParsedBlob<'a> {
    pub fn digest_with(&self, digest_type: DigestType) -> Result<Vec<u8>, CodesignError> {
        digest_type.digest_data(self.blob_entry.data)
    }
}

impl<'a> TryFrom<BlobEntry<'a>> for ParsedBlob<'a> {
    type Error = CodesignError;

    fn try_from(blob_entry: BlobEntry<'a>) -> Result<Self, Self::Error> {
        let blob = BlobData::from_blob_bytes(blob_entry.data)?;

        Ok(Self { blob_entry, blob })
    }
}

/// A lightly parsed embedded signature superblob.
pub struct EmbeddedSignature<'a> {
    /// Magic value from the superblob header.
    pub magic: BlobMagic,
    /// Total declared length of the superblob.
    pub length: u32,
    /// Number of blobs within.
    pub count: u32,

    /// Raw data backing this superblob.
    pub data: &'a [u8],

    /// Entries for the blobs within.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EmbeddedSignature")
            .field("magic", &self.magic)
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Parse an embedded signature superblob from bytes.
    ///
    /// The input is typically the slice of `__LINKEDIT` that the
    /// `LC_CODE_SIGNATURE` load command points at.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodesignError> {
        let offset = &mut 0;

        let magic: BlobMagic = data.gread_with::<u32>(offset, scroll::BE)?.into();
        if magic != BlobMagic::EmbeddedSignature {
            return Err(CodesignError::BadMagic("embedded signature superblob"));
        }

        let length = data.gread_with(offset, scroll::BE)?;
        let count = data.gread_with(offset, scroll::BE)?;

        let mut blob_indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            blob_indices.push(data.gread_with::<BlobIndex>(offset, scroll::BE)?);
        }

        let mut blobs = Vec::with_capacity(blob_indices.len());

        for (i, index) in blob_indices.iter().enumerate() {
            let end_offset = if i == blob_indices.len() - 1 {
                data.len()
            } else {
                blob_indices[i + 1].offset as usize
            };

            if index.offset as usize >= data.len() || end_offset > data.len() {
                return Err(CodesignError::SuperblobMalformed);
            }

            let full_slice = &data[index.offset as usize..end_offset];
            let (magic, blob_length, _) = read_blob_header(full_slice)?;

            // The self-declared length can't exceed the slice computed from
            // the index, which would indicate an invalid advertisement.
            let blob_data = match blob_length.cmp(&full_slice.len()) {
                Ordering::Greater => {
                    return Err(CodesignError::SuperblobMalformed);
                }
                Ordering::Equal => full_slice,
                Ordering::Less => &full_slice[0..blob_length],
            };

            blobs.push(BlobEntry {
                index: i,
                slot: index.slot.into(),
                offset: index.offset as usize,
                magic: magic.into(),
                length: blob_length,
                data: blob_data,
            });
        }

        Ok(Self {
            magic,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Find the first blob occupying a slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    pub fn find_slot_parsed(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<ParsedBlob<'a>>, CodesignError> {
        if let Some(entry) = self.find_slot(slot) {
            Ok(Some(entry.clone().into_parsed_blob()?))
        } else {
            Ok(None)
        }
    }

    /// Resolve the primary code directory, if present.
    pub fn code_directory(&self) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, CodesignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::CodeDirectory)? {
            if let BlobData::CodeDirectory(cd) = parsed.blob {
                Ok(Some(cd))
            } else {
                Err(CodesignError::BadMagic("code directory blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Resolve all code directories, primary and alternates.
    pub fn all_code_directories(
        &self,
    ) -> Result<Vec<Box<CodeDirectoryBlob<'a>>>, CodesignError> {
        let mut res = Vec::new();

        for entry in &self.blobs {
            if entry.slot == CodeSigningSlot::CodeDirectory
                || entry.slot.is_alternate_code_directory()
            {
                if let BlobData::CodeDirectory(cd) = entry.clone().into_parsed_blob()?.blob {
                    res.push(cd);
                }
            }
        }

        Ok(res)
    }

    /// Resolve the code directory whose digest type matches, if any.
    pub fn code_directory_for_digest(
        &self,
        digest_type: DigestType,
    ) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, CodesignError> {
        Ok(self
            .all_code_directories()?
            .into_iter()
            .find(|cd| cd.digest_type == digest_type))
    }

    /// Resolve parsed XML entitlements, if present.
    pub fn entitlements(&self) -> Result<Option<Box<EntitlementsBlob<'a>>>, CodesignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::Entitlements)? {
            if let BlobData::Entitlements(entitlements) = parsed.blob {
                Ok(Some(entitlements))
            } else {
                Err(CodesignError::BadMagic("entitlements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Resolve the parsed requirement set, if present.
    pub fn code_requirements(
        &self,
    ) -> Result<Option<Box<RequirementSetBlob<'a>>>, CodesignError> {
        if let Some(parsed) = self.find_slot_parsed(CodeSigningSlot::RequirementSet)? {
            if let BlobData::RequirementSet(reqs) = parsed.blob {
                Ok(Some(reqs))
            } else {
                Err(CodesignError::BadMagic("requirements blob"))
            }
        } else {
            Ok(None)
        }
    }

    /// Resolve raw CMS signature data from the signature slot.
    ///
    /// Ad-hoc signatures carry a zero length payload here.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, CodesignError> {
        if let Some(entry) = self.find_slot(CodeSigningSlot::Signature) {
            ParsedBlob::try_from(entry.clone())?;

            Ok(Some(entry.payload()?))
        } else {
            Ok(None)
        }
    }

    /// Obtain the parsed CMS [SignedData] from the signature slot.
    ///
    /// Returns `Ok(None)` for ad-hoc signatures, whose signature slot is
    /// empty.
    pub fn signed_data(&self) -> Result<Option<SignedData>, CodesignError> {
        if let Some(data) = self.signature_data()? {
            if data.is_empty() {
                Ok(None)
            } else {
                Ok(Some(SignedData::parse_ber(data)?))
            }
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblob_roundtrip() {
        let entitlements = EntitlementsBlob::from_string("<plist/>");
        let wrapper = BlobWrapperBlob::from_data_owned(vec![]);

        let blobs = vec![
            (
                CodeSigningSlot::Entitlements,
                entitlements.to_blob_bytes().unwrap(),
            ),
            (CodeSigningSlot::Signature, wrapper.to_blob_bytes().unwrap()),
        ];

        let data = create_superblob(BlobMagic::EmbeddedSignature, blobs.iter()).unwrap();

        let parsed = EmbeddedSignature::from_bytes(&data).unwrap();
        assert_eq!(parsed.count, 2);
        assert_eq!(parsed.length as usize, data.len());

        // Index offsets are monotonic and every blob accounted for.
        let mut last_offset = 0;
        for blob in &parsed.blobs {
            assert!(blob.offset > last_offset);
            last_offset = blob.offset;
        }

        let entitlements = parsed.entitlements().unwrap().unwrap();
        assert_eq!(entitlements.as_str(), "<plist/>");

        let signature = parsed.signature_data().unwrap().unwrap();
        assert!(signature.is_empty());
        assert!(parsed.signed_data().unwrap().is_none());
    }

    #[test]
    fn blob_header_magic_mismatch() {
        let entitlements = EntitlementsBlob::from_string("<plist/>");
        let data = entitlements.to_blob_bytes().unwrap();

        assert!(matches!(
            RequirementBlob::from_blob_bytes(&data),
            Err(CodesignError::BadMagic(_))
        ));
    }

    #[test]
    fn requirement_set_roundtrip() {
        let mut blob = RequirementSetBlob::default();
        blob.set_requirements(
            RequirementType::Designated,
            RequirementBlob {
                data: vec![0xde, 0xad].into(),
            },
        );
        blob.set_requirements(
            RequirementType::Host,
            RequirementBlob {
                data: vec![0xbe, 0xef].into(),
            },
        );

        let data = blob.to_blob_bytes().unwrap();
        let parsed = RequirementSetBlob::from_blob_bytes(&data).unwrap();

        assert_eq!(parsed.requirements.len(), 2);
        assert_eq!(
            parsed.requirements[&RequirementType::Designated].data.as_ref(),
            &[0xde, 0xad]
        );

        // Serialization is deterministic.
        assert_eq!(parsed.to_blob_bytes().unwrap(), data);
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(DigestType::Sha1.digest_len().unwrap(), 20);
        assert_eq!(DigestType::Sha256.digest_len().unwrap(), 32);
        assert_eq!(DigestType::Sha256Truncated.digest_len().unwrap(), 20);
        assert_eq!(DigestType::Sha384.digest_len().unwrap(), 48);
        assert!(DigestType::None.digest_len().is_err());
    }

    #[test]
    fn slot_ordering() {
        let mut slots = vec![
            CodeSigningSlot::Signature,
            CodeSigningSlot::Entitlements,
            CodeSigningSlot::AlternateCodeDirectory0,
            CodeSigningSlot::CodeDirectory,
            CodeSigningSlot::RequirementSet,
        ];
        slots.sort();

        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::CodeDirectory,
                CodeSigningSlot::RequirementSet,
                CodeSigningSlot::Entitlements,
                CodeSigningSlot::AlternateCodeDirectory0,
                CodeSigningSlot::Signature,
            ]
        );
    }
}
