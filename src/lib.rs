// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded code signature generation for Mach-O binaries.
//!
//! This crate implements application code signing for Apple executable
//! formats without depending on Apple hardware or tooling: it can produce
//! and inspect the embedded signature superblobs that Apple operating
//! systems verify at load time.
//!
//! # Features and Capabilities
//!
//! * Locate and deeply parse code signature data in Mach-O binaries, both
//!   thin and fat/universal. (See the [Signable] trait and
//!   [EmbeddedSignature].)
//! * Produce ad-hoc (keyless) signatures that seal binary content with
//!   page-granularity digests but carry no authorship attestation. (See
//!   [sign_macho_adhoc].)
//! * Produce cryptographic signatures wrapping the code directory digest in
//!   a CMS `SignedData` structure with a supplied certificate and private
//!   key, for every Mach-O binary in an application bundle, with progress
//!   reporting and cancellation. (See [BundleSigningRequest].)
//! * Inspect PKCS#12 credentials: organizational unit (team identifier) and
//!   validity window extraction, with side-effect-free validity checking.
//!   (See [Credential].)
//! * Parse CMS-signed provisioning profiles, verifying their signature
//!   before exposing payload content, and derive the team identifier from
//!   embedded entitlements. (See [ProvisioningProfile].)
//!
//! Deliberately out of scope: notarization, resource sealing
//! (`CodeResources`), Info.plist rewriting, keychain integration, and the
//! code requirement expression language (requirement blobs are carried as
//! opaque compiled bytes).
//!
//! # Verification caveat
//!
//! This crate verifies digests and cryptographic signatures it produces or
//! parses. It does not reimplement the full rule set Apple's operating
//! systems apply when admitting a binary for execution; validate output
//! against Apple tooling when that matters.

mod code_directory;
pub use code_directory::*;
mod code_hash;
pub use code_hash::*;
mod credential;
pub use credential::*;
pub mod embedded_signature;
pub use embedded_signature::*;
mod embedded_signature_builder;
pub use embedded_signature_builder::*;
pub mod entitlements;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
mod macho_signing;
pub use macho_signing::*;
mod provisioning;
pub use provisioning::*;
mod signing;
pub use signing::*;
mod signing_settings;
pub use signing_settings::*;
#[cfg(test)]
mod testutil;
