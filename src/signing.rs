// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! High level signing operations.

Two entry points are provided:

* [sign_macho_adhoc] seals a single Mach-O binary with a keyless (ad-hoc)
  signature, in place and atomically.
* [BundleSigningRequest] signs every Mach-O binary inside an application
  bundle with a cryptographic credential, reporting fractional progress and
  honoring cancellation between binaries.

Individual file rewrites are staged to a temporary file in the target's
directory and renamed over the original, so a failed or cancelled operation
never leaves a partially written binary. Bundle signing is not atomic as a
batch: binaries signed before a failure stay signed, and callers should
treat a failed batch as requiring a fresh retry of the whole bundle.
*/

use {
    crate::{
        code_directory::ExecutableSegmentFlags, credential::Credential, error::CodesignError,
        macho_signing::MachOSigner, signing_settings::SigningSettings,
    },
    log::{info, warn},
    std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
    },
    zeroize::Zeroizing,
};

/// Magic prefixes identifying Mach-O files on disk.
const MACHO_MAGICS: &[[u8; 4]] = &[
    // Fat/universal header (big-endian on disk).
    [0xca, 0xfe, 0xba, 0xbe],
    // Thin 64-bit and 32-bit, little-endian hosts.
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xce, 0xfa, 0xed, 0xfe],
    // Thin 64-bit and 32-bit, big-endian hosts.
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xfe, 0xed, 0xfa, 0xce],
];

/// Cooperative cancellation flag shared between a caller and an operation.
///
/// Cancellation is checked at defined checkpoints (between binaries), never
/// by interrupting work mid-computation.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<(), CodesignError> {
        if self.is_cancelled() {
            Err(CodesignError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sign a Mach-O file with the given settings, rewriting it in place.
///
/// The signed output is written to a temporary file in the same directory
/// and atomically renamed over the original. On any failure the original
/// file is untouched.
fn sign_macho_file(path: &Path, settings: &SigningSettings) -> Result<(), CodesignError> {
    let macho_data = std::fs::read(path)?;

    let signer = MachOSigner::new(&macho_data)?;

    let parent = path
        .parent()
        .ok_or_else(|| CodesignError::InvalidBinary("path has no parent directory".into()))?;

    let permissions = std::fs::metadata(path)?.permissions();

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    signer.write_signed_binary(settings, temp.as_file_mut())?;

    temp.persist(path).map_err(|e| CodesignError::Io(e.error))?;
    std::fs::set_permissions(path, permissions)?;

    Ok(())
}

/// Ad-hoc sign a Mach-O binary in place.
///
/// The produced signature seals content integrity (tampering is detectable)
/// but carries no attestation of authorship: the signature slot is present
/// with a zero length payload.
///
/// `entitlements_xml` is an optional entitlements plist in XML form,
/// embedded verbatim and digested into the code directory.
pub fn sign_macho_adhoc(
    path: impl AsRef<Path>,
    bundle_id: &str,
    entitlements_xml: Option<&str>,
) -> Result<(), CodesignError> {
    let path = path.as_ref();

    let mut settings = SigningSettings::default();
    settings.set_binary_identifier(bundle_id);
    settings.set_executable_segment_flags(ExecutableSegmentFlags::MAIN_BINARY);

    if let Some(xml) = entitlements_xml {
        settings.set_entitlements_xml(xml)?;
    }

    info!("ad-hoc signing {} as {}", path.display(), bundle_id);
    sign_macho_file(path, &settings).map_err(|e| e.for_binary(path))
}

/// Locate Mach-O binaries within a bundle directory by magic sniffing.
///
/// Results are sorted so signing order (and progress reporting) is
/// deterministic.
pub fn find_bundle_macho_paths(bundle_path: &Path) -> Result<Vec<PathBuf>, CodesignError> {
    fn walk(dir: &Path, res: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                walk(&path, res)?;
            } else if file_type.is_file() {
                if let Ok(data) = std::fs::read(&path) {
                    if data.len() >= 4 && MACHO_MAGICS.iter().any(|m| data[0..4] == m[..]) {
                        res.push(path);
                    }
                }
            }
        }

        Ok(())
    }

    let mut res = Vec::new();
    walk(bundle_path, &mut res)?;
    res.sort();

    Ok(res)
}

/// Progress events emitted by a spawned [SigningTask].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SigningEvent {
    /// Fraction of binaries signed so far, in `(0, 1]`.
    Progress(f64),
}

/// A request to sign every Mach-O binary inside an application bundle.
pub struct BundleSigningRequest {
    bundle_path: PathBuf,
    credential: Credential,
    entitlements_xml: Option<String>,
}

impl BundleSigningRequest {
    /// Construct a request from an already-parsed credential.
    pub fn new(bundle_path: impl Into<PathBuf>, credential: Credential) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            credential,
            entitlements_xml: None,
        }
    }

    /// Construct a request from PKCS#12 credential bytes and a password.
    ///
    /// The credential is parsed and validity-checked immediately so callers
    /// fail fast on bad key material, before any file is touched. Secret
    /// inputs are zeroized when parsing completes.
    pub fn from_pfx(
        bundle_path: impl Into<PathBuf>,
        pfx_data: &[u8],
        password: &str,
    ) -> Result<Self, CodesignError> {
        let pfx_data = Zeroizing::new(pfx_data.to_vec());
        let password = Zeroizing::new(password.to_string());

        let credential = Credential::from_pfx(&pfx_data, &password)?;
        credential.check_validity()?;

        Ok(Self::new(bundle_path.into(), credential))
    }

    /// Set entitlements (XML plist) to embed into every signed binary.
    pub fn set_entitlements_xml(&mut self, xml: impl ToString) {
        self.entitlements_xml = Some(xml.to_string());
    }

    /// Sign the bundle synchronously.
    ///
    /// `progress` receives the completed fraction after each binary.
    /// Cancellation is honored at per-binary boundaries: already-signed
    /// binaries stay signed, the remainder are untouched, and
    /// [CodesignError::Cancelled] is returned.
    ///
    /// The first failing binary aborts the operation so the bundle is never
    /// silently left with a mix of old and new signatures unreported.
    pub fn sign(
        &self,
        mut progress: impl FnMut(f64),
        cancel: &CancellationToken,
    ) -> Result<(), CodesignError> {
        self.credential.check_validity()?;

        let paths = find_bundle_macho_paths(&self.bundle_path)?;
        if paths.is_empty() {
            return Err(CodesignError::BundleNoBinaries(self.bundle_path.clone()));
        }

        info!(
            "signing {} Mach-O binaries in {}",
            paths.len(),
            self.bundle_path.display()
        );

        let mut settings = SigningSettings::default();
        settings.set_signing_key(self.credential.key_pair(), self.credential.certificate().clone());

        if settings.set_team_id_from_signing_certificate().is_none() {
            warn!("signing certificate has no organizational unit; code directories will carry no team identifier");
        }

        if let Some(xml) = &self.entitlements_xml {
            settings.set_entitlements_xml(xml)?;
        }

        let total = paths.len();

        for (index, path) in paths.iter().enumerate() {
            cancel.checkpoint()?;

            let mut binary_settings = settings.clone();

            let identifier = path
                .file_stem()
                .unwrap_or_else(|| path.as_os_str())
                .to_string_lossy();
            binary_settings.set_binary_identifier(identifier.as_ref());

            if index == 0 {
                binary_settings
                    .set_executable_segment_flags(ExecutableSegmentFlags::MAIN_BINARY);
            }

            info!("signing {}", path.display());
            sign_macho_file(path, &binary_settings).map_err(|e| e.for_binary(path))?;

            progress((index + 1) as f64 / total as f64);
        }

        Ok(())
    }

    /// Sign the bundle on a background thread.
    ///
    /// Returns a [SigningTask] handle for observing progress, requesting
    /// cancellation, and collecting the terminal result.
    pub fn spawn(self) -> SigningTask {
        let cancel = CancellationToken::new();
        let (sender, events) = mpsc::channel();

        let thread_cancel = cancel.clone();
        let handle = std::thread::spawn(move || {
            self.sign(
                |fraction| {
                    // Receiver may have been dropped; progress is advisory.
                    let _ = sender.send(SigningEvent::Progress(fraction));
                },
                &thread_cancel,
            )
        });

        SigningTask {
            cancel,
            events,
            handle,
        }
    }
}

/// Handle to an in-flight bundle signing operation.
pub struct SigningTask {
    cancel: CancellationToken,
    events: mpsc::Receiver<SigningEvent>,
    handle: std::thread::JoinHandle<Result<(), CodesignError>>,
}

impl SigningTask {
    /// Request cancellation at the next per-binary boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The stream of progress events.
    pub fn events(&self) -> &mpsc::Receiver<SigningEvent> {
        &self.events
    }

    /// Wait for the operation to finish and obtain its result.
    pub fn wait(self) -> Result<(), CodesignError> {
        self.handle
            .join()
            .map_err(|_| CodesignError::SignatureBuilder("signing task panicked"))?
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            code_directory::CodeSignatureFlags,
            macho::{parse_macho_images, Signable},
            testutil::MachOBuilder,
        },
        x509_certificate::{KeyAlgorithm, X509CertificateBuilder},
    };

    fn test_credential() -> Credential {
        let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ed25519);
        builder
            .subject()
            .append_common_name_utf8_string("Bundle Signer")
            .unwrap();
        builder
            .subject()
            .append_organizational_unit_utf8_string("TESTTEAM01")
            .unwrap();
        builder.validity_duration(chrono::Duration::hours(1));

        let (cert, key_pair, _) = builder.create_with_random_keypair().unwrap();
        Credential::from_parts(cert, key_pair)
    }

    fn write_test_bundle(dir: &Path, binaries: &[&str]) {
        for name in binaries {
            std::fs::write(dir.join(name), MachOBuilder::new_aarch64().build()).unwrap();
        }
        // Non Mach-O files are ignored by discovery.
        std::fs::write(dir.join("Info.plist"), b"<plist/>").unwrap();
    }

    fn assert_signed(path: &Path, expect_adhoc: bool) {
        let data = std::fs::read(path).unwrap();
        let images = parse_macho_images(&data).unwrap();

        for (_, macho) in images {
            let signature = macho.code_signature().unwrap().expect("signature present");
            let cd = signature.code_directory().unwrap().unwrap();

            assert_eq!(
                cd.flags.contains(CodeSignatureFlags::ADHOC),
                expect_adhoc
            );

            if expect_adhoc {
                assert_eq!(signature.signature_data().unwrap().unwrap().len(), 0);
            } else {
                let signed_data = signature.signed_data().unwrap().expect("CMS data present");
                for signer in signed_data.signers() {
                    signer
                        .verify_signature_with_signed_data(&signed_data)
                        .unwrap();
                }
            }
        }
    }

    #[test]
    fn adhoc_sign_in_place() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("app");
        std::fs::write(&path, MachOBuilder::new_aarch64().build()).unwrap();

        sign_macho_adhoc(&path, "com.example.app", None).unwrap();

        assert_signed(&path, true);

        let data = std::fs::read(&path).unwrap();
        let images = parse_macho_images(&data).unwrap();
        let cd = images[0]
            .1
            .code_signature()
            .unwrap()
            .unwrap()
            .code_directory()
            .unwrap()
            .unwrap();
        assert_eq!(cd.ident, "com.example.app");
    }

    #[test]
    fn adhoc_sign_failure_leaves_original_untouched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("not-macho");
        std::fs::write(&path, b"this is not a Mach-O binary").unwrap();

        assert!(sign_macho_adhoc(&path, "com.example.app", None).is_err());

        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"this is not a Mach-O binary"
        );
    }

    #[test]
    fn bundle_signing_with_progress() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_test_bundle(temp_dir.path(), &["MainApp", "helper"]);

        let request = BundleSigningRequest::new(temp_dir.path(), test_credential());

        let mut fractions = Vec::new();
        request
            .sign(|f| fractions.push(f), &CancellationToken::new())
            .unwrap();

        assert_eq!(fractions, vec![0.5, 1.0]);

        assert_signed(&temp_dir.path().join("MainApp"), false);
        assert_signed(&temp_dir.path().join("helper"), false);

        // Team identifier was derived from the certificate's OU.
        let data = std::fs::read(temp_dir.path().join("MainApp")).unwrap();
        let images = parse_macho_images(&data).unwrap();
        let cd = images[0]
            .1
            .code_signature()
            .unwrap()
            .unwrap()
            .code_directory()
            .unwrap()
            .unwrap();
        assert_eq!(cd.team_name.as_deref(), Some("TESTTEAM01"));
    }

    #[test]
    fn bundle_without_binaries_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("Info.plist"), b"<plist/>").unwrap();

        let request = BundleSigningRequest::new(temp_dir.path(), test_credential());

        assert!(matches!(
            request.sign(|_| {}, &CancellationToken::new()),
            Err(CodesignError::BundleNoBinaries(_))
        ));
    }

    #[test]
    fn cancellation_between_binaries() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_test_bundle(temp_dir.path(), &["AAA", "BBB"]);

        let original_second = std::fs::read(temp_dir.path().join("BBB")).unwrap();

        let request = BundleSigningRequest::new(temp_dir.path(), test_credential());
        let cancel = CancellationToken::new();

        // Cancel as soon as the first binary completes.
        let cancel_from_progress = cancel.clone();
        let result = request.sign(|_| cancel_from_progress.cancel(), &cancel);

        assert!(matches!(result, Err(CodesignError::Cancelled)));

        // First binary signed, second untouched.
        assert_signed(&temp_dir.path().join("AAA"), false);
        assert_eq!(
            std::fs::read(temp_dir.path().join("BBB")).unwrap(),
            original_second
        );
    }

    #[test]
    fn spawned_task_reports_progress_and_result() {
        let temp_dir = tempfile::tempdir().unwrap();
        write_test_bundle(temp_dir.path(), &["MainApp"]);

        let request = BundleSigningRequest::new(temp_dir.path(), test_credential());
        let task = request.spawn();

        let events = task.events().iter().collect::<Vec<_>>();
        assert_eq!(events, vec![SigningEvent::Progress(1.0)]);

        task.wait().unwrap();
        assert_signed(&temp_dir.path().join("MainApp"), false);
    }

    #[test]
    fn macho_discovery_ignores_other_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let nested = temp_dir.path().join("Frameworks");
        std::fs::create_dir(&nested).unwrap();

        std::fs::write(temp_dir.path().join("MainApp"), MachOBuilder::new_aarch64().build())
            .unwrap();
        std::fs::write(nested.join("Helper"), MachOBuilder::new_x86_64().build()).unwrap();
        std::fs::write(temp_dir.path().join("README"), b"hello").unwrap();

        let paths = find_bundle_macho_paths(temp_dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.file_name().unwrap() != "README"));
    }
}
