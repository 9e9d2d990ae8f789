//! [`CryptoProvider`] backed by the system `gpg` binary.
//!
//! Every operation is one `gpg --batch` invocation with data on stdin and the
//! result on stdout. Outcomes are read from gpg's machine-readable status
//! lines (`--status-fd 2`) rather than its human messages.
//!
//! When a passphrase is configured it is written as the first line of stdin
//! (`--passphrase-fd 0 --pinentry-mode loopback`); gpg consumes that line
//! before reading any data. Without one, unlocking is left to gpg-agent.
//!
//! gpg decrypts with whichever secret key in the keyring matches, so
//! [`decrypt`](CryptoProvider::decrypt) checks the `DECRYPTION_KEY` status
//! line against the requested key id before returning any plaintext.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use oak_auth::identity::{KeyId, SecretBytes};
use oak_auth::provider::{CryptoProvider, Opened, ProviderError};
use regex::Regex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Prefix of every status line.
const STATUS_PREFIX: &str = "[GNUPG:] ";

/// How often a running gpg is checked against its deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wraps a `gpg` installation.
pub struct GpgProvider {
    program: PathBuf,
    homedir: Option<PathBuf>,
    passphrase: Option<Zeroizing<String>>,
    timeout: Option<Duration>,
}

impl GpgProvider {
    /// Use `program` (e.g. `gpg` or `/usr/bin/gpg2`) with its default home.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            homedir: None,
            passphrase: None,
            timeout: None,
        }
    }

    /// Use a dedicated keyring directory.
    #[must_use]
    pub fn with_homedir(mut self, homedir: impl Into<PathBuf>) -> Self {
        self.homedir = Some(homedir.into());
        self
    }

    /// Unlock secret keys with `passphrase` instead of asking gpg-agent.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }

    /// Kill any gpg invocation still running after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn run(
        &self,
        args: &[&str],
        passphrase: Option<&str>,
        input: &[u8],
    ) -> Result<GpgOutput, ProviderError> {
        let mut command = Command::new(&self.program);
        command.args(["--batch", "--yes", "--no-tty", "--status-fd", "2"]);
        if let Some(homedir) = &self.homedir {
            command.arg("--homedir").arg(homedir);
        }
        if passphrase.is_some() {
            command.args(["--pinentry-mode", "loopback", "--passphrase-fd", "0"]);
        }
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::Unavailable(format!("{} not found", self.program.display()))
            } else {
                ProviderError::Unavailable(format!("failed to start {}: {e}", self.program.display()))
            }
        })?;

        let mut stdin_bytes = Zeroizing::new(Vec::with_capacity(input.len() + 64));
        if let Some(passphrase) = passphrase {
            stdin_bytes.extend_from_slice(passphrase.as_bytes());
            stdin_bytes.push(b'\n');
        }
        stdin_bytes.extend_from_slice(input);

        // Pipes are serviced on their own threads so a full one can't
        // deadlock us while we wait on the child.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Backend("gpg stdin unavailable".into()))?;
        let writer = thread::spawn(move || stdin.write_all(&stdin_bytes));
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.timeout {
            Some(timeout) => wait_with_deadline(&mut child, timeout),
            None => child
                .wait()
                .map_err(|e| ProviderError::Backend(format!("gpg did not finish: {e}"))),
        };
        // gpg may exit before reading all input (e.g. on a bad key); that's
        // reported through the exit status, not the broken pipe.
        let _ = writer.join();
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let status = status?;

        debug!(args = ?args, status = ?status.code(), "gpg finished");
        Ok(GpgOutput {
            success: status.success(),
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Whether the session key of a successful decryption came from `key_id`.
    fn sealed_for(&self, key_id: &KeyId, stderr: &str) -> Result<bool, ProviderError> {
        let used = parse_decryption_key(stderr);
        if let Some((_, primary)) = used {
            if primary.eq_ignore_ascii_case(key_id.as_str()) {
                return Ok(true);
            }
        }

        // `key_id` may not be a primary fingerprint; resolve it.
        let owned = self.fingerprints(key_id)?;
        let owns = |fpr: &str| owned.iter().any(|own| own.eq_ignore_ascii_case(fpr));
        Ok(match used {
            Some((subkey, primary)) => owns(subkey) || owns(primary),
            // Older gpg without DECRYPTION_KEY: settle for being a recipient.
            None => parse_recipients(stderr)
                .iter()
                .any(|keyid| owned.iter().any(|own| ends_with_ignore_case(own, keyid))),
        })
    }

    /// Primary and subkey fingerprints of the key `key_id` names.
    fn fingerprints(&self, key_id: &KeyId) -> Result<Vec<String>, ProviderError> {
        let output = self.run(
            &[
                "--with-colons",
                "--with-subkey-fingerprint",
                "--list-keys",
                key_id.as_str(),
            ],
            None,
            &[],
        )?;
        if !output.success {
            return Ok(Vec::new());
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(parse_colon_fingerprints(&listing))
    }

    fn configured_passphrase(&self) -> Option<&str> {
        self.passphrase.as_ref().map(|p| p.as_str())
    }
}

impl std::fmt::Debug for GpgProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpgProvider")
            .field("program", &self.program)
            .field("homedir", &self.homedir)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[redacted]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for GpgProvider {
    fn default() -> Self {
        Self::new("gpg")
    }
}

struct GpgOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

impl GpgOutput {
    fn has_status(&self, keyword: &str) -> bool {
        status_lines(&self.stderr).any(|(kw, _)| kw == keyword)
    }

    fn failure(&self) -> String {
        let human: Vec<&str> = self
            .stderr
            .lines()
            .filter(|line| !line.starts_with(STATUS_PREFIX))
            .collect();
        human.join("; ").trim().to_string()
    }
}

impl CryptoProvider for GpgProvider {
    fn generate_keypair(&self, identity: &str, passphrase: &str) -> Result<KeyId, ProviderError> {
        if identity.trim().is_empty() || identity.contains(['<', '>', '\n']) {
            return Err(ProviderError::Backend(format!("invalid identity {identity:?}")));
        }
        let user_id = format!("OAK <{identity}>");
        let output = self.run(
            &["--quick-gen-key", &user_id, "default", "default"],
            Some(passphrase),
            &[],
        )?;
        if !output.success {
            return Err(ProviderError::Backend(output.failure()));
        }
        parse_generated_key_id(&output.stderr)
            .ok_or_else(|| ProviderError::Backend("could not find key id in gpg output".into()))
    }

    fn export_public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, ProviderError> {
        let output = self.run(&["--export", key_id.as_str()], None, &[])?;
        if !output.success {
            return Err(ProviderError::Backend(output.failure()));
        }
        if output.stdout.is_empty() {
            return Err(ProviderError::UnknownKey(key_id.clone()));
        }
        Ok(output.stdout)
    }

    fn import_public_key(&self, bytes: &[u8]) -> Result<KeyId, ProviderError> {
        let output = self.run(&["--import-options", "import-show", "--import"], None, bytes)?;
        if !output.success {
            return Err(ProviderError::MalformedKey(output.failure()));
        }
        parse_imported_key_id(&output.stderr, &String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| ProviderError::MalformedKey("no key found in import".into()))
    }

    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let output = self.run(
            &["--local-user", key_id.as_str(), "--output", "-", "--sign"],
            self.configured_passphrase(),
            data,
        )?;
        if output.success {
            return Ok(output.stdout);
        }
        Err(if output.has_status("INV_SGNR") {
            ProviderError::UnknownKey(key_id.clone())
        } else if output.has_status("NO_SECKEY") {
            ProviderError::MissingSecretKey(key_id.clone())
        } else if is_locked(&output) {
            ProviderError::Locked(key_id.clone())
        } else {
            ProviderError::Backend(output.failure())
        })
    }

    fn verify_or_decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Opened, ProviderError> {
        let output = self.run(&["--output", "-", "--decrypt"], None, data)?;

        if output.has_status("BADSIG") {
            return Err(ProviderError::SignatureMismatch);
        }
        if let Some(signer) = parse_valid_signer(&output.stderr) {
            if !signer.eq_ignore_ascii_case(key_id.as_str()) {
                let actual = KeyId::new(signer).map_err(|_| ProviderError::SignatureMismatch)?;
                return Err(ProviderError::IdentityMismatch {
                    expected: key_id.clone(),
                    actual,
                });
            }
            if !output.success {
                return Err(ProviderError::Backend(output.failure()));
            }
            return Ok(Opened {
                plaintext: SecretBytes::new(output.stdout),
                key_id: key_id.clone(),
                signed: true,
            });
        }

        if output.success && output.has_status("DECRYPTION_OKAY") {
            return Ok(Opened {
                plaintext: SecretBytes::new(output.stdout),
                key_id: key_id.clone(),
                signed: false,
            });
        }
        Err(if output.has_status("NO_PUBKEY") {
            ProviderError::UnknownKey(key_id.clone())
        } else if output.has_status("NODATA") || output.has_status("ERRSIG") {
            ProviderError::MalformedPayload
        } else {
            ProviderError::SignatureMismatch
        })
    }

    fn encrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let output = self.run(
            &[
                "--recipient",
                key_id.as_str(),
                "--trust-model",
                "always",
                "--output",
                "-",
                "--encrypt",
            ],
            None,
            data,
        )?;
        if output.success {
            return Ok(output.stdout);
        }
        Err(if output.has_status("INV_RECP") {
            ProviderError::UnknownKey(key_id.clone())
        } else {
            ProviderError::Backend(output.failure())
        })
    }

    fn decrypt(&self, key_id: &KeyId, data: &[u8]) -> Result<SecretBytes, ProviderError> {
        let output = self.run(
            &[
                "--try-secret-key",
                key_id.as_str(),
                "--output",
                "-",
                "--decrypt",
            ],
            self.configured_passphrase(),
            data,
        )?;
        if output.success && output.has_status("DECRYPTION_OKAY") {
            let plaintext = SecretBytes::new(output.stdout);
            if !self.sealed_for(key_id, &output.stderr)? {
                debug!(key_id = %key_id, "challenge sealed for another key in the keyring");
                return Err(ProviderError::NotForThisKey);
            }
            return Ok(plaintext);
        }
        Err(if is_locked(&output) {
            ProviderError::Locked(key_id.clone())
        } else if output.has_status("NO_SECKEY")
            || output.has_status("DECRYPTION_FAILED")
            || output.has_status("NODATA")
        {
            ProviderError::NotForThisKey
        } else {
            ProviderError::Backend(output.failure())
        })
    }
}

/// Read a child pipe to the end on its own thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Wait for `child`, killing it once `timeout` has passed.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<ExitStatus, ProviderError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(?timeout, "gpg killed after deadline");
                return Err(ProviderError::Unavailable(format!(
                    "gpg did not finish within {timeout:?}"
                )));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(ProviderError::Backend(format!("gpg wait failed: {e}"))),
        }
    }
}

fn is_locked(output: &GpgOutput) -> bool {
    output.has_status("BAD_PASSPHRASE") || output.has_status("MISSING_PASSPHRASE")
}

/// `(keyword, args)` for every status line in `stderr`.
fn status_lines(stderr: &str) -> impl Iterator<Item = (&str, Vec<&str>)> {
    stderr.lines().filter_map(|line| {
        let mut parts = line.strip_prefix(STATUS_PREFIX)?.split_whitespace();
        let keyword = parts.next()?;
        Some((keyword, parts.collect()))
    })
}

fn fingerprint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-F0-9]{40}$").expect("valid regex"))
}

fn revocation_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/([A-F0-9]{40})\.rev").expect("valid regex"))
}

fn import_show_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^pub\s+.*\n\s+([A-F0-9]{40})\s*$").expect("valid regex")
    })
}

/// Fingerprint of a key created by `--quick-gen-key`.
///
/// Prefers the `KEY_CREATED` status line and falls back to the revocation
/// certificate path gpg prints (`.../openpgp-revocs.d/<FPR>.rev`).
fn parse_generated_key_id(stderr: &str) -> Option<KeyId> {
    let from_status = status_lines(stderr).find_map(|(keyword, args)| {
        (keyword == "KEY_CREATED")
            .then(|| args.get(1).copied())
            .flatten()
            .filter(|fpr| fingerprint_regex().is_match(fpr))
    });
    let fpr = from_status.or_else(|| {
        revocation_path_regex()
            .captures(stderr)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    })?;
    KeyId::new(fpr).ok()
}

/// Fingerprint of the key imported with `--import-options import-show`.
fn parse_imported_key_id(stderr: &str, stdout: &str) -> Option<KeyId> {
    let from_status = status_lines(stderr).find_map(|(keyword, args)| {
        (keyword == "IMPORT_OK")
            .then(|| args.get(1).copied())
            .flatten()
            .filter(|fpr| fingerprint_regex().is_match(fpr))
    });
    let fpr = from_status.or_else(|| {
        import_show_regex()
            .captures(stdout)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    })?;
    KeyId::new(fpr).ok()
}

/// `(subkey, primary)` fingerprints from a `DECRYPTION_KEY` status line.
///
/// `DECRYPTION_KEY <fpr> <primary-fpr> <otrust>`
fn parse_decryption_key(stderr: &str) -> Option<(&str, &str)> {
    status_lines(stderr).find_map(|(keyword, args)| {
        if keyword != "DECRYPTION_KEY" {
            return None;
        }
        let subkey = args.first().copied()?;
        let primary = args.get(1).copied()?;
        Some((subkey, primary))
    })
}

/// Long key ids from `ENC_TO <keyid> <algo> <len>` status lines.
fn parse_recipients(stderr: &str) -> Vec<&str> {
    status_lines(stderr)
        .filter_map(|(keyword, args)| {
            (keyword == "ENC_TO").then(|| args.first().copied()).flatten()
        })
        .collect()
}

/// `fpr` records of the first key in `--with-colons` listing output.
fn parse_colon_fingerprints(listing: &str) -> Vec<String> {
    let mut fingerprints = Vec::new();
    let mut keys = 0;
    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") => {
                keys += 1;
                if keys > 1 {
                    break;
                }
            }
            Some("fpr") if keys == 1 => {
                if let Some(fpr) = fields.get(9).filter(|fpr| !fpr.is_empty()) {
                    fingerprints.push((*fpr).to_string());
                }
            }
            _ => {}
        }
    }
    fingerprints
}

fn ends_with_ignore_case(fingerprint: &str, keyid: &str) -> bool {
    !keyid.is_empty()
        && fingerprint
            .len()
            .checked_sub(keyid.len())
            .and_then(|start| fingerprint.get(start..))
            .is_some_and(|tail| tail.eq_ignore_ascii_case(keyid))
}

/// Primary key fingerprint from a `VALIDSIG` status line.
///
/// `VALIDSIG <fpr> <date> <ts> <expire> <ver> <reserved> <pk-algo> <hash-algo>
/// <class> [<primary-fpr>]`: the primary fingerprint wins when present since
/// the signature may come from a subkey.
fn parse_valid_signer(stderr: &str) -> Option<String> {
    status_lines(stderr).find_map(|(keyword, args)| {
        if keyword != "VALIDSIG" {
            return None;
        }
        args.get(9)
            .or_else(|| args.first())
            .filter(|fpr| fingerprint_regex().is_match(fpr))
            .map(|fpr| (*fpr).to_string())
    })
}
