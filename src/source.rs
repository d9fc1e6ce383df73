//! Asset sources.
//!
//! A source turns some ingress (stdin, a file, a FIFO) into a plaintext
//! secret and owns that plaintext until a provider tells it to destroy it.
//! The Clevis source carries the whole Tang recovery protocol on a
//! background thread; the others are immediate.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use josekit::jwk::Jwk;
use zeroize::Zeroize;

use crate::jose::{self, JweEnvelope};
use crate::key_exchange;
use crate::meta::Composition;
use crate::tang_interface::TangClient;
use crate::{Error, Result};

/// Plaintext container. `destroy` overwrites the bytes in place (the length
/// stays observable); drop scrubs whatever is left. Bytes are only handed
/// out by borrowed reference.
#[derive(Default)]
pub struct SecretBuffer {
    bytes: Vec<u8>,
    destroyed: bool,
}

impl SecretBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            destroyed: false,
        }
    }

    pub fn fill(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
    }

    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Idempotent.
    pub fn destroy(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBuffer")
            .field("bytes", &"[REDACTED]")
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Mutex poisoning only happens after a panic elsewhere; the buffer itself
/// stays usable, so recover the guard.
pub(crate) fn lock_buffer(buffer: &Mutex<SecretBuffer>) -> MutexGuard<'_, SecretBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub trait AssetSource: Send + Sync {
    /// True once the plaintext is available. A pending unseal failure is
    /// surfaced here, on the first call after the failure.
    fn is_ready(&self) -> Result<bool>;

    /// Locked access to the plaintext.
    fn secret(&self) -> &Mutex<SecretBuffer>;

    /// Overwrite the plaintext with zero bytes. Idempotent.
    fn destroy(&self) {
        lock_buffer(self.secret()).destroy();
    }

    /// Request cooperative abort of any ongoing recovery.
    fn cancel(&self) {}

    /// Significant data on user request, e.g. the JWE protected header.
    fn dump_info(&self) {}

    /// Operational information for debugging.
    fn print_info(&self) {}
}

/// A fixed byte sequence. Mostly used for testing.
pub struct StaticSource {
    secret: Mutex<SecretBuffer>,
}

impl StaticSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Mutex::new(SecretBuffer::new(data.into())),
        }
    }
}

impl AssetSource for StaticSource {
    fn is_ready(&self) -> Result<bool> {
        Ok(!lock_buffer(&self.secret).is_destroyed())
    }

    fn secret(&self) -> &Mutex<SecretBuffer> {
        &self.secret
    }
}

/// Read the ingress exactly once: a regular file, a FIFO, or stdin when no
/// path is given. Trailing newlines are trimmed.
fn read_ingress(path: Option<&Path>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    match path {
        Some(path) => {
            use std::os::unix::fs::FileTypeExt;
            let file_type = std::fs::metadata(path)
                .map_err(|_| {
                    Error::SourceUnavailable(format!(
                        "{} - file is missing or incorrect type",
                        path.display()
                    ))
                })?
                .file_type();
            if !file_type.is_file() && !file_type.is_fifo() {
                return Err(Error::SourceUnavailable(format!(
                    "{} - file is missing or incorrect type",
                    path.display()
                )));
            }
            std::fs::File::open(path)
                .map_err(|_| {
                    Error::SourceUnavailable(format!(
                        "{} can't be open, check permissions",
                        path.display()
                    ))
                })?
                .read_to_end(&mut data)
                .map_err(|err| {
                    Error::SourceUnavailable(format!("{} - {err}", path.display()))
                })?;
        }
        None => {
            std::io::stdin()
                .lock()
                .read_to_end(&mut data)
                .map_err(|err| Error::SourceUnavailable(format!("stdin - {err}")))?;
        }
    }
    Ok(trim_trailing_newlines(data))
}

fn trim_trailing_newlines(mut data: Vec<u8>) -> Vec<u8> {
    while data.last() == Some(&b'\n') {
        data.pop();
    }
    data
}

/// Non-Clevis ingress: the input bytes are the secret itself.
pub struct PlainFileSource {
    secret: Mutex<SecretBuffer>,
}

impl PlainFileSource {
    pub fn new(path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            secret: Mutex::new(SecretBuffer::new(read_ingress(path)?)),
        })
    }
}

impl AssetSource for PlainFileSource {
    fn is_ready(&self) -> Result<bool> {
        Ok(!lock_buffer(&self.secret).is_destroyed())
    }

    fn secret(&self) -> &Mutex<SecretBuffer> {
        &self.secret
    }
}

/// Knobs of the Tang retry loop.
#[derive(Clone, Copy, Debug)]
pub struct UnsealPolicy {
    /// Sleep between retries after a transient failure.
    pub request_interval: Duration,
    /// Wall-clock horizon after which recovery stops waiting.
    pub give_up: Duration,
}

impl Default for UnsealPolicy {
    fn default() -> Self {
        Self {
            request_interval: Duration::from_secs(15),
            give_up: Duration::from_secs(5 * 60 * 60),
        }
    }
}

/// Clevis/Tang unsealer. Construction validates and decomposes the JWE;
/// the actual secret extraction runs on its own thread.
pub struct ClevisSource {
    envelope: JweEnvelope,
    label: String,
    query: String,
    client: Arc<TangClient>,
    policy: UnsealPolicy,
    compatible: bool,
    secret: Mutex<SecretBuffer>,
    outcome: Mutex<Option<Result<()>>>,
    task: Mutex<Option<thread::JoinHandle<()>>>,
    finished: AtomicBool,
    done: AtomicBool,
    failed: Mutex<Option<String>>,
    cancelled: AtomicBool,
}

impl ClevisSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: Option<&Path>,
        preloaded: Option<Vec<u8>>,
        meta: &Composition,
        client: Arc<TangClient>,
        policy: UnsealPolicy,
        compatible: bool,
        autostart: bool,
    ) -> Result<Arc<Self>> {
        let label = match path {
            Some(path) => path.display().to_string(),
            None => "stdin".to_owned(),
        };
        let raw = match preloaded {
            Some(bytes) => trim_trailing_newlines(bytes),
            None => read_ingress(path)?,
        };

        log::info!("check validity of input JWE {label}");
        let envelope = jose::parse_jwe(&raw)
            .map_err(|err| Error::SourceUnavailable(format!("{label} - {err}")))?;

        let composed = meta.composed_hash();
        let query = if composed.is_empty() {
            String::new()
        } else {
            format!("id={composed}")
        };

        let source = Arc::new(Self {
            envelope,
            label,
            query,
            client,
            policy,
            compatible,
            secret: Mutex::new(SecretBuffer::default()),
            outcome: Mutex::new(None),
            task: Mutex::new(None),
            finished: AtomicBool::new(false),
            done: AtomicBool::new(false),
            failed: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });
        source.print_info();

        if autostart {
            source.start_unsealing();
        }
        Ok(source)
    }

    pub fn start_unsealing(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = thread::spawn(move || {
            let result = me.unseal();
            if result.is_err() {
                // Alert the user; the error itself travels through is_ready
                eprintln!(
                    "Failed to extract secret from {} using server at {}",
                    me.label, me.envelope.url
                );
            }
            *lock(&me.outcome) = Some(result);
            me.finished.store(true, Ordering::Release);
        });
        *lock(&self.task) = Some(handle);
    }

    pub fn url(&self) -> &str {
        &self.envelope.url
    }

    fn unseal(&self) -> Result<()> {
        log::info!("recover private key for {}", self.label);
        let unwrapping = self.recover_unwrapping_key()?;

        log::info!("finally, recover the payload / secret from {}", self.label);
        let plaintext = jose::decrypt_payload(&unwrapping, &self.envelope)?;
        lock_buffer(&self.secret).fill(plaintext);

        log::debug!("recovered clear-text secret");
        Ok(())
    }

    /// The Clevis-Tang unbinding: blind the provisioning point with a fresh
    /// ephemeral key, have the server multiply, unblind by subtraction.
    fn recover_unwrapping_key(&self) -> Result<Jwk> {
        let ephemeral = key_exchange::generate_ephemeral(&self.envelope.epk_curve)?;
        log::debug!(
            "ephemeral key, before exchange1: {}",
            jose::pretty_print(&ephemeral)
        );

        let exchanged = key_exchange::ecmr_add(&self.envelope.epk, &ephemeral)?;
        let mut exchanged_json = serde_json::to_string(&exchanged)?;
        log::debug!("ephemeral key, after exchange1: {exchanged_json}");

        let deadline = Instant::now() + self.policy.give_up;
        let mut body = loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(Error::SourceUnavailable("cancelled".into()));
            }
            match self.client.recover(
                &self.envelope.url,
                &self.envelope.kid,
                &exchanged_json,
                &self.query,
                &self.cancelled,
            ) {
                Ok(body) => break body,
                Err(err @ Error::PermanentTangFailure(_)) => return Err(err),
                Err(err) => {
                    // Authorization may come later, so retry in a little
                    // while. Unless we need to give up.
                    if Instant::now() > deadline {
                        return Err(Error::SourceUnavailable(
                            "waited too long for tang access, we gave up".into(),
                        ));
                    }
                    log::debug!("transient tang failure, retrying - {err}");
                    self.sleep_cancellable(self.policy.request_interval);
                }
            }
        };
        key_exchange::scrub_string(&mut exchanged_json);

        let mut recovered = jose::parse_recovered_key(&body, self.compatible)?;
        body.zeroize();
        log::debug!(
            "recovering key from server: {}",
            jose::pretty_print(&recovered)
        );
        jose::strip_private(&mut recovered)?;

        let second = key_exchange::diffie_hellman(&ephemeral, &self.envelope.active_server_key)?;
        log::debug!(
            "ephemeral key, after exchange2: {}",
            jose::pretty_print(&second)
        );

        key_exchange::ecmr_sub(&recovered, &second)
    }

    fn sleep_cancellable(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.cancelled.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(250)));
        }
    }
}

impl AssetSource for ClevisSource {
    fn is_ready(&self) -> Result<bool> {
        if self.done.load(Ordering::Acquire) {
            return Ok(true);
        }
        if let Some(message) = lock(&self.failed).clone() {
            return Err(Error::SourceUnavailable(message));
        }
        if !self.finished.load(Ordering::Acquire) {
            return Ok(false);
        }

        // The unseal thread is done; join it and surface its outcome once.
        if let Some(handle) = lock(&self.task).take() {
            let _ = handle.join();
        }
        match lock(&self.outcome).take() {
            Some(Ok(())) => {
                self.done.store(true, Ordering::Release);
                Ok(true)
            }
            Some(Err(err)) => {
                *lock(&self.failed) = Some(err.to_string());
                Err(err)
            }
            None => Ok(self.done.load(Ordering::Acquire)),
        }
    }

    fn secret(&self) -> &Mutex<SecretBuffer> {
        &self.secret
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn dump_info(&self) {
        eprintln!("Protected header: \n{}", self.envelope.pretty_header());
    }

    fn print_info(&self) {
        log::debug!("EPK: {}", jose::pretty_print(&self.envelope.epk));
        log::debug!("EPK curve: {}", self.envelope.epk_curve);
        log::debug!("KID: {}", self.envelope.kid);
        log::debug!("advertised keys: {}", self.envelope.adv.len());
        log::debug!(
            "selected server key: {}",
            jose::pretty_print(&self.envelope.active_server_key)
        );
        log::debug!("recovery URL: {}", self.envelope.url);
    }
}

impl Drop for ClevisSource {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        let handle = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_lifecycle() {
        let source = StaticSource::new(&b"hunter2"[..]);
        assert!(source.is_ready().unwrap());
        assert_eq!(lock_buffer(source.secret()).expose(), b"hunter2");

        source.destroy();
        assert!(!source.is_ready().unwrap());
        // Destroyed means zeroed in place, not truncated
        assert_eq!(lock_buffer(source.secret()).expose(), &[0u8; 7]);
    }

    #[test]
    fn destroy_is_idempotent() {
        let source = StaticSource::new(&b"x"[..]);
        source.destroy();
        source.destroy();
        assert!(lock_buffer(source.secret()).is_destroyed());
        assert_eq!(lock_buffer(source.secret()).expose(), &[0u8]);
    }

    #[test]
    fn plain_file_source_trims_trailing_newlines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(b"secret value\n\n").unwrap();

        let source = PlainFileSource::new(Some(file.path())).unwrap();
        assert_eq!(lock_buffer(source.secret()).expose(), b"secret value");
    }

    #[test]
    fn plain_file_source_missing_file() {
        assert!(matches!(
            PlainFileSource::new(Some(Path::new("/does/not/exist"))),
            Err(Error::SourceUnavailable(_))
        ));
    }

    #[test]
    fn plain_file_source_rejects_directories() {
        assert!(matches!(
            PlainFileSource::new(Some(Path::new("/tmp"))),
            Err(Error::SourceUnavailable(_))
        ));
    }

    #[test]
    fn secret_buffer_zeroes_but_keeps_length() {
        let mut buffer = SecretBuffer::new(vec![1, 2, 3, 4]);
        buffer.destroy();
        assert_eq!(buffer.len(), 4);
        assert!(buffer.expose().iter().all(|byte| *byte == 0));
        assert!(buffer.is_destroyed());
    }

    #[test]
    fn default_policy_matches_the_protocol() {
        let policy = UnsealPolicy::default();
        assert_eq!(policy.request_interval, Duration::from_secs(15));
        assert_eq!(policy.give_up, Duration::from_secs(18000));
    }
}
