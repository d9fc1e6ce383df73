//! Asset providers.
//!
//! A provider unlocks access to an asset for another process: it pulls the
//! plaintext from its source once ready, writes it to a sink (stdout, a
//! regular file, or a FIFO), signals the source to destroy the plaintext,
//! and cleans the sink up. Each provider runs one background delivery
//! activity; the file variant adds a consumption monitor that watches the
//! sink with inotify and removes it once the consumer closed it enough
//! times.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use inotify::{EventMask, Inotify, WatchMask};

use crate::source::{lock_buffer, AssetSource};
use crate::{Error, Result};

const READY_POLL: Duration = Duration::from_millis(250);
const STDOUT_POLL: Duration = Duration::from_millis(100);
const WRITE_BACKOFF: Duration = Duration::from_millis(100);
const OPEN_RETRY: Duration = Duration::from_millis(250);
const MONITOR_POLL: Duration = Duration::from_millis(50);
pub const DEFAULT_STOP_DELAY: Duration = Duration::from_secs(10);

pub trait AssetProvider: Send {
    /// Begin the background delivery activity.
    fn start(&mut self) -> Result<()>;

    /// Poll completion of the delivery activity for up to `timeout`.
    fn wait(&self, timeout: Duration) -> bool;

    /// Join the delivery activity and surface its captured failure.
    fn take_result(&mut self) -> Result<()>;

    /// Cooperative shutdown. Joins every background activity this provider
    /// owns before returning.
    fn stop(&mut self);
}

/// One joinable background activity with a poll-able completion flag.
struct Activity {
    handle: Option<thread::JoinHandle<Result<()>>>,
    finished: Arc<AtomicBool>,
}

impl Activity {
    fn spawn<F>(body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handle = thread::spawn(move || {
            let result = body();
            flag.store(true, Ordering::Release);
            result
        });
        Self {
            handle: Some(handle),
            finished,
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.finished.load(Ordering::Acquire) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(Error::GenericIo {
                    path: "internal".into(),
                    detail: "delivery activity panicked".into(),
                    cause: None,
                })
            }),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct EventCounters {
    opens: AtomicUsize,
    reads: AtomicUsize,
    closes: AtomicUsize,
}

/// Feeds the plaintext to standard output. All diagnostics go to the error
/// stream so the plaintext sink stays clean.
pub struct StdoutProvider {
    source: Arc<dyn AssetSource>,
    terminate: Arc<AtomicBool>,
    activity: Option<Activity>,
}

impl StdoutProvider {
    pub fn new(source: Arc<dyn AssetSource>) -> Self {
        Self {
            source,
            terminate: Arc::new(AtomicBool::new(false)),
            activity: None,
        }
    }
}

impl AssetProvider for StdoutProvider {
    fn start(&mut self) -> Result<()> {
        let source = Arc::clone(&self.source);
        let terminate = Arc::clone(&self.terminate);
        self.activity = Some(Activity::spawn(move || {
            log::debug!("starting the provider, feeding stdout");
            let result = deliver_to_stdout(&source, &terminate);
            if let Err(err) = &result {
                eprintln!("Unexpected error while writing to stdout - {err}");
                source.destroy();
            }
            result
        }));
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.activity
            .as_ref()
            .map_or(true, |activity| activity.wait(timeout))
    }

    fn take_result(&mut self) -> Result<()> {
        match &mut self.activity {
            Some(activity) => activity.join(),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        if let Some(mut activity) = self.activity.take() {
            let _ = activity.join();
        }
    }
}

impl Drop for StdoutProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver_to_stdout(source: &Arc<dyn AssetSource>, terminate: &AtomicBool) -> Result<()> {
    while !terminate.load(Ordering::Relaxed) {
        if source.is_ready()? {
            log::info!("providing unsealed secret on stdout");
            let mut stdout = std::io::stdout().lock();
            {
                let buffer = lock_buffer(source.secret());
                stdout.write_all(buffer.expose())?;
            }
            source.destroy();
            stdout.flush()?;
            return Ok(());
        }
        thread::sleep(STDOUT_POLL);
    }
    // Terminated before delivery; nothing may linger
    source.destroy();
    Ok(())
}

/// Delivers the plaintext as a regular file that self-destroys after being
/// read `out_count` times.
pub struct FileProvider {
    source: Arc<dyn AssetSource>,
    path: PathBuf,
    allowance: usize,
    terminate: Arc<AtomicBool>,
    counters: Arc<EventCounters>,
    activity: Option<Activity>,
}

impl FileProvider {
    pub fn new(source: Arc<dyn AssetSource>, path: impl Into<PathBuf>, out_count: usize) -> Self {
        Self {
            source,
            path: path.into(),
            allowance: out_count.max(1),
            terminate: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(EventCounters::default()),
            activity: None,
        }
    }

    fn print_info(&self) {
        eprintln!("Completed providing {} to client.", self.path.display());
        eprintln!(
            "\t Number of open events                {}",
            self.counters.opens.load(Ordering::Relaxed)
        );
        eprintln!(
            "\t Number of close events (1 may be us) {}",
            self.counters.closes.load(Ordering::Relaxed)
        );
    }
}

impl AssetProvider for FileProvider {
    fn start(&mut self) -> Result<()> {
        let source = Arc::clone(&self.source);
        let path = self.path.clone();
        let allowance = self.allowance;
        let terminate = Arc::clone(&self.terminate);
        let counters = Arc::clone(&self.counters);
        self.activity = Some(Activity::spawn(move || {
            log::info!("starting provider thread for {}", path.display());
            let result = deliver_to_file(&source, &path, allowance, &terminate, &counters);
            if result.is_err() {
                eprintln!(
                    "Unexpected error processing plain-text secret {}",
                    path.display()
                );
                source.destroy();
            }
            result
        }));
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.activity
            .as_ref()
            .map_or(true, |activity| activity.wait(timeout))
    }

    fn take_result(&mut self) -> Result<()> {
        match &mut self.activity {
            Some(activity) => activity.join(),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        if let Some(mut activity) = self.activity.take() {
            let _ = activity.join();
            self.print_info();
        }
    }
}

impl Drop for FileProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver_to_file(
    source: &Arc<dyn AssetSource>,
    path: &Path,
    allowance: usize,
    terminate: &AtomicBool,
    counters: &EventCounters,
) -> Result<()> {
    let mut file = create_sink_file(path, terminate)?;

    // From here on the sink exists on disk and must not survive an error.
    if let Err(err) = write_all_nonblocking(&mut file, source, terminate, path, false) {
        eprintln!(
            "Failed to write (maybe some) to secret file {}",
            path.display()
        );
        source.destroy();
        drop(file);
        return Err(unlink_chaining(path, err));
    }
    source.destroy();
    drop(file);

    // The plaintext now exists only in the page cache behind the sink.
    // Watch the consumer use it up.
    let monitor_ready = AtomicBool::new(false);
    match monitor_consumption(
        path,
        Some(allowance),
        terminate,
        counters,
        &monitor_ready,
    ) {
        Ok(consumed) => {
            if consumed {
                eprintln!(
                    "Clear-text secret \"{}\" was entirely consumed, destroying it",
                    path.display()
                );
            } else {
                log::debug!("stopped before {} was entirely consumed", path.display());
            }
            std::fs::remove_file(path).map_err(|err| Error::GenericIo {
                path: path.display().to_string(),
                detail: format!("fatal error on deleting file - {err}"),
                cause: None,
            })
        }
        Err(err) => {
            eprintln!("Error while watching access to {}", path.display());
            Err(unlink_chaining(path, err))
        }
    }
}

/// Remove the sink before propagating `cause`. A failing unlink is its own
/// error, with the original chained underneath.
fn unlink_chaining(path: &Path, cause: Error) -> Error {
    match std::fs::remove_file(path) {
        Ok(()) => cause,
        Err(err) if err.kind() == ErrorKind::NotFound => cause,
        Err(err) => Error::GenericIo {
            path: path.display().to_string(),
            detail: format!("fatal error on deleting file - {err}"),
            cause: Some(Box::new(cause)),
        },
    }
}

fn create_sink_file(path: &Path, terminate: &AtomicBool) -> Result<File> {
    while !terminate.load(Ordering::Relaxed) {
        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC | libc::O_NOFOLLOW)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(err) if err.kind() == ErrorKind::Interrupted => thread::sleep(OPEN_RETRY),
            Err(err) => {
                eprintln!(
                    "Failed to create secret file {} (permissions?)",
                    path.display()
                );
                return Err(Error::Open {
                    path: path.display().to_string(),
                    detail: format!("fatal error - {err}"),
                });
            }
        }
    }
    Err(Error::Open {
        path: path.display().to_string(),
        detail: "terminated before the sink was created".into(),
    })
}

/// Poll-write the whole buffer through a non-blocking descriptor once the
/// source is ready. Returns the byte count delivered.
fn write_all_nonblocking(
    file: &mut File,
    source: &Arc<dyn AssetSource>,
    terminate: &AtomicBool,
    path: &Path,
    fifo: bool,
) -> Result<usize> {
    let mut written = 0usize;
    while !terminate.load(Ordering::Relaxed) {
        match source.is_ready() {
            Ok(true) => {}
            Ok(false) => {
                // Wait for the data. Just wait a little.
                thread::sleep(READY_POLL);
                continue;
            }
            Err(err) => return Err(err),
        }

        let progress = {
            let buffer = lock_buffer(source.secret());
            let bytes = buffer.expose();
            if written >= bytes.len() {
                log::debug!("we wrote {written} bytes to {}", path.display());
                return Ok(written);
            }
            file.write(&bytes[written..])
        };

        match progress {
            // The kernel took nothing; the pipe buffer is simply full
            Ok(0) => thread::sleep(WRITE_BACKOFF),
            Ok(count) => written += count,
            Err(err) => match err.kind() {
                // Just an interrupt, go at writing again immediately
                ErrorKind::Interrupted => {}
                ErrorKind::WouldBlock => thread::sleep(WRITE_BACKOFF),
                ErrorKind::BrokenPipe if fifo => {
                    // The other end closed while we were still writing
                    return Err(Error::BrokenPipe(path.display().to_string()));
                }
                _ => {
                    return Err(Error::Open {
                        path: path.display().to_string(),
                        detail: format!("fatal error - {err}"),
                    })
                }
            },
        }
    }
    Ok(written)
}

/// Watch a sink path for open/access/close events. With `allowance` set,
/// each close decrements it and the watch ends (returning true) once it
/// reaches zero; otherwise the watch runs until `terminate`.
fn monitor_consumption(
    path: &Path,
    allowance: Option<usize>,
    terminate: &AtomicBool,
    counters: &EventCounters,
    ready: &AtomicBool,
) -> Result<bool> {
    let generic = |detail: String| Error::GenericIo {
        path: path.display().to_string(),
        detail,
        cause: None,
    };

    let mut inotify = Inotify::init()
        .map_err(|err| generic(format!("fatal error creating the inotify object - {err}")))?;
    inotify
        .watches()
        .add(
            path,
            WatchMask::OPEN | WatchMask::ACCESS | WatchMask::CLOSE_WRITE | WatchMask::CLOSE_NOWRITE,
        )
        .map_err(|err| generic(format!("fatal error adding a watch - {err}")))?;

    let mut remaining = allowance;
    let mut buffer = [0u8; 4096];
    ready.store(true, Ordering::Release);

    while !terminate.load(Ordering::Relaxed) {
        match inotify.read_events(&mut buffer) {
            Ok(events) => {
                for event in events {
                    if event.mask.contains(EventMask::ACCESS) {
                        // Read event; it says nothing about how much was read
                        counters.reads.fetch_add(1, Ordering::Relaxed);
                        log::info!("file {} was accessed", path.display());
                    }
                    if event.mask.contains(EventMask::OPEN) {
                        counters.opens.fetch_add(1, Ordering::Relaxed);
                        log::info!("file {} was opened", path.display());
                    }
                    if event
                        .mask
                        .intersects(EventMask::CLOSE_WRITE | EventMask::CLOSE_NOWRITE)
                    {
                        counters.closes.fetch_add(1, Ordering::Relaxed);
                        match remaining.as_mut() {
                            Some(count) => {
                                *count = count.saturating_sub(1);
                                log::info!(
                                    "file {} was closed, remaining allowance {count}",
                                    path.display()
                                );
                                if *count == 0 {
                                    return Ok(true);
                                }
                            }
                            None => log::info!("file {} was closed", path.display()),
                        }
                    }
                }
                thread::sleep(MONITOR_POLL);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(MONITOR_POLL),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                return Err(generic(format!(
                    "fatal error on reading inotify for events - {err}"
                )))
            }
        }
    }
    Ok(false)
}

/// Delivers the plaintext through a named pipe, written exactly once. The
/// FIFO itself is left in place on shutdown; we destroy only what we
/// exclusively created, and only when asked to.
pub struct FifoProvider {
    source: Arc<dyn AssetSource>,
    path: PathBuf,
    terminate: Arc<AtomicBool>,
    counters: Arc<EventCounters>,
    activity: Option<Activity>,
    monitor: Option<Activity>,
    monitoring: bool,
    stop_delay: Duration,
    cleanup: bool,
    created: bool,
}

impl FifoProvider {
    pub fn new(source: Arc<dyn AssetSource>, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            path: path.into(),
            terminate: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(EventCounters::default()),
            activity: None,
            monitor: None,
            monitoring: true,
            stop_delay: DEFAULT_STOP_DELAY,
            cleanup: false,
            created: false,
        }
    }

    /// Shorten (or lengthen) the notification settling delay used by `stop`.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Opt in to unlinking the FIFO on shutdown when this process created it.
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Disable the non-binding open/close observation.
    pub fn with_monitoring(mut self, monitoring: bool) -> Self {
        self.monitoring = monitoring;
        self
    }

    fn print_info(&self) {
        eprintln!("Completed providing {} to client.", self.path.display());
        eprintln!(
            "\t Number of open events                {}",
            self.counters.opens.load(Ordering::Relaxed)
        );
        eprintln!(
            "\t Number of close events (1 may be us) {}",
            self.counters.closes.load(Ordering::Relaxed)
        );
    }
}

impl AssetProvider for FifoProvider {
    fn start(&mut self) -> Result<()> {
        self.created = match make_fifo(&self.path) {
            Ok(created) => created,
            Err(err) => {
                self.source.destroy();
                return Err(err);
            }
        };

        let monitor_ready = Arc::new(AtomicBool::new(false));
        if self.monitoring {
            let path = self.path.clone();
            let terminate = Arc::clone(&self.terminate);
            let counters = Arc::clone(&self.counters);
            let ready = Arc::clone(&monitor_ready);
            self.monitor = Some(Activity::spawn(move || {
                let result =
                    monitor_consumption(&path, None, &terminate, &counters, &ready).map(|_| ());
                // Unblock the writer even when the watch could not be placed
                ready.store(true, Ordering::Release);
                result
            }));
        } else {
            monitor_ready.store(true, Ordering::Release);
        }

        let source = Arc::clone(&self.source);
        let path = self.path.clone();
        let terminate = Arc::clone(&self.terminate);
        self.activity = Some(Activity::spawn(move || {
            log::info!("starting provider thread for {}", path.display());
            deliver_to_fifo(&source, &path, &terminate, &monitor_ready)
        }));
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.activity
            .as_ref()
            .map_or(true, |activity| activity.wait(timeout))
    }

    fn take_result(&mut self) -> Result<()> {
        match &mut self.activity {
            Some(activity) => activity.join(),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        if self.monitoring && self.monitor.is_some() {
            eprintln!(
                "Monitor access to {} for {}s",
                self.path.display(),
                self.stop_delay.as_secs()
            );
            // Let the notification subsystem drain trailing events
            thread::sleep(self.stop_delay);
        }
        self.terminate.store(true, Ordering::Relaxed);
        if let Some(mut monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        if let Some(mut activity) = self.activity.take() {
            let _ = activity.join();
            self.print_info();
        }
        if self.cleanup && self.created {
            if let Err(err) = std::fs::remove_file(&self.path) {
                log::debug!("could not remove fifo {} - {err}", self.path.display());
            }
            self.created = false;
        }
    }
}

impl Drop for FifoProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create the FIFO if it does not already exist. Returns whether we created
/// it; a pre-existing FIFO belongs to whoever made it.
fn make_fifo(path: &Path) -> Result<bool> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Open {
        path: path.display().to_string(),
        detail: "path contains an interior NUL".into(),
    })?;

    let retval = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if retval == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EEXIST) {
        return Ok(false);
    }
    Err(Error::Open {
        path: path.display().to_string(),
        detail: format!("failed to create the fifo - {err}"),
    })
}

fn deliver_to_fifo(
    source: &Arc<dyn AssetSource>,
    path: &Path,
    terminate: &AtomicBool,
    monitor_ready: &AtomicBool,
) -> Result<()> {
    // Wait for the monitor so no early open goes unobserved
    while !terminate.load(Ordering::Relaxed) && !monitor_ready.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(1));
    }

    let mut file = match open_fifo_writer(path, terminate) {
        Ok(Some(file)) => file,
        Ok(None) => {
            // Terminated before a reader showed up
            source.destroy();
            return Ok(());
        }
        Err(err) => {
            source.destroy();
            return Err(err);
        }
    };

    eprintln!("Fifo successfully opened at {}", path.display());
    log::info!("named pipe is open and ready, we deliver to {}", path.display());

    let result = write_all_nonblocking(&mut file, source, terminate, path, true);
    source.destroy();
    result.map(|_| ())
}

/// Opening a FIFO for writing fails with ENXIO until a reader opens the
/// other end; that and EINTR mean try again shortly.
fn open_fifo_writer(path: &Path, terminate: &AtomicBool) -> Result<Option<File>> {
    while !terminate.load(Ordering::Relaxed) {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC | libc::O_NOFOLLOW)
            .open(path)
        {
            Ok(file) => return Ok(Some(file)),
            Err(err)
                if err.raw_os_error() == Some(libc::ENXIO)
                    || err.kind() == ErrorKind::Interrupted =>
            {
                thread::sleep(OPEN_RETRY);
            }
            Err(err) => {
                return Err(Error::Open {
                    path: path.display().to_string(),
                    detail: format!("fatal error - {err}"),
                })
            }
        }
    }
    Ok(None)
}
