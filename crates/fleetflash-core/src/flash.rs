//! Flashing engine
//!
//! Writes a built image to a removable device through a two-stage pipeline:
//! the streaming proxy reads the image and feeds a privileged raw-copy stage
//! that owns the device. The engine never touches the device itself; it
//! watches the proxy's progress log and the pipeline's exit status.
//!
//! ```text
//! Idle -> CapacityChecked -> Writing -> Completed
//!                                    -> Failed
//!                                    -> Cancelled
//! ```
//!
//! Platform specifics (enumeration, dismount, how the pipeline is launched)
//! live behind [`BlockDeviceBackend`].

use crate::error::{Error, Result};
use crate::image::NodeImage;
use crate::progress::{calculate_speed_eta, format_eta, format_speed};
use crate::proxy::{latest_progress, ProgressLine, DEFAULT_PROXY_CHUNK_SIZE};
use crate::settings::DEFAULT_POLL_INTERVAL_MS;
use crate::task::Task;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

/// Shown when no removable device is present
pub const NO_DEVICE_PLACEHOLDER: &str = "Please insert a card";

/// Label of a device without a mounted, named volume
pub const NO_LABEL: &str = "No Label";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// ============================================================================
// Devices and pipeline seam
// ============================================================================

/// A removable block device as seen by the enumerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// Platform identifier (`/dev/sdb`, `/dev/disk4`, `\\.\PHYSICALDRIVE2`)
    pub id: String,
    /// Volume label, or [`NO_LABEL`]
    pub label: String,
    /// Capacity in bytes
    pub size: u64,
    /// Removable flag reported by the OS
    pub removable: bool,
}

impl BlockDevice {
    /// Create a removable device; an empty label becomes [`NO_LABEL`]
    pub fn new(id: impl Into<String>, label: impl Into<String>, size: u64) -> Self {
        let label = label.into();
        Self {
            id: id.into(),
            label: if label.trim().is_empty() {
                NO_LABEL.to_string()
            } else {
                label
            },
            size,
            removable: true,
        }
    }

    /// One-line description, e.g. `/dev/sdb 'BOOT' 14.8GB`
    #[allow(clippy::cast_precision_loss)]
    pub fn display(&self) -> String {
        format!("{} '{}' {:.1}GB", self.id, self.label, self.size as f64 / GIB)
    }
}

/// Everything a backend needs to launch the write pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    /// Image to write
    pub image: PathBuf,
    /// Image size in bytes
    pub image_size: u64,
    /// Target device
    pub device: BlockDevice,
    /// File the proxy stage appends progress lines to
    pub progress_log: PathBuf,
    /// Proxy relay chunk
    pub chunk_size: usize,
    /// Proxy executable override
    pub proxy_program: Option<PathBuf>,
}

/// How a pipeline ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineExit {
    /// The privileged stage reported success
    pub success: bool,
    /// Captured error output of the pipeline
    pub diagnostics: String,
}

/// A launched write pipeline
pub trait PipelineProcess: Send {
    /// Non-blocking check for termination
    fn try_wait(&mut self) -> std::io::Result<Option<PipelineExit>>;

    /// Terminate both stages
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Platform capability interface, selected once at startup
#[cfg_attr(test, mockall::automock)]
pub trait BlockDeviceBackend: Send + Sync {
    /// Enumerate removable devices; an empty list is not an error
    fn list_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Dismount and unlock the device before writing
    fn prepare_device(&self, device: &BlockDevice) -> Result<()>;

    /// Undo [`prepare_device`](Self::prepare_device) after the write ends, whatever the outcome
    fn release_device(&self, device: &BlockDevice) -> Result<()>;

    /// Launch `proxy <image> <log> | <privileged writer> <device>`
    fn spawn_pipeline(&self, request: &PipelineRequest) -> Result<Box<dyn PipelineProcess>>;
}

// ============================================================================
// Job state
// ============================================================================

/// Flash job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlashState {
    /// Accepted, nothing checked yet
    Idle,
    /// Image fits the device
    CapacityChecked,
    /// Pipeline running
    Writing,
    /// Pipeline exited successfully
    Completed,
    /// Pipeline or a precondition failed
    Failed,
    /// User aborted
    Cancelled,
}

impl FlashState {
    /// Whether the job has ended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashState::Completed | FlashState::Failed | FlashState::Cancelled
        )
    }
}

/// The single active unit of flashing work
#[derive(Debug, Clone)]
pub struct FlashJob {
    /// Image being written
    pub image: NodeImage,
    /// Target device
    pub device: BlockDevice,
    /// Current state
    pub state: FlashState,
    /// Bytes relayed so far
    pub bytes_written: u64,
    /// When `Writing` began
    pub started: Option<Instant>,
}

/// Flash progress information
#[derive(Debug, Clone, PartialEq)]
pub struct FlashProgress {
    /// Completion (0-100)
    pub percent: f64,
    /// Bytes relayed so far
    pub bytes_written: u64,
    /// Image size
    pub total_bytes: u64,
    /// Average speed since `Writing` began
    pub speed_bps: u64,
    /// Estimated seconds remaining
    pub eta_seconds: Option<u64>,
    /// Time since `Writing` began
    pub elapsed: Duration,
}

impl FlashProgress {
    /// Format speed for display (e.g., "12.3 MB/s")
    pub fn speed_display(&self) -> String {
        format_speed(self.speed_bps)
    }

    /// Format ETA for display (e.g., "3 min")
    pub fn eta_display(&self) -> String {
        match self.eta_seconds {
            Some(secs) => format_eta(secs),
            None => "calculating...".to_string(),
        }
    }
}

/// Result of a completed flash
#[derive(Debug, Clone)]
pub struct FlashResult {
    /// Image written
    pub image: PathBuf,
    /// Device written to
    pub device: String,
    /// Bytes written
    pub bytes_written: u64,
    /// Time spent writing
    pub elapsed: Duration,
    /// Final state
    pub state: FlashState,
}

impl FlashResult {
    /// Average speed over the whole write
    pub fn average_speed(&self) -> u64 {
        let millis = self.elapsed.as_millis();
        if millis == 0 {
            return 0;
        }
        u64::try_from(u128::from(self.bytes_written) * 1000 / millis).unwrap_or(u64::MAX)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Configuration for flashing
#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// How often the progress log and pipeline are polled
    pub poll_interval: Duration,
    /// Proxy relay chunk
    pub chunk_size: usize,
    /// Proxy executable override
    pub proxy_program: Option<PathBuf>,
    /// Directory for progress log files
    pub progress_dir: PathBuf,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            chunk_size: DEFAULT_PROXY_CHUNK_SIZE,
            proxy_program: None,
            progress_dir: std::env::temp_dir(),
        }
    }
}

impl FlashConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set proxy chunk size
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(512);
        self
    }

    /// Set proxy executable
    pub fn proxy_program(mut self, program: Option<PathBuf>) -> Self {
        self.proxy_program = program;
        self
    }

    /// Set progress log directory
    pub fn progress_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.progress_dir = dir.into();
        self
    }
}

/// Fail with [`Error::DestinationTooSmall`] when the image does not fit
pub fn check_capacity(image_size: u64, device_size: u64) -> Result<()> {
    if image_size > device_size {
        return Err(Error::DestinationTooSmall {
            image_size,
            device_size,
        });
    }
    Ok(())
}

static LOG_COUNTER: AtomicU64 = AtomicU64::new(0);

type JobSlot = Arc<Mutex<Option<FlashJob>>>;

/// Holds the active-job slot until the job ends
struct ActiveJob {
    slot: JobSlot,
}

impl ActiveJob {
    fn update(&self, f: impl FnOnce(&mut FlashJob)) {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = guard.as_mut() {
            f(job);
        }
    }

    fn set_state(&self, state: FlashState) {
        tracing::debug!("Flash state -> {:?}", state);
        self.update(|job| job.state = state);
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Orchestrates one image-to-device write at a time
#[derive(Clone)]
pub struct FlashEngine {
    backend: Arc<dyn BlockDeviceBackend>,
    config: FlashConfig,
    active: JobSlot,
    cancel_flag: Arc<AtomicBool>,
    device_lock: Arc<Mutex<()>>,
}

impl FlashEngine {
    /// Create an engine over a platform backend
    pub fn new(backend: Arc<dyn BlockDeviceBackend>, config: FlashConfig) -> Self {
        Self {
            backend,
            config,
            active: Arc::new(Mutex::new(None)),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            device_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get a handle to cancel the active flash
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Snapshot of the active job, if any
    pub fn active_job(&self) -> Option<FlashJob> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a job is currently in `Writing`
    pub fn is_writing(&self) -> bool {
        self.active_job()
            .is_some_and(|job| job.state == FlashState::Writing)
    }

    /// Whether a claimed job has not reached a terminal state yet
    pub fn is_busy(&self) -> bool {
        self.active_job().is_some_and(|job| !job.state.is_terminal())
    }

    /// Hold the device side of the engine for an enumeration
    ///
    /// Returns `None` while a job is between its target lookup and device
    /// release, or while any job is unfinished. The engine waits for a
    /// returned guard before it touches a device.
    pub fn quiesce(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = match self.device_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        if self.is_busy() {
            return None;
        }
        Some(guard)
    }

    /// Flash on the calling thread
    pub fn flash<F>(&self, image: &NodeImage, device: &BlockDevice, mut on_progress: F) -> Result<FlashResult>
    where
        F: FnMut(&FlashProgress),
    {
        let job = self.claim(image, device)?;
        self.run(&job, image, device, &mut on_progress)
    }

    /// Flash on a worker thread
    ///
    /// The job is claimed before this returns, so a concurrent request is
    /// rejected immediately.
    pub fn spawn(&self, image: NodeImage, device: BlockDevice) -> Result<Task<FlashProgress, FlashResult>> {
        let job = self.claim(&image, &device)?;
        let engine = self.clone();

        Task::spawn("fleetflash-flash", self.cancel_handle(), move |tx| {
            engine.run(&job, &image, &device, &mut |p| {
                // Receiver gone means nobody is watching; keep writing
                let _ = tx.send(p.clone());
            })
        })
    }

    fn claim(&self, image: &NodeImage, device: &BlockDevice) -> Result<ActiveJob> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = slot.as_ref() {
            if !job.state.is_terminal() {
                tracing::warn!("Rejecting flash to {}: {} is busy", device.id, job.device.id);
                return Err(Error::FlashInProgress(job.device.id.clone()));
            }
        }

        *slot = Some(FlashJob {
            image: image.clone(),
            device: device.clone(),
            state: FlashState::Idle,
            bytes_written: 0,
            started: None,
        });
        self.cancel_flag.store(false, Ordering::SeqCst);

        Ok(ActiveJob {
            slot: Arc::clone(&self.active),
        })
    }

    fn run(
        &self,
        job: &ActiveJob,
        image: &NodeImage,
        device: &BlockDevice,
        on_progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<FlashResult> {
        let result = self.run_inner(job, image, device, on_progress);
        let state = match &result {
            Ok(_) => FlashState::Completed,
            Err(Error::Cancelled) => FlashState::Cancelled,
            Err(_) => FlashState::Failed,
        };
        job.set_state(state);

        match &result {
            Ok(r) => tracing::info!("Flashed {:?} to {} in {:?}", r.image, r.device, r.elapsed),
            Err(e) if e.device_corrupted() => {
                tracing::warn!("Flash to {} ended early, device contents are undefined: {}", device.id, e);
            }
            Err(e) => tracing::warn!("Flash to {} not started: {}", device.id, e),
        }
        result
    }

    fn run_inner(
        &self,
        job: &ActiveJob,
        image: &NodeImage,
        device: &BlockDevice,
        on_progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<FlashResult> {
        check_capacity(image.size, device.size)?;
        job.set_state(FlashState::CapacityChecked);

        // Held until the device is released; polls back off meanwhile
        let _devices = self
            .device_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // The card may have been swapped since it was picked
        let target = self
            .backend
            .list_devices()?
            .into_iter()
            .find(|d| d.id == device.id)
            .ok_or_else(|| Error::DeviceNotFound(device.id.clone()))?;
        check_capacity(image.size, target.size)?;

        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        self.backend.prepare_device(&target)?;

        let outcome = self.write(job, image, &target, on_progress);

        if let Err(e) = self.backend.release_device(&target) {
            tracing::warn!("Could not release {}: {}", target.id, e);
        }
        outcome
    }

    fn write(
        &self,
        job: &ActiveJob,
        image: &NodeImage,
        target: &BlockDevice,
        on_progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<FlashResult> {
        let log_path = self.progress_log_path();
        std::fs::File::create(&log_path)?;

        let request = PipelineRequest {
            image: image.path.clone(),
            image_size: image.size,
            device: target.clone(),
            progress_log: log_path.clone(),
            chunk_size: self.config.chunk_size,
            proxy_program: self.config.proxy_program.clone(),
        };

        let started = Instant::now();
        job.update(|j| {
            j.state = FlashState::Writing;
            j.started = Some(started);
        });
        tracing::info!("Writing {:?} to {}", image.path, target.id);

        let outcome = self
            .backend
            .spawn_pipeline(&request)
            .and_then(|process| self.supervise(process, job, image, &log_path, started, on_progress));

        if let Err(e) = std::fs::remove_file(&log_path) {
            tracing::debug!("Could not remove progress log {:?}: {}", log_path, e);
        }

        outcome.map(|bytes_written| FlashResult {
            image: image.path.clone(),
            device: target.id.clone(),
            bytes_written,
            elapsed: started.elapsed(),
            state: FlashState::Completed,
        })
    }

    fn supervise(
        &self,
        mut process: Box<dyn PipelineProcess>,
        job: &ActiveJob,
        image: &NodeImage,
        log_path: &Path,
        started: Instant,
        on_progress: &mut dyn FnMut(&FlashProgress),
    ) -> Result<u64> {
        let mut last_percent = -1.0f64;
        let mut report = |percent: f64| {
            if percent <= last_percent {
                return;
            }
            last_percent = percent;
            let elapsed = started.elapsed();
            let (speed_bps, eta_seconds) = calculate_speed_eta(image.size, percent, elapsed);
            let bytes_written = bytes_at(image.size, percent);
            job.update(|j| j.bytes_written = bytes_written);
            on_progress(&FlashProgress {
                percent,
                bytes_written,
                total_bytes: image.size,
                speed_bps,
                eta_seconds,
                elapsed,
            });
        };

        loop {
            if self.cancel_flag.load(Ordering::SeqCst) {
                tracing::info!("Cancelling flash to {}", job_device(job));
                stop(process.as_mut(), self.config.poll_interval);
                return Err(Error::Cancelled);
            }

            match read_progress(log_path) {
                Some(ProgressLine::Error(reason)) => {
                    stop(process.as_mut(), self.config.poll_interval);
                    return Err(Error::WriteFailure(reason));
                }
                Some(ProgressLine::Percent(p)) => report(p),
                None => {}
            }

            let exit = process
                .try_wait()
                .map_err(|e| Error::WriteFailure(format!("lost track of the write pipeline: {e}")))?;

            if let Some(exit) = exit {
                let last = read_progress(log_path);
                if let Some(ProgressLine::Error(reason)) = last {
                    return Err(Error::WriteFailure(reason));
                }
                if !exit.success {
                    let diagnostics = exit.diagnostics.trim();
                    return Err(Error::WriteFailure(if diagnostics.is_empty() {
                        "the privileged writer exited with an error".to_string()
                    } else {
                        diagnostics.to_string()
                    }));
                }
                if let Some(ProgressLine::Percent(p)) = last {
                    report(p);
                }
                report(100.0);
                return Ok(image.size);
            }

            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn progress_log_path(&self) -> PathBuf {
        let n = LOG_COUNTER.fetch_add(1, Ordering::SeqCst);
        self.config
            .progress_dir
            .join(format!("fleetflash-progress-{}-{n}.log", std::process::id()))
    }
}

fn job_device(job: &ActiveJob) -> String {
    job.slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|j| j.device.id.clone())
        .unwrap_or_default()
}

fn read_progress(log_path: &Path) -> Option<ProgressLine> {
    std::fs::read_to_string(log_path)
        .ok()
        .and_then(|content| latest_progress(&content))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn bytes_at(total: u64, percent: f64) -> u64 {
    (total as f64 * (percent / 100.0).clamp(0.0, 1.0)) as u64
}

/// Kill the pipeline and give it a moment to exit
fn stop(process: &mut dyn PipelineProcess, poll_interval: Duration) {
    if let Err(e) = process.kill() {
        tracing::warn!("Failed to stop write pipeline: {}", e);
    }
    for _ in 0..50 {
        match process.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => std::thread::sleep(poll_interval.min(Duration::from_millis(100))),
        }
    }
    tracing::warn!("Write pipeline did not exit after being killed");
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Role;
    use mockall::predicate::always;
    use tempfile::TempDir;

    const GIB_BYTES: u64 = 1024 * 1024 * 1024;

    /// Pipeline stand-in that writes a progress script and exits on cue
    struct FakeProcess {
        exit: Option<PipelineExit>,
        hang: bool,
        killed: Arc<AtomicBool>,
    }

    impl FakeProcess {
        fn boxed(exit: Option<PipelineExit>, hang: bool, killed: Arc<AtomicBool>) -> Box<dyn PipelineProcess> {
            Box::new(Self { exit, hang, killed })
        }
    }

    impl PipelineProcess for FakeProcess {
        fn try_wait(&mut self) -> std::io::Result<Option<PipelineExit>> {
            if self.killed.load(Ordering::SeqCst) {
                return Ok(Some(PipelineExit {
                    success: false,
                    diagnostics: "killed".to_string(),
                }));
            }
            if self.hang {
                return Ok(None);
            }
            Ok(self.exit.clone())
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn image(size: u64) -> NodeImage {
        NodeImage {
            path: PathBuf::from("/tmp/Skybian-manager.img"),
            role: Role::Manager,
            size,
        }
    }

    fn card(size: u64) -> BlockDevice {
        BlockDevice::new("/dev/sdz", "BOOT", size)
    }

    fn engine(backend: MockBlockDeviceBackend, dir: &TempDir) -> FlashEngine {
        FlashEngine::new(
            Arc::new(backend),
            FlashConfig::new()
                .poll_interval(Duration::from_millis(1))
                .progress_dir(dir.path()),
        )
    }

    fn success() -> Option<PipelineExit> {
        Some(PipelineExit {
            success: true,
            diagnostics: String::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Device tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_block_device_display() {
        let device = BlockDevice::new("/dev/sdb", "BOOT", 16 * GIB_BYTES);
        assert_eq!(device.display(), "/dev/sdb 'BOOT' 16.0GB");
    }

    #[test]
    fn test_block_device_empty_label() {
        let device = BlockDevice::new("/dev/sdb", "  ", GIB_BYTES / 2);
        assert_eq!(device.label, NO_LABEL);
        assert_eq!(device.display(), "/dev/sdb 'No Label' 0.5GB");
    }

    #[test]
    fn test_check_capacity() {
        assert!(check_capacity(100, 100).is_ok());
        assert!(matches!(
            check_capacity(101, 100),
            Err(Error::DestinationTooSmall {
                image_size: 101,
                device_size: 100
            })
        ));
    }

    #[test]
    fn test_state_terminal() {
        assert!(!FlashState::Idle.is_terminal());
        assert!(!FlashState::Writing.is_terminal());
        assert!(FlashState::Completed.is_terminal());
        assert!(FlashState::Cancelled.is_terminal());
    }

    // -------------------------------------------------------------------------
    // Precondition tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_too_small_never_touches_device() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend.expect_list_devices().never();
        backend.expect_prepare_device().never();
        backend.expect_spawn_pipeline().never();

        let engine = engine(backend, &dir);
        let err = engine
            .flash(&image(2 * GIB_BYTES), &card(GIB_BYTES), |_| {})
            .unwrap_err();

        assert!(matches!(err, Error::DestinationTooSmall { .. }));
        assert!(!err.device_corrupted());
        assert!(engine.active_job().is_none());
    }

    #[test]
    fn test_device_gone_before_write() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend.expect_list_devices().times(1).returning(|| Ok(vec![]));
        backend.expect_prepare_device().never();
        backend.expect_spawn_pipeline().never();

        let err = engine(backend, &dir)
            .flash(&image(1024), &card(GIB_BYTES), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(ref id) if id == "/dev/sdz"));
    }

    #[test]
    fn test_device_swapped_for_smaller_card() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Ok(vec![card(512)]));
        backend.expect_spawn_pipeline().never();

        let err = engine(backend, &dir)
            .flash(&image(1024), &card(GIB_BYTES), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::DestinationTooSmall { device_size: 512, .. }));
    }

    // -------------------------------------------------------------------------
    // Pipeline tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_flash_success_reports_to_100() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Ok(vec![card(GIB_BYTES)]));
        backend.expect_prepare_device().times(1).returning(|_| Ok(()));
        backend.expect_release_device().times(1).returning(|_| Ok(()));
        backend
            .expect_spawn_pipeline()
            .with(always())
            .times(1)
            .returning(|req| {
                std::fs::write(&req.progress_log, "0.0%\n25.0%\n50.0%\n").unwrap();
                Ok(FakeProcess::boxed(success(), false, Arc::new(AtomicBool::new(false))))
            });

        let mut seen = Vec::new();
        let result = engine(backend, &dir)
            .flash(&image(4096), &card(GIB_BYTES), |p| seen.push(p.percent))
            .unwrap();

        assert_eq!(result.state, FlashState::Completed);
        assert_eq!(result.bytes_written, 4096);
        assert_eq!(result.device, "/dev/sdz");
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    #[test]
    fn test_flash_writer_failure_carries_diagnostics() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Ok(vec![card(GIB_BYTES)]));
        backend.expect_prepare_device().returning(|_| Ok(()));
        backend.expect_release_device().times(1).returning(|_| Ok(()));
        backend.expect_spawn_pipeline().returning(|_| {
            Ok(FakeProcess::boxed(
                Some(PipelineExit {
                    success: false,
                    diagnostics: "dd: error writing '/dev/sdz': No space left on device\n".to_string(),
                }),
                false,
                Arc::new(AtomicBool::new(false)),
            ))
        });

        let err = engine(backend, &dir)
            .flash(&image(4096), &card(GIB_BYTES), |_| {})
            .unwrap_err();
        match err {
            Error::WriteFailure(msg) => assert!(msg.contains("No space left")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_flash_proxy_error_line_fails() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Ok(vec![card(GIB_BYTES)]));
        backend.expect_prepare_device().returning(|_| Ok(()));
        backend.expect_release_device().returning(|_| Ok(()));
        backend.expect_spawn_pipeline().returning(|req| {
            std::fs::write(&req.progress_log, "0.0%\nERROR: read failed\n").unwrap();
            Ok(FakeProcess::boxed(None, true, Arc::new(AtomicBool::new(false))))
        });

        let err = engine(backend, &dir)
            .flash(&image(4096), &card(GIB_BYTES), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::WriteFailure(ref m) if m == "read failed"));
        assert!(err.device_corrupted());
    }

    #[test]
    fn test_flash_cancel_kills_and_releases() {
        let dir = TempDir::new().unwrap();
        let killed = Arc::new(AtomicBool::new(false));
        let killed_in_mock = Arc::clone(&killed);

        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Ok(vec![card(GIB_BYTES)]));
        backend.expect_prepare_device().returning(|_| Ok(()));
        backend.expect_release_device().times(1).returning(|_| Ok(()));
        backend.expect_spawn_pipeline().returning(move |req| {
            std::fs::write(&req.progress_log, "0.0%\n10.0%\n").unwrap();
            Ok(FakeProcess::boxed(None, true, Arc::clone(&killed_in_mock)))
        });

        let engine = engine(backend, &dir);
        let cancel = engine.cancel_handle();
        let err = engine
            .flash(&image(4096), &card(GIB_BYTES), |_| {
                cancel.store(true, Ordering::SeqCst);
            })
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(killed.load(Ordering::SeqCst));
        assert!(engine.active_job().is_none());
    }

    #[test]
    fn test_second_flash_rejected_while_writing() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Ok(vec![card(GIB_BYTES)]));
        backend.expect_prepare_device().returning(|_| Ok(()));
        backend.expect_release_device().returning(|_| Ok(()));
        backend.expect_spawn_pipeline().times(1).returning(|req| {
            std::fs::write(&req.progress_log, "0.0%\n").unwrap();
            Ok(FakeProcess::boxed(None, true, Arc::new(AtomicBool::new(false))))
        });

        let engine = engine(backend, &dir);
        let task = engine.spawn(image(4096), card(GIB_BYTES)).unwrap();

        let second = engine.flash(&image(4096), &card(GIB_BYTES), |_| {});
        assert!(matches!(second, Err(Error::FlashInProgress(ref id)) if id == "/dev/sdz"));

        // Wait until the worker is writing, then abort it
        while !engine.is_writing() && !task.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        task.cancel();
        assert!(matches!(task.join(), Err(Error::Cancelled)));
        assert!(engine.active_job().is_none());
    }

    #[test]
    fn test_progress_log_removed_after_flash() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Ok(vec![card(GIB_BYTES)]));
        backend.expect_prepare_device().returning(|_| Ok(()));
        backend.expect_release_device().returning(|_| Ok(()));
        backend
            .expect_spawn_pipeline()
            .returning(|_| Ok(FakeProcess::boxed(success(), false, Arc::new(AtomicBool::new(false)))));

        engine(backend, &dir)
            .flash(&image(10), &card(GIB_BYTES), |_| {})
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_flash_result_average_speed() {
        let result = FlashResult {
            image: PathBuf::from("a.img"),
            device: "/dev/sdz".to_string(),
            bytes_written: 10_000_000,
            elapsed: Duration::from_secs(2),
            state: FlashState::Completed,
        };
        assert_eq!(result.average_speed(), 5_000_000);
    }
}
