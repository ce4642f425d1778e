//! Session context tying the components together
//!
//! A [`Session`] holds the runtime configuration, the platform backend, the
//! last device list and the flash engine. Callers pass it around instead of
//! reaching for global state. Long operations return a [`Task`].

use crate::builder::{BuildProgress, ImageBuilder};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flash::{BlockDevice, BlockDeviceBackend, FlashEngine, FlashProgress, FlashResult};
use crate::image::{BaseImage, NodeImage};
use crate::network::{validate, NetworkConfig};
use crate::task::Task;
use crate::verifier::{locate_checksum_record, ChecksumRecord, Verifier};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Clears the verify-busy flag when the worker ends
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Explicit context for one user session
pub struct Session {
    config: Config,
    backend: Arc<dyn BlockDeviceBackend>,
    engine: FlashEngine,
    devices: Mutex<Vec<BlockDevice>>,
    verify_busy: Arc<AtomicBool>,
}

impl Session {
    /// Create a session; the configuration is validated first
    pub fn new(config: Config, backend: Arc<dyn BlockDeviceBackend>) -> Result<Self> {
        config.validate()?;
        let engine = FlashEngine::new(Arc::clone(&backend), config.flash_config());
        Ok(Self {
            config,
            backend,
            engine,
            devices: Mutex::new(Vec::new()),
            verify_busy: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runtime configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The flash engine
    pub fn engine(&self) -> &FlashEngine {
        &self.engine
    }

    /// Validate raw network input
    pub fn validate_network(
        &self,
        gw: &str,
        dns: &str,
        manager: &str,
        node_count: u32,
    ) -> Result<NetworkConfig> {
        Ok(validate(gw, dns, manager, node_count)?)
    }

    /// Refresh and return the removable device list
    ///
    /// While a flash is unfinished (dismount and release included) the cached
    /// list is returned untouched, so the target is never re-queried.
    /// Enumeration failures yield an empty list.
    pub fn poll_devices(&self) -> Vec<BlockDevice> {
        let mut cached = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(_quiet) = self.engine.quiesce() else {
            tracing::debug!("Flash in progress, keeping cached device list");
            return cached.clone();
        };

        *cached = match self.backend.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Device enumeration failed: {}", e);
                Vec::new()
            }
        };
        cached.clone()
    }

    /// Last device list without re-enumerating
    pub fn cached_devices(&self) -> Vec<BlockDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Find the checksum record in the download directory
    pub fn locate_checksum(&self) -> Result<ChecksumRecord> {
        locate_checksum_record(&self.config.download_dir)
    }

    /// Verify `image` against `record` on a worker
    ///
    /// Events are completed fractions (0.0 to 1.0). Only one verification may
    /// run at a time.
    pub fn spawn_verify(&self, image: PathBuf, record: ChecksumRecord) -> Result<Task<f64, bool>> {
        if self.verify_busy.swap(true, Ordering::SeqCst) {
            return Err(Error::VerifyInProgress);
        }
        let guard = BusyGuard(Arc::clone(&self.verify_busy));
        let config = self.config.verify_config();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);

        Task::spawn("fleetflash-verify", cancel, move |tx| {
            let _guard = guard;
            let mut verifier = Verifier::with_config(config)
                .with_cancel_flag(worker_cancel)
                .on_progress(move |p| {
                    let _ = tx.send(p.fraction());
                });
            verifier.verify(&image, record.algorithm, &record.expected_hex)
        })
    }

    /// Verify the image named by the download directory's checksum file
    pub fn spawn_verify_download(&self) -> Result<Task<f64, bool>> {
        let record = self.locate_checksum()?;
        let image = self.config.download_dir.join(&record.file_name);
        self.spawn_verify(image, record)
    }

    /// Build all role images on a worker
    pub fn spawn_build(
        &self,
        base: BaseImage,
        network: NetworkConfig,
        dest_dir: Option<&Path>,
    ) -> Result<Task<BuildProgress, Vec<NodeImage>>> {
        let dest = dest_dir.map_or_else(|| self.config.build_dir.clone(), Path::to_path_buf);
        let config = self.config.build_config();
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);

        Task::spawn("fleetflash-build", cancel, move |tx| {
            let mut builder = ImageBuilder::with_config(config)
                .with_cancel_flag(worker_cancel)
                .on_progress(move |p| {
                    let _ = tx.send(p.clone());
                });
            builder.build(&base, &network, &dest)
        })
    }

    /// Flash `image` to `device` on a worker
    pub fn spawn_flash(
        &self,
        image: NodeImage,
        device: BlockDevice,
    ) -> Result<Task<FlashProgress, FlashResult>> {
        self.engine.spawn(image, device)
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MockBlockDeviceBackend;
    use crate::network::Role;
    use crate::verifier::ChecksumAlgorithm;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn session(backend: MockBlockDeviceBackend, dir: &TempDir) -> Session {
        let config = Config::new()
            .config_offset(4096)
            .poll_interval(Duration::from_millis(1))
            .download_dir(dir.path().join("downloaded"))
            .build_dir(dir.path().join("final"));
        Session::new(config, Arc::new(backend)).unwrap()
    }

    // -------------------------------------------------------------------------
    // Construction tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_session_rejects_invalid_config() {
        let result = Session::new(
            Config::new().config_offset(3),
            Arc::new(MockBlockDeviceBackend::new()),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_network_reason() {
        let dir = TempDir::new().unwrap();
        let session = session(MockBlockDeviceBackend::new(), &dir);
        let err = session
            .validate_network("192.168.1.1", "8.8.8.8", "192.168.0.2", 2)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The manager and the gw are not in the same sub-net"
        );
        assert!(!dir.path().join("final").exists());
    }

    // -------------------------------------------------------------------------
    // Device poll tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_poll_devices_refreshes_cache() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .times(1)
            .returning(|| Ok(vec![BlockDevice::new("/dev/sdb", "", 1 << 30)]));

        let session = session(backend, &dir);
        let devices = session.poll_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(session.cached_devices(), devices);
    }

    #[test]
    fn test_poll_devices_error_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut backend = MockBlockDeviceBackend::new();
        backend
            .expect_list_devices()
            .returning(|| Err(Error::Io(std::io::Error::other("udev hiccup"))));

        let session = session(backend, &dir);
        assert!(session.poll_devices().is_empty());
    }

    #[test]
    fn test_poll_devices_waits_out_dismount() {
        let dir = TempDir::new().unwrap();
        let card = BlockDevice::new("/dev/sdb", "BOOT", 1 << 30);
        let listed = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        let mut backend = MockBlockDeviceBackend::new();
        let counter = Arc::clone(&listed);
        let listing = card.clone();
        backend.expect_list_devices().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![listing.clone()])
        });
        // Dismount parks until the test lets it fail
        backend.expect_prepare_device().times(1).returning(move |_| {
            let _ = entered_tx.send(());
            let _ = resume_rx.recv();
            Err(Error::Io(std::io::Error::other("dismount refused")))
        });

        let session = session(backend, &dir);
        let image = NodeImage {
            path: dir.path().join("Skybian-manager.img"),
            role: Role::Manager,
            size: 4096,
        };
        let task = session.spawn_flash(image, card.clone()).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let before = listed.load(Ordering::SeqCst);
        assert!(session.poll_devices().is_empty());
        assert_eq!(listed.load(Ordering::SeqCst), before);

        resume_tx.send(()).unwrap();
        assert!(task.join().is_err());
        assert_eq!(session.poll_devices(), vec![card]);
        assert_eq!(listed.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_poll_devices_skipped_for_claimed_job() {
        let dir = TempDir::new().unwrap();
        let listed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&listed);
        let mut backend = MockBlockDeviceBackend::new();
        backend.expect_list_devices().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        });

        let session = session(backend, &dir);
        let card = BlockDevice::new("/dev/sdb", "BOOT", 1 << 30);
        let image = NodeImage {
            path: dir.path().join("Skybian-manager.img"),
            role: Role::Manager,
            size: 4096,
        };
        // Holding the device side keeps the worker short of its target lookup
        let hold = session.engine().quiesce().unwrap();
        let task = session.spawn_flash(image, card).unwrap();
        assert!(session.engine().is_busy());
        assert!(session.poll_devices().is_empty());
        assert_eq!(listed.load(Ordering::SeqCst), 0);

        drop(hold);
        assert!(matches!(task.join(), Err(Error::DeviceNotFound(_))));
        assert_eq!(listed.load(Ordering::SeqCst), 1);
    }

    // -------------------------------------------------------------------------
    // Worker tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_spawn_verify_download() {
        let dir = TempDir::new().unwrap();
        let download = dir.path().join("downloaded");
        std::fs::create_dir_all(&download).unwrap();
        std::fs::write(download.join("Skybian.img"), b"").unwrap();
        std::fs::write(
            download.join("Skybian.img.md5"),
            format!("{EMPTY_MD5} *Skybian.img\n"),
        )
        .unwrap();

        let session = session(MockBlockDeviceBackend::new(), &dir);
        let task = session.spawn_verify_download().unwrap();
        assert!(task.join().unwrap());
    }

    #[test]
    fn test_second_verify_rejected() {
        let dir = TempDir::new().unwrap();
        let session = session(MockBlockDeviceBackend::new(), &dir);
        let record = ChecksumRecord {
            algorithm: ChecksumAlgorithm::Md5,
            expected_hex: EMPTY_MD5.to_string(),
            file_name: "missing.img".to_string(),
        };

        // Flag held by hand so the first worker cannot finish first
        session.verify_busy.store(true, Ordering::SeqCst);
        let second = session.spawn_verify(dir.path().join("missing.img"), record.clone());
        assert!(matches!(second, Err(Error::VerifyInProgress)));

        session.verify_busy.store(false, Ordering::SeqCst);
        let task = session
            .spawn_verify(dir.path().join("missing.img"), record)
            .unwrap();
        assert!(matches!(task.join(), Err(Error::Io(_))));
        assert!(!session.verify_busy.load(Ordering::SeqCst));
    }

    #[test]
    fn test_spawn_build_events_and_images() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("base.img");
        std::fs::write(&base_path, vec![0x5Au8; 8192]).unwrap();

        let session = session(MockBlockDeviceBackend::new(), &dir);
        let network = session
            .validate_network("10.0.0.1", "1.1.1.1", "10.0.0.10", 1)
            .unwrap();
        let base = BaseImage::open(&base_path, 4096).unwrap();

        let task = session.spawn_build(base, network, None).unwrap();
        let events: Vec<BuildProgress> = task.events().iter().collect();
        let images = task.join().unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(images[1].role, Role::Node(1));
        assert!(images[1].path.starts_with(dir.path().join("final")));
        assert!(events.iter().any(|e| e.role == Role::Node(1)));
    }

    #[test]
    fn test_spawn_build_cancelled() {
        let dir = TempDir::new().unwrap();
        let base_path = dir.path().join("base.img");
        std::fs::write(&base_path, vec![0u8; 64 * 1024]).unwrap();

        let session = session(MockBlockDeviceBackend::new(), &dir);
        let network = session
            .validate_network("10.0.0.1", "1.1.1.1", "10.0.0.10", 3)
            .unwrap();
        let base = BaseImage::open(&base_path, 4096).unwrap();

        let task = session.spawn_build(base, network, None).unwrap();
        task.cancel();
        // Cancel may land after a fast build has already finished
        match task.join() {
            Ok(images) => assert_eq!(images.len(), 4),
            Err(e) => assert!(matches!(e, Error::Cancelled)),
        }
    }
}
