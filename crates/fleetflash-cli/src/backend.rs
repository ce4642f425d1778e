//! The system block-device backend
//!
//! Cards come from `fleetflash-detect`; dismounting and the privileged write
//! come from `fleetflash-platform`. A flash runs as two processes joined by a
//! pipe: the unprivileged `fleetflash-proxy` reads the image and reports
//! progress, and the platform writer copies its output to the device.

use fleetflash_core::{
    BlockDevice, BlockDeviceBackend, Error, PipelineExit, PipelineProcess, PipelineRequest, Result,
};
use fleetflash_detect::Drive;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

/// Name of the streaming proxy binary installed next to `fleetflash`
const PROXY_BIN: &str = "fleetflash-proxy";

/// Backend over the real devices of this machine
pub struct SystemBackend {
    self_exe: PathBuf,
}

impl SystemBackend {
    /// Create a backend; the current executable is needed to locate the proxy
    pub fn new() -> Result<Self> {
        Ok(Self {
            self_exe: std::env::current_exe()?,
        })
    }

    fn proxy_program(&self, configured: Option<&Path>) -> PathBuf {
        configured.map_or_else(|| sibling_binary(&self.self_exe, PROXY_BIN), Path::to_path_buf)
    }
}

/// Path of `name` in the same directory as `exe`
fn sibling_binary(exe: &Path, name: &str) -> PathBuf {
    let file = format!("{name}{}", std::env::consts::EXE_SUFFIX);
    exe.parent()
        .map_or_else(|| PathBuf::from(&file), |dir| dir.join(&file))
}

/// Convert a detected drive to the engine's device record
pub fn to_block_device(drive: &Drive) -> BlockDevice {
    let mut device = BlockDevice::new(
        drive.path.clone(),
        drive.volume_label().unwrap_or_default(),
        drive.size,
    );
    device.removable = drive.removable;
    device
}

/// Kill a child and reap it so no zombie is left behind
fn abort_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!("Kill of pid {} failed: {}", child.id(), e);
    }
    let _ = child.wait();
}

fn backend_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Io(io::Error::other(format!("{what}: {e}")))
}

impl BlockDeviceBackend for SystemBackend {
    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        let drives = fleetflash_detect::list_removable_drives()
            .map_err(|e| backend_error("Failed to list cards", e))?;
        Ok(drives.iter().map(to_block_device).collect())
    }

    fn prepare_device(&self, device: &BlockDevice) -> Result<()> {
        tracing::debug!("Dismounting {}", device.id);
        fleetflash_platform::unmount_device(&device.id)
            .map_err(|e| backend_error(&format!("Failed to dismount {}", device.id), e))
    }

    fn release_device(&self, device: &BlockDevice) -> Result<()> {
        tracing::debug!("Releasing {}", device.id);
        fleetflash_platform::remount_device(&device.id)
            .map_err(|e| backend_error(&format!("Failed to release {}", device.id), e))
    }

    fn spawn_pipeline(&self, request: &PipelineRequest) -> Result<Box<dyn PipelineProcess>> {
        let proxy_path = self.proxy_program(request.proxy_program.as_deref());
        tracing::debug!("Starting proxy {:?} for {:?}", proxy_path, request.image);

        let mut proxy = Command::new(&proxy_path)
            .arg(&request.image)
            .arg(&request.progress_log)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::WriteFailure(format!("Failed to start {}: {e}", proxy_path.display())))?;

        let Some(proxy_out) = proxy.stdout.take() else {
            abort_child(&mut proxy);
            return Err(Error::WriteFailure("proxy has no output pipe".to_string()));
        };

        let writer_cmd = fleetflash_platform::writer_command(
            &request.device.id,
            fleetflash_platform::has_elevated_privileges(),
            &self.self_exe.to_string_lossy(),
        );
        tracing::info!("Privileged writer: {}", writer_cmd);

        let writer = writer_cmd
            .command()
            .stdin(Stdio::from(proxy_out))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let writer = match writer {
            Ok(child) => child,
            Err(e) => {
                abort_child(&mut proxy);
                return Err(Error::WriteFailure(format!(
                    "Failed to start {}: {e}",
                    writer_cmd.program
                )));
            }
        };

        Ok(Box::new(ChildPipeline {
            proxy,
            writer,
            proxy_status: None,
            writer_status: None,
        }))
    }
}

/// The two running stages of a flash
struct ChildPipeline {
    proxy: Child,
    writer: Child,
    proxy_status: Option<ExitStatus>,
    writer_status: Option<ExitStatus>,
}

impl ChildPipeline {
    fn writer_diagnostics(&mut self) -> String {
        let mut text = String::new();
        if let Some(mut stderr) = self.writer.stderr.take() {
            if let Err(e) = stderr.read_to_string(&mut text) {
                tracing::debug!("Could not read writer stderr: {}", e);
            }
        }
        text
    }
}

impl PipelineProcess for ChildPipeline {
    fn try_wait(&mut self) -> io::Result<Option<PipelineExit>> {
        if self.proxy_status.is_none() {
            self.proxy_status = self.proxy.try_wait()?;
        }
        if self.writer_status.is_none() {
            self.writer_status = self.writer.try_wait()?;
        }

        let (Some(proxy), Some(writer)) = (self.proxy_status, self.writer_status) else {
            return Ok(None);
        };

        tracing::debug!("Pipeline exited: proxy {}, writer {}", proxy, writer);
        let mut diagnostics = self.writer_diagnostics();
        if !proxy.success() && diagnostics.trim().is_empty() {
            diagnostics = format!("{PROXY_BIN} exited with {proxy}");
        }

        Ok(Some(PipelineExit {
            success: proxy.success() && writer.success(),
            diagnostics,
        }))
    }

    fn kill(&mut self) -> io::Result<()> {
        // Stopping the proxy closes the pipe, which ends a writer we may not
        // be allowed to signal
        let proxy = self.proxy.kill();
        if let Err(e) = self.writer.kill() {
            tracing::debug!("Could not signal writer: {}", e);
        }
        proxy
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
