pub mod capture;
pub mod error;
pub mod ipc;
pub mod overlay;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::frame::{ImageGeometry, MAX_IMAGE_HEIGHT, MAX_IMAGE_WIDTH};
use ipc::state::{ApplicationState, Perspective};
use serde::{Deserialize, Serialize};

pub use error::{Error, NackReason, Result};

/// Environment variable naming an optional configuration file
pub const CONFIG_ENV: &str = "SIGHTLINE_CONFIG";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub processing: ProcessingConfig,
    pub overlay: OverlayConfig,
    pub ipc: IpcConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// `test-pattern`, `auto` or a device path such as `/dev/video0`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub colors: u8,
    pub fps: u32,
    /// Consecutive stalled captures before the pool counts as exhausted
    pub max_capture_stalls: u32,
}

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSource {
    TestPattern,
    Auto,
    Device(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub threshold: i32,
    pub exposure_time_us: u32,
    pub perspective: Perspective,
    /// Running-average update rate out of 256
    pub background_weight: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub max_commands: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Undrained replies the transport holds before reporting busy
    pub reply_slots: usize,
    /// Period of the built-in status poller, 0 disables it
    pub status_poll_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    /// CPU core for the control thread
    #[serde(default)]
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, `RUST_LOG` takes precedence
    pub filter: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "test-pattern".into(),
            width: MAX_IMAGE_WIDTH,
            height: MAX_IMAGE_HEIGHT,
            colors: 1,
            fps: 30,
            max_capture_stalls: 500,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            threshold: 40,
            exposure_time_us: 10_000,
            perspective: Perspective::Default,
            background_weight: 16,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { max_commands: 256 }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            reply_slots: 1,
            status_poll_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "sightline=info".into(),
        }
    }
}

impl CameraConfig {
    pub fn source(&self) -> CameraSource {
        match self.device.as_str() {
            "test-pattern" => CameraSource::TestPattern,
            "auto" | "" => CameraSource::Auto,
            path => CameraSource::Device(PathBuf::from(path)),
        }
    }
}

impl Config {
    /// Layer built-in defaults, an optional TOML file and `SIGHTLINE_*`
    /// environment variables, e.g. `SIGHTLINE_CAMERA__FPS=15`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("SIGHTLINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.width == 0
            || camera.height == 0
            || camera.width > MAX_IMAGE_WIDTH
            || camera.height > MAX_IMAGE_HEIGHT
        {
            return Err(Error::Config(format!(
                "resolution {}x{} outside 1x1..{}x{}",
                camera.width, camera.height, MAX_IMAGE_WIDTH, MAX_IMAGE_HEIGHT
            )));
        }
        if !matches!(camera.colors, 1 | 3) {
            return Err(Error::Config(format!(
                "unsupported color count {}",
                camera.colors
            )));
        }
        if camera.fps == 0 || camera.max_capture_stalls == 0 {
            return Err(Error::Config(
                "camera fps and max_capture_stalls must be positive".into(),
            ));
        }
        if self.overlay.max_commands == 0 || self.ipc.reply_slots == 0 {
            return Err(Error::Config(
                "overlay and reply capacities must be positive".into(),
            ));
        }
        let processing = &self.processing;
        if !(0..=255).contains(&processing.threshold) {
            return Err(Error::Config(format!(
                "threshold {} outside 0..=255",
                processing.threshold
            )));
        }
        if processing.exposure_time_us == 0 || processing.background_weight == 0 {
            return Err(Error::Config(
                "exposure time and background weight must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn geometry(&self) -> ImageGeometry {
        ImageGeometry::new(self.camera.width, self.camera.height, self.camera.colors)
    }

    /// Status the appliance starts with
    pub fn initial_state(&self) -> ApplicationState {
        ApplicationState {
            threshold: self.processing.threshold,
            exposure_time_us: self.processing.exposure_time_us,
            perspective: self.processing.perspective,
            width: self.camera.width as u16,
            height: self.camera.height as u16,
            ..Default::default()
        }
    }
}
