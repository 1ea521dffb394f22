use tracing::{info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(uptime())
        .init();

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
}

/// Pin the calling thread to `core`. Returns whether pinning succeeded.
pub fn pin_current_thread(core: usize) -> bool {
    let found = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().find(|id| id.id == core));
    let Some(id) = found else {
        warn!("CPU core {} not available, thread stays unpinned", core);
        return false;
    };
    let pinned = core_affinity::set_for_current(id);
    if pinned {
        info!("Pinned {:?} to core {}", std::thread::current().name(), core);
    }
    pinned
}

/// Find the first capture device offering a packed format we can read
#[cfg(feature = "v4l2")]
pub fn auto_detect_device() -> crate::Result<String> {
    use std::path::Path;

    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    info!("Auto-detecting capture devices...");

    let wanted = [FourCC::new(b"UYVY"), FourCC::new(b"YUYV"), FourCC::new(b"RGB3")];
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            if let Some(fmt) = formats.iter().find(|f| wanted.contains(&f.fourcc)) {
                info!("Found {} device: {} - {}", fmt.fourcc, path, caps.card);
                return Ok(path);
            }
        }
    }

    Err(crate::Error::Config("no suitable capture device found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_core_is_not_pinned() {
        assert!(!pin_current_thread(usize::MAX));
    }
}
