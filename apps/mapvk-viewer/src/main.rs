//! mapvk demo viewer
//!
//! Opens a window and clears the swapchain every frame through the mapvk
//! frame context, rebuilding the swapchain when the window is resized.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p mapvk-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--vsync`: Present with FIFO instead of mailbox/immediate
//! - `--validation`: Enable Vulkan validation layers
//! - `--size <W>x<H>`: Initial window size (default: 1280x720)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::Viewer;

/// Viewer configuration.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: "mapvk viewer".to_string(),
            width: 1280,
            height: 720,
            vsync: false,
            validation: cfg!(debug_assertions),
        }
    }
}

impl ViewerConfig {
    /// Set the window dimensions.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable vsync.
    #[must_use]
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Parse the configuration from command line arguments.
    pub fn from_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let mut args = args.into_iter().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--vsync" => config = config.with_vsync(true),
                "--validation" => config = config.with_validation(true),
                "--size" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--size needs a value like 1280x720"))?;
                    let (width, height) = parse_size(&value)?;
                    config = config.with_size(width, height);
                }
                other => anyhow::bail!("Unknown argument: {other}"),
            }
        }

        Ok(config)
    }
}

fn parse_size(value: &str) -> anyhow::Result<(u32, u32)> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| anyhow::anyhow!("Invalid size {value:?}, expected <W>x<H>"))?;
    let width: u32 = width.parse()?;
    let height: u32 = height.parse()?;
    anyhow::ensure!(width > 0 && height > 0, "Window size must not be empty");
    Ok((width, height))
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ViewerConfig::from_args(std::env::args())?;
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut viewer = Viewer::new(config);
    if let Err(e) = event_loop.run_app(&mut viewer) {
        error!("Event loop error: {e}");
    }

    Ok(())
}

fn print_help() {
    eprintln!(
        "mapvk demo viewer

USAGE:
    cargo run -p mapvk-viewer -- [OPTIONS]

OPTIONS:
    --vsync             Present with FIFO
    --validation        Enable Vulkan validation layers
    --size <W>x<H>      Initial window size (default: 1280x720)
    -h, --help          Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("mapvk-viewer")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_arguments() {
        let config = ViewerConfig::from_args(args(&[])).unwrap();
        assert_eq!((config.width, config.height), (1280, 720));
        assert!(!config.vsync);
    }

    #[test]
    fn parses_flags_and_size() {
        let config =
            ViewerConfig::from_args(args(&["--vsync", "--size", "800x600", "--validation"]))
                .unwrap();
        assert!(config.vsync);
        assert!(config.validation);
        assert_eq!((config.width, config.height), (800, 600));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ViewerConfig::from_args(args(&["--size", "800"])).is_err());
        assert!(ViewerConfig::from_args(args(&["--size", "0x600"])).is_err());
        assert!(ViewerConfig::from_args(args(&["--size"])).is_err());
        assert!(ViewerConfig::from_args(args(&["--fullscreen"])).is_err());
    }
}
