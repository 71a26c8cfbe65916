//! Display session configuration.
//!
//! Every configuration type here derives `serde`'s traits, so that a board
//! can describe its display in a TOML file. The intended flow is the same as
//! for the rest of the platform configuration: the board's `build.rs` parses
//! the TOML into a [`DisplayConfig`] and renders it to postcard, and the
//! firmware decodes the embedded blob at runtime with [`from_postcard`].
use core::fmt;

use mycelium_bitfield::enum_from_bits;
use serde::{Deserialize, Serialize};

use crate::dma::DmaChannel;

/// The bus address of a buffer the DMA engine fetches from.
///
/// The engine never dereferences this; it only writes it to hardware.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DmaAddr(pub u32);

enum_from_bits! {
    /// Pixel format of the source framebuffer.
    #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub enum SourceFormat<u8> {
        Rgb888 = 0b000,
        Rgb565 = 0b001,
        Xrgb8888 = 0b010,
    }
}

enum_from_bits! {
    /// Where a DMA channel sends its pixels.
    #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub enum OutputSelect<u8> {
        /// Memory writeback over AHB. Not supported by the engine.
        Ahb = 0b000,
        /// A DSI command-mode panel.
        DsiCmd = 0b001,
        /// The LCDC video timing generator.
        Lcdc = 0b010,
        /// A DSI video-mode panel.
        DsiVideo = 0b011,
    }
}

/// How an output paces frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputMode {
    /// A free-running timing generator raises a start-of-frame interrupt.
    Video,
    /// Each frame is an explicit transfer, triggered by software and
    /// acknowledged by a DMA-done interrupt.
    Command,
}

/// The framebuffer a DMA channel fetches from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub format: SourceFormat,
    pub width: u16,
    pub height: u16,
    /// Bytes per line.
    pub stride: u32,
    /// Output position of the top-left pixel.
    #[serde(default)]
    pub x: u16,
    #[serde(default)]
    pub y: u16,
    /// The first buffer to scan out.
    #[serde(default)]
    pub buf: DmaAddr,
}

/// How a DMA channel formats its output.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub out_sel: OutputSelect,
    #[serde(default)]
    pub dither_en: bool,
    #[serde(default)]
    pub bit_mask_polarity: bool,
    #[serde(default)]
    pub color_components_flip: bool,
    /// Component packing order (6 bits).
    pub pack_pattern: u8,
    #[serde(default)]
    pub pack_align: bool,
    /// Output bits per component (6 bits).
    pub color_comp_out_bits: u8,
}

/// Timing of a video-mode panel, shared by the LCDC and DSI video back ends.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoTiming {
    pub hsync_period: u16,
    pub hsync_pulse_width: u16,
    pub vsync_period: u32,
    pub vsync_pulse_width: u32,
    pub display_start_x: u16,
    pub display_end_x: u16,
    pub display_start_y: u32,
    pub display_end_y: u32,
    pub active_start_x: u16,
    pub active_end_x: u16,
    pub active_h_enable: bool,
    pub active_start_y: u32,
    pub active_end_y: u32,
    /// Only honored by DSI video.
    pub active_v_enable: bool,
    pub hsync_skew: u32,
    /// `true` is active-high.
    pub hsync_polarity: bool,
    pub vsync_polarity: bool,
    pub de_polarity: bool,
}

/// DSI command-mode link settings.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsiCmdConfig {
    pub primary_dsi_cmd_id: bool,
    pub secondary_dsi_cmd_id: bool,
    pub dsi_cmd_tg_intf_sel: bool,
}

/// Panel interface configuration, one variant per back end.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IntfConfig {
    Lcdc(VideoTiming),
    DsiVideo(VideoTiming),
    DsiCmd(DsiCmdConfig),
}

/// Pacing of the quiescence poll in [`DmaEngine::stop`](crate::DmaEngine::stop).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopPoll {
    /// Sleep between polls. Zero polls back to back, counting each poll as
    /// 1 µs against the timeout.
    pub interval_us: u32,
    pub timeout_us: u32,
}

/// A complete display session description, as found in a board config.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayConfig {
    pub channel: DmaChannel,
    pub source: SourceConfig,
    pub output: OutputConfig,
    pub panel: IntfConfig,
    #[serde(default)]
    pub stop_poll: StopPoll,
}

#[derive(Debug, PartialEq)]
pub enum Error {
    Postcard(postcard::Error),
}

/// Decodes a postcard-rendered [`DisplayConfig`].
pub fn from_postcard(bytes: &[u8]) -> Result<DisplayConfig, Error> {
    postcard::from_bytes(bytes).map_err(Error::Postcard)
}

// === impl OutputSelect ===

impl OutputSelect {
    /// Returns how this output paces frames, or `None` for outputs the
    /// engine cannot drive.
    #[must_use]
    pub const fn mode(self) -> Option<OutputMode> {
        match self {
            Self::Lcdc | Self::DsiVideo => Some(OutputMode::Video),
            Self::DsiCmd => Some(OutputMode::Command),
            Self::Ahb => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_command_mode(self) -> bool {
        matches!(self, Self::DsiCmd)
    }
}

impl fmt::Display for OutputSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ahb => "AHB",
            Self::DsiCmd => "DSI command",
            Self::Lcdc => "LCDC",
            Self::DsiVideo => "DSI video",
        };
        f.write_str(name)
    }
}

// === impl IntfConfig ===

impl IntfConfig {
    /// Returns the DMA output this panel is fed by.
    #[must_use]
    pub const fn output(&self) -> OutputSelect {
        match self {
            Self::Lcdc(_) => OutputSelect::Lcdc,
            Self::DsiVideo(_) => OutputSelect::DsiVideo,
            Self::DsiCmd(_) => OutputSelect::DsiCmd,
        }
    }
}

// === impl StopPoll ===

impl StopPoll {
    pub const DEFAULT: Self = Self {
        interval_us: 1000,
        timeout_us: 16000,
    };
}

impl Default for StopPoll {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// === impl Error ===

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postcard(e) => write!(f, "failed to decode display config: {e}"),
        }
    }
}
