//! Panel interfaces: the timing generators and command-mode link that sit
//! between a DMA channel and the panel.
//!
//! There are three back ends. [`VideoPanel`] drives either the LCDC or the
//! DSI video timing generator. [`CommandPanel`] is the DSI command-mode link,
//! which has no timing generator to start. [`PanelInterface`] wraps whichever
//! one a board's [`IntfConfig`] selects. A [`DmaEngine`](crate::DmaEngine)
//! borrows the session's panel through the [`Panel`] trait while it starts
//! and stops.
use core::fmt;

use mycelium_bitfield::bitfield;

use crate::{
    config::{DsiCmdConfig, IntfConfig, OutputSelect, VideoTiming},
    regs::{offset, Pair16},
    Mdp,
};

/// The uniform start/stop contract of a panel back end.
pub trait Panel {
    /// The DMA output that feeds this panel.
    fn output(&self) -> OutputSelect;

    fn start(&mut self) -> Result<(), IntfError>;

    fn stop(&mut self) -> Result<(), IntfError>;

    fn is_active(&self) -> bool;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IntfError {
    /// Started before any configuration was applied.
    NotConfigured,
    /// Reconfigured while running.
    Active,
    /// A configuration for a different kind of panel.
    KindMismatch {
        expected: OutputSelect,
        actual: OutputSelect,
    },
}

/// A video-mode timing generator (LCDC or DSI video).
#[derive(Debug)]
pub struct VideoPanel {
    mdp: Mdp,
    output: OutputSelect,
    base: u32,
    timing: Option<VideoTiming>,
    active: bool,
}

/// The DSI command-mode link.
#[derive(Debug)]
pub struct CommandPanel {
    mdp: Mdp,
    config: Option<DsiCmdConfig>,
    active: bool,
}

/// Whichever panel back end a board uses.
#[derive(Debug)]
pub enum PanelInterface {
    Video(VideoPanel),
    Command(CommandPanel),
}

bitfield! {
    /// `CTL_POLARITY`. A set bit makes the signal active-low.
    struct Polarity<u32> {
        const HSYNC_LOW: bool;
        const VSYNC_LOW: bool;
        const DE_LOW: bool;
    }
}

bitfield! {
    /// `DSI_CMD_MODE_ID_MAP`.
    struct IdMap<u32> {
        const PRIMARY: bool;
        const _RESERVED_0 = 3;
        const SECONDARY: bool;
    }
}

/// Window enable, in `ACTIVE_HCTL` and (DSI video) `ACTIVE_V_START`.
const WINDOW_EN: u32 = 1 << 31;
/// `TRIGGER_EN`: triggers come from the timing generator interface.
const TG_INTF_SEL: u32 = 1 << 4;
/// `DSI_VIDEO_UNDERFLOW_CTL`: underflow recovery on, border color 0xff.
const DSI_VIDEO_UNDERFLOW_CTL: u32 = 0x8000_00ff;

// === impl VideoPanel ===

impl VideoPanel {
    #[must_use]
    pub fn lcdc(mdp: Mdp) -> Self {
        Self::new(mdp, OutputSelect::Lcdc, offset::LCDC_BASE)
    }

    #[must_use]
    pub fn dsi_video(mdp: Mdp) -> Self {
        Self::new(mdp, OutputSelect::DsiVideo, offset::DSI_VIDEO_BASE)
    }

    fn new(mdp: Mdp, output: OutputSelect, base: u32) -> Self {
        Self {
            mdp,
            output,
            base,
            timing: None,
            active: false,
        }
    }

    /// Programs the timing generator. Not allowed while it runs.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, timing), fields(output = %self.output))]
    pub fn configure(&mut self, timing: VideoTiming) -> Result<(), IntfError> {
        if self.active {
            return Err(IntfError::Active);
        }

        use offset::timing as reg;
        let regs = self.mdp.regs();
        let write = |off: u32, value: u32| regs.write(self.base + off, value);
        let dsi = self.output == OutputSelect::DsiVideo;

        write(
            reg::HSYNC_CTL,
            Pair16::pack(timing.hsync_pulse_width, timing.hsync_period),
        );
        write(reg::VSYNC_PERIOD, timing.vsync_period);
        write(reg::VSYNC_PULSE_WIDTH, timing.vsync_pulse_width);
        write(
            reg::DISPLAY_HCTL,
            Pair16::pack(timing.display_start_x, timing.display_end_x),
        );
        write(reg::DISPLAY_V_START, timing.display_start_y);
        write(reg::DISPLAY_V_END, timing.display_end_y);

        let mut active_hctl = Pair16::pack(timing.active_start_x, timing.active_end_x);
        if timing.active_h_enable {
            active_hctl |= WINDOW_EN;
        }
        write(reg::ACTIVE_HCTL, active_hctl);

        let mut active_v_start = timing.active_start_y;
        if dsi && timing.active_v_enable {
            active_v_start |= WINDOW_EN;
        }
        write(reg::ACTIVE_V_START, active_v_start);
        write(reg::ACTIVE_V_END, timing.active_end_y);
        write(reg::HSYNC_SKEW, timing.hsync_skew);

        let polarity = Polarity::new()
            .with(Polarity::HSYNC_LOW, !timing.hsync_polarity)
            .with(Polarity::VSYNC_LOW, !timing.vsync_polarity)
            .with(Polarity::DE_LOW, !timing.de_polarity);
        write(reg::CTL_POLARITY, polarity.bits());

        if dsi {
            write(reg::UNDERFLOW_CTL, DSI_VIDEO_UNDERFLOW_CTL);
        }

        tracing::debug!(?polarity, "timing programmed");
        self.timing = Some(timing);
        Ok(())
    }

    #[must_use]
    pub fn timing(&self) -> Option<&VideoTiming> {
        self.timing.as_ref()
    }

    fn set_enabled(&mut self, enabled: bool) {
        let regs = self.mdp.regs();
        regs.write(self.base + offset::timing::EN, u32::from(enabled));
        regs.wmb();
        self.active = enabled;
    }
}

impl Panel for VideoPanel {
    fn output(&self) -> OutputSelect {
        self.output
    }

    fn start(&mut self) -> Result<(), IntfError> {
        if self.timing.is_none() {
            return Err(IntfError::NotConfigured);
        }
        tracing::debug!(output = %self.output, "timing generator on");
        self.set_enabled(true);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IntfError> {
        tracing::debug!(output = %self.output, "timing generator off");
        self.set_enabled(false);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

// === impl CommandPanel ===

impl CommandPanel {
    #[must_use]
    pub fn new(mdp: Mdp) -> Self {
        Self {
            mdp,
            config: None,
            active: false,
        }
    }

    /// Programs the command-mode ID map and trigger source.
    pub fn configure(&mut self, config: DsiCmdConfig) -> Result<(), IntfError> {
        if self.active {
            return Err(IntfError::Active);
        }

        let id_map = IdMap::new()
            .with(IdMap::PRIMARY, config.primary_dsi_cmd_id)
            .with(IdMap::SECONDARY, config.secondary_dsi_cmd_id);
        let trigger_en = if config.dsi_cmd_tg_intf_sel {
            TG_INTF_SEL
        } else {
            0
        };

        let regs = self.mdp.regs();
        regs.write(offset::DSI_CMD_MODE_ID_MAP, id_map.bits());
        regs.write(offset::DSI_CMD_MODE_TRIGGER_EN, trigger_en);
        self.config = Some(config);
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> Option<&DsiCmdConfig> {
        self.config.as_ref()
    }
}

impl Panel for CommandPanel {
    fn output(&self) -> OutputSelect {
        OutputSelect::DsiCmd
    }

    fn start(&mut self) -> Result<(), IntfError> {
        if self.config.is_none() {
            return Err(IntfError::NotConfigured);
        }
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IntfError> {
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

// === impl PanelInterface ===

impl PanelInterface {
    /// Builds the back end `config` selects and applies `config` to it.
    pub fn init(mdp: Mdp, config: &IntfConfig) -> Result<Self, IntfError> {
        let mut intf = match config {
            IntfConfig::Lcdc(_) => Self::Video(VideoPanel::lcdc(mdp)),
            IntfConfig::DsiVideo(_) => Self::Video(VideoPanel::dsi_video(mdp)),
            IntfConfig::DsiCmd(_) => Self::Command(CommandPanel::new(mdp)),
        };
        intf.configure(config)?;
        Ok(intf)
    }

    /// Re-applies a configuration of the same kind.
    pub fn configure(&mut self, config: &IntfConfig) -> Result<(), IntfError> {
        let expected = self.output();
        let actual = config.output();
        if expected != actual {
            return Err(IntfError::KindMismatch { expected, actual });
        }

        match (self, config) {
            (Self::Video(panel), IntfConfig::Lcdc(timing) | IntfConfig::DsiVideo(timing)) => {
                panel.configure(timing.clone())
            }
            (Self::Command(panel), IntfConfig::DsiCmd(cmd)) => panel.configure(cmd.clone()),
            _ => Err(IntfError::KindMismatch { expected, actual }),
        }
    }

    /// Returns the last applied configuration.
    #[must_use]
    pub fn config(&self) -> Option<IntfConfig> {
        match self {
            Self::Video(panel) => {
                let timing = panel.timing.clone()?;
                Some(match panel.output {
                    OutputSelect::DsiVideo => IntfConfig::DsiVideo(timing),
                    _ => IntfConfig::Lcdc(timing),
                })
            }
            Self::Command(panel) => panel.config.clone().map(IntfConfig::DsiCmd),
        }
    }

    fn panel(&self) -> &dyn Panel {
        match self {
            Self::Video(panel) => panel,
            Self::Command(panel) => panel,
        }
    }

    fn panel_mut(&mut self) -> &mut dyn Panel {
        match self {
            Self::Video(panel) => panel,
            Self::Command(panel) => panel,
        }
    }
}

impl Panel for PanelInterface {
    fn output(&self) -> OutputSelect {
        self.panel().output()
    }

    fn start(&mut self) -> Result<(), IntfError> {
        self.panel_mut().start()
    }

    fn stop(&mut self) -> Result<(), IntfError> {
        self.panel_mut().stop()
    }

    fn is_active(&self) -> bool {
        self.panel().is_active()
    }
}

// === impl IntfError ===

impl fmt::Display for IntfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => f.write_str("panel interface is not configured"),
            Self::Active => f.write_str("can't reconfigure a running panel interface"),
            Self::KindMismatch { expected, actual } => {
                write!(f, "expected a {expected} configuration, got {actual}")
            }
        }
    }
}
