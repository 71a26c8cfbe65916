//! The primary channel's cursor, color correction and histogram blocks.
use core::fmt;

use mycelium_bitfield::bitfield;
use serde::{Deserialize, Serialize};

use super::{CapabilityError, DmaEngine, DmaError};
use crate::{
    config::DmaAddr,
    regs::{self, offset, Pair16},
};

/// Entries in each color-correction lookup table.
pub const LUT_LEN: usize = 256;
/// Bins per color component in a histogram readout.
pub const HISTOGRAM_BINS: usize = 32;

/// Handle to the extended controls of a primary [`DmaEngine`].
///
/// Returned by [`DmaEngine::extended`]. Every operation fails with
/// [`CapabilityError::NotConfigured`] until the engine is initialized.
#[derive(Copy, Clone, Debug)]
pub struct Extended<'engine> {
    engine: &'engine DmaEngine,
}

/// Hardware cursor configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Raw `CURSOR_FORMAT` value.
    pub format: u32,
    pub width: u16,
    pub height: u16,
    pub x: u16,
    pub y: u16,
    pub buf: DmaAddr,
    pub blend: CursorBlend,
}

/// How the cursor is blended over the frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CursorBlend {
    None,
    PerPixelAlpha,
    ConstantAlpha(u8),
    ColorKeying {
        transparent_color: u32,
        transparency_mask: u32,
    },
}

/// Color correction block configuration.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorCorrectConfig {
    /// Per-component LUT enables (3 bits).
    pub lut_enable: u8,
    pub ccs_enable: bool,
    pub lut_position: bool,
    pub ccs_sel: bool,
    pub pre_bias_sel: bool,
    pub post_bias_sel: bool,
    pub pre_limit_sel: bool,
    pub post_limit_sel: bool,
    pub lut_sel: bool,
}

/// Color space conversion coefficients. Each present table is written; absent
/// ones are left as they are.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Ccs {
    pub mv1: Option<[u32; 9]>,
    pub mv2: Option<[u32; 9]>,
    pub pre_bv1: Option<[u32; 3]>,
    pub pre_bv2: Option<[u32; 3]>,
    pub post_bv1: Option<[u32; 3]>,
    pub post_bv2: Option<[u32; 3]>,
    pub pre_lv1: Option<[u32; 6]>,
    pub pre_lv2: Option<[u32; 6]>,
    pub post_lv1: Option<[u32; 6]>,
    pub post_lv2: Option<[u32; 6]>,
}

/// The two color-correction lookup tables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Lut {
    pub lut1: Option<LutTable>,
    pub lut2: Option<LutTable>,
}

/// One lookup table: an entry per input level, for each color component.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LutTable {
    pub color0: [u8; LUT_LEN],
    pub color1: [u8; LUT_LEN],
    pub color2: [u8; LUT_LEN],
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramConfig {
    /// Frames to accumulate.
    pub frame_count: u32,
    /// Pixel bit mask (31 bits).
    pub bit_mask: u32,
    pub bit_mask_polarity: bool,
    pub auto_clear_en: bool,
}

/// A histogram readout.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HistogramData {
    pub r: [u32; HISTOGRAM_BINS],
    pub g: [u32; HISTOGRAM_BINS],
    pub b: [u32; HISTOGRAM_BINS],
    pub r_min: u8,
    pub r_max: u8,
    pub g_min: u8,
    pub g_max: u8,
    pub b_min: u8,
    pub b_max: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HistogramOp {
    Start,
    Stop,
    Cancel,
    Reset,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExtError {
    /// A raw histogram operation code that names no operation.
    InvalidHistogramOp(u32),
}

/// Last-applied extended configuration.
pub(super) struct ExtState {
    cursor: Option<CursorConfig>,
    color_correct: Option<ColorCorrectConfig>,
    histogram: Option<HistogramConfig>,
}

bitfield! {
    /// `DMA_P_COLOR_CORRECT_CONFIG`.
    struct ColorCorrectWord<u32> {
        const LUT_ENABLE = 3;
        const CCS_ENABLE: bool;
        const LUT_POSITION: bool;
        const CCS_SEL: bool;
        const PRE_BIAS_SEL: bool;
        const POST_BIAS_SEL: bool;
        const PRE_LIMIT_SEL: bool;
        const POST_LIMIT_SEL: bool;
        const LUT_SEL: bool;
    }
}

bitfield! {
    /// `DMA_P_HIST_EXTRA_INFO_0`/`_1`: a min/max pair per component, 5 bits
    /// each.
    struct MinMax<u32> {
        const MIN_0 = 5;
        const _RESERVED_0 = 3;
        const MAX_0 = 5;
        const _RESERVED_1 = 3;
        const MIN_1 = 5;
        const _RESERVED_2 = 3;
        const MAX_1 = 5;
    }
}

/// Histogram bit-mask polarity.
const HIST_MASK_POLARITY: u32 = 1 << 31;

// === impl Extended ===

impl<'engine> Extended<'engine> {
    pub(super) fn new(engine: &'engine DmaEngine) -> Self {
        Self { engine }
    }

    /// Programs the hardware cursor.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub fn config_cursor(&self, cursor: CursorConfig) -> Result<(), DmaError> {
        self.ensure_configured()?;
        let regs = self.engine.mdp.regs();
        regs.write(offset::DMA_P_CURSOR_FORMAT, cursor.format);
        regs.write(
            offset::DMA_P_CURSOR_SIZE,
            Pair16::pack(cursor.width, cursor.height),
        );
        regs.write(offset::DMA_P_CURSOR_BUF_ADDR, cursor.buf.0);
        regs.write(offset::DMA_P_CURSOR_POS, Pair16::pack(cursor.x, cursor.y));
        regs.write(offset::DMA_P_CURSOR_BLEND_CONFIG, cursor.blend.mode());
        regs.write(offset::DMA_P_CURSOR_BLEND_PARAM, cursor.blend.param());
        regs.write(
            offset::DMA_P_CURSOR_BLEND_TRANS_MASK,
            cursor.blend.trans_mask(),
        );
        self.with_state(|ext| ext.cursor = Some(cursor));
        Ok(())
    }

    /// Moves the cursor.
    pub fn update_cursor(&self, x: u16, y: u16) -> Result<(), DmaError> {
        self.ensure_configured()?;
        self.engine
            .mdp
            .regs()
            .write(offset::DMA_P_CURSOR_POS, Pair16::pack(x, y));
        self.with_state(|ext| {
            if let Some(cursor) = ext.cursor.as_mut() {
                cursor.x = x;
                cursor.y = y;
            }
        });
        tracing::trace!(x, y, "cursor moved");
        Ok(())
    }

    #[must_use]
    pub fn cursor(&self) -> Option<CursorConfig> {
        self.read_state(|ext| ext.cursor.clone())
    }

    /// Programs the color correction block.
    ///
    /// The CSC tables in `ccs` are written only if `config.ccs_enable` is
    /// set, and the LUTs only if `config.lut_enable` is non-zero.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, ccs, lut))]
    pub fn config_ccs(
        &self,
        config: ColorCorrectConfig,
        ccs: Option<&Ccs>,
        lut: Option<&Lut>,
    ) -> Result<(), DmaError> {
        self.ensure_configured()?;
        let word = ColorCorrectWord::new()
            .with(ColorCorrectWord::LUT_ENABLE, u32::from(config.lut_enable & 0b111))
            .with(ColorCorrectWord::CCS_ENABLE, config.ccs_enable)
            .with(ColorCorrectWord::LUT_POSITION, config.lut_position)
            .with(ColorCorrectWord::CCS_SEL, config.ccs_sel)
            .with(ColorCorrectWord::PRE_BIAS_SEL, config.pre_bias_sel)
            .with(ColorCorrectWord::POST_BIAS_SEL, config.post_bias_sel)
            .with(ColorCorrectWord::PRE_LIMIT_SEL, config.pre_limit_sel)
            .with(ColorCorrectWord::POST_LIMIT_SEL, config.post_limit_sel)
            .with(ColorCorrectWord::LUT_SEL, config.lut_sel);

        let regs = self.engine.mdp.regs();
        regs.write(offset::DMA_P_COLOR_CORRECT_CONFIG, word.bits());

        if let (true, Some(ccs)) = (config.ccs_enable, ccs) {
            let tables: [(u32, Option<&[u32]>); 10] = [
                (offset::DMA_P_CSC_MV1, ccs.mv1.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_MV2, ccs.mv2.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_PRE_BV1, ccs.pre_bv1.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_PRE_BV2, ccs.pre_bv2.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_POST_BV1, ccs.post_bv1.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_POST_BV2, ccs.post_bv2.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_PRE_LV1, ccs.pre_lv1.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_PRE_LV2, ccs.pre_lv2.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_POST_LV1, ccs.post_lv1.as_ref().map(|t| &t[..])),
                (offset::DMA_P_CSC_POST_LV2, ccs.post_lv2.as_ref().map(|t| &t[..])),
            ];
            for (start, table) in tables {
                if let Some(table) = table {
                    regs::write_seq(regs, start, table.iter().copied());
                }
            }
        }

        if let (true, Some(lut)) = (config.lut_enable != 0, lut) {
            let tables = [
                (offset::DMA_P_CSC_LUT1, lut.lut1.as_ref()),
                (offset::DMA_P_CSC_LUT2, lut.lut2.as_ref()),
            ];
            for (start, table) in tables {
                if let Some(table) = table {
                    regs::write_seq(regs, start, table.packed());
                }
            }
        }

        self.with_state(|ext| ext.color_correct = Some(config));
        Ok(())
    }

    #[must_use]
    pub fn color_correct(&self) -> Option<ColorCorrectConfig> {
        self.read_state(|ext| ext.color_correct)
    }

    /// Programs the histogram block.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub fn config_histogram(&self, config: HistogramConfig) -> Result<(), DmaError> {
        self.ensure_configured()?;
        let mut bit_mask = config.bit_mask & !HIST_MASK_POLARITY;
        if config.bit_mask_polarity {
            bit_mask |= HIST_MASK_POLARITY;
        }
        let control = u32::from(config.auto_clear_en);

        let regs = self.engine.mdp.regs();
        regs.write(offset::DMA_P_HIST_FRAME_CNT, config.frame_count);
        regs.write(offset::DMA_P_HIST_BIT_MASK, bit_mask);
        regs.write(offset::DMA_P_HIST_CONTROL, control);
        self.with_state(|ext| ext.histogram = Some(config));
        Ok(())
    }

    #[must_use]
    pub fn histogram_config(&self) -> Option<HistogramConfig> {
        self.read_state(|ext| ext.histogram)
    }

    /// Reads the accumulated histogram.
    pub fn histogram(&self) -> Result<HistogramData, DmaError> {
        self.ensure_configured()?;
        let regs = self.engine.mdp.regs();
        let mut data = HistogramData::default();
        for (start, bins) in [
            (offset::DMA_P_HIST_R_DATA, &mut data.r),
            (offset::DMA_P_HIST_G_DATA, &mut data.g),
            (offset::DMA_P_HIST_B_DATA, &mut data.b),
        ] {
            for (addr, bin) in (start..).step_by(4).zip(bins.iter_mut()) {
                *bin = regs.read(addr);
            }
        }

        // the red pair sits in the upper half of EXTRA_INFO_0.
        let r = MinMax::from_bits(regs.read(offset::DMA_P_HIST_EXTRA_INFO_0));
        data.r_min = r.get(MinMax::MIN_1) as u8;
        data.r_max = r.get(MinMax::MAX_1) as u8;
        let gb = MinMax::from_bits(regs.read(offset::DMA_P_HIST_EXTRA_INFO_1));
        data.g_min = gb.get(MinMax::MIN_0) as u8;
        data.g_max = gb.get(MinMax::MAX_0) as u8;
        data.b_min = gb.get(MinMax::MIN_1) as u8;
        data.b_max = gb.get(MinMax::MAX_1) as u8;
        Ok(data)
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub fn histogram_op(&self, op: HistogramOp) -> Result<(), DmaError> {
        self.ensure_configured()?;
        self.engine.mdp.regs().write(op.register(), 1);
        Ok(())
    }

    pub fn histogram_intr_status(&self) -> Result<u32, DmaError> {
        self.ensure_configured()?;
        Ok(self.engine.mdp.regs().read(offset::DMA_P_HIST_INTR_STATUS))
    }

    pub fn histogram_intr_enable(&self, mask: u32) -> Result<(), DmaError> {
        self.ensure_configured()?;
        self.engine
            .mdp
            .regs()
            .write(offset::DMA_P_HIST_INTR_ENABLE, mask);
        Ok(())
    }

    pub fn histogram_intr_clear(&self, mask: u32) -> Result<(), DmaError> {
        self.ensure_configured()?;
        self.engine
            .mdp
            .regs()
            .write(offset::DMA_P_HIST_INTR_CLEAR, mask);
        Ok(())
    }

    fn ensure_configured(&self) -> Result<(), DmaError> {
        let configured = critical_section::with(|cs| {
            self.engine.inner.borrow_ref(cs).session.is_some()
        });
        if configured {
            Ok(())
        } else {
            tracing::warn!(channel = %self.engine.channel, "extended feature used before init");
            Err(DmaError::Capability(CapabilityError::NotConfigured))
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut ExtState)) {
        critical_section::with(|cs| f(&mut self.engine.inner.borrow_ref_mut(cs).ext))
    }

    fn read_state<T>(&self, f: impl FnOnce(&ExtState) -> T) -> T {
        critical_section::with(|cs| f(&self.engine.inner.borrow_ref(cs).ext))
    }
}

// === impl ExtState ===

impl ExtState {
    pub(super) const fn new() -> Self {
        Self {
            cursor: None,
            color_correct: None,
            histogram: None,
        }
    }
}

// === impl CursorBlend ===

impl CursorBlend {
    /// `CURSOR_BLEND_CONFIG` mode value.
    fn mode(self) -> u32 {
        match self {
            Self::None => 0x0,
            Self::PerPixelAlpha => 0x3,
            Self::ConstantAlpha(_) => 0x5,
            Self::ColorKeying { .. } => 0x9,
        }
    }

    fn param(self) -> u32 {
        match self {
            Self::ConstantAlpha(alpha) => u32::from(alpha) << 24,
            Self::ColorKeying {
                transparent_color, ..
            } => transparent_color,
            Self::None | Self::PerPixelAlpha => 0,
        }
    }

    fn trans_mask(self) -> u32 {
        match self {
            Self::ColorKeying {
                transparency_mask, ..
            } => transparency_mask,
            _ => 0,
        }
    }
}

// === impl LutTable ===

impl LutTable {
    /// Returns the table as register words, one per input level.
    fn packed(&self) -> impl Iterator<Item = u32> + '_ {
        self.color0
            .iter()
            .zip(&self.color1)
            .zip(&self.color2)
            .map(|((&c0, &c1), &c2)| u32::from(c0) | u32::from(c1) << 8 | u32::from(c2) << 16)
    }
}

impl Default for LutTable {
    fn default() -> Self {
        Self {
            color0: [0; LUT_LEN],
            color1: [0; LUT_LEN],
            color2: [0; LUT_LEN],
        }
    }
}

// === impl HistogramOp ===

impl HistogramOp {
    fn register(self) -> u32 {
        match self {
            Self::Start => offset::DMA_P_HIST_START,
            Self::Stop => offset::DMA_P_HIST_STOP_REQ,
            Self::Cancel => offset::DMA_P_HIST_CANCEL_REQ,
            Self::Reset => offset::DMA_P_HIST_RESET_SEQ_START,
        }
    }
}

impl TryFrom<u32> for HistogramOp {
    type Error = ExtError;

    fn try_from(op: u32) -> Result<Self, Self::Error> {
        match op {
            0 => Ok(Self::Start),
            1 => Ok(Self::Stop),
            2 => Ok(Self::Cancel),
            3 => Ok(Self::Reset),
            op => Err(ExtError::InvalidHistogramOp(op)),
        }
    }
}

impl fmt::Display for ExtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHistogramOp(op) => write!(f, "invalid histogram operation {op}"),
        }
    }
}
