//! Caller-visible camera parameters
//!
//! `CameraAdapter::set_parameters` diffs the incoming set against the live
//! one; every changed axis becomes a pending bit for the settings applier.

use serde::{Deserialize, Serialize};

use crate::capture::bracketing::{parse_bracketing_range, BracketEntry};
use crate::capture::frame::PixelFormat;
use crate::error::{AdapterError, Result};
use crate::pipeline::settings::{CaptureSettings, PreviewSettings, Settings3A};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    #[default]
    HighQuality,
    HighQualityZsl,
    HighSpeed,
    Video,
    VideoHighQuality,
    CpCam,
}

impl CaptureMode {
    /// Modes where the shutter is inferred from tagged preview frames
    pub fn passive_shutter(self) -> bool {
        matches!(
            self,
            CaptureMode::HighSpeed | CaptureMode::Video | CaptureMode::VideoHighQuality
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SceneMode {
    #[default]
    Manual,
    Portrait,
    Landscape,
    Night,
    Sport,
    Snow,
    Sunset,
    Party,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhiteBalance {
    #[default]
    Auto,
    Daylight,
    Cloudy,
    Fluorescent,
    Incandescent,
    Shade,
    Twilight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Flicker {
    Off,
    #[default]
    Auto,
    Hz50,
    Hz60,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExposureMode {
    #[default]
    Auto,
    Macro,
    Portrait,
    Landscape,
    Sports,
    Night,
    Backlighting,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    #[default]
    None,
    Mono,
    Negative,
    Sepia,
    Solarize,
    Aqua,
    Posterize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FocusMode {
    #[default]
    Auto,
    Infinity,
    Macro,
    ContinuousPicture,
    ContinuousVideo,
    Fixed,
    Edof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashMode {
    #[default]
    Off,
    On,
    Auto,
    Torch,
    RedEye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseFilter {
    Off,
    On,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringArea {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewParams {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub max_fps: u32,
    pub min_fps: u32,
    pub ldc: bool,
    pub nsf: NoiseFilter,
    pub vnf: bool,
    pub vstab: bool,
    pub capture_mode: CaptureMode,
    /// Enable the measurement port alongside preview
    pub measurement: bool,
}

impl Default for PreviewParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: PixelFormat::Nv12,
            max_fps: 30,
            min_fps: 15,
            ldc: false,
            nsf: NoiseFilter::Auto,
            vnf: false,
            vstab: false,
            capture_mode: CaptureMode::HighQuality,
            measurement: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PictureParams {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub quality: u8,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub rotation: u32,
    pub burst: u32,
    /// Exposure (or exposure/gain pair) bracketing range, empty when off
    pub bracketing: String,
}

impl Default for PictureParams {
    fn default() -> Self {
        Self {
            width: 2592,
            height: 1944,
            format: PixelFormat::Jpeg,
            quality: 95,
            thumbnail_width: 160,
            thumbnail_height: 120,
            rotation: 0,
            burst: 1,
            bracketing: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreeA {
    pub scene: SceneMode,
    pub ev_compensation: i32,
    pub white_balance: WhiteBalance,
    pub flicker: Flicker,
    pub exposure_mode: ExposureMode,
    pub sharpness: i32,
    pub brightness: i32,
    pub contrast: i32,
    pub iso: u32,
    pub saturation: i32,
    pub effect: Effect,
    pub focus_mode: FocusMode,
    pub flash: FlashMode,
    pub exposure_lock: bool,
    pub white_balance_lock: bool,
    pub metering_areas: Vec<MeteringArea>,
    pub manual_exposure_us: u32,
    pub manual_gain: u32,
}

impl Default for ThreeA {
    fn default() -> Self {
        Self {
            scene: SceneMode::Manual,
            ev_compensation: 0,
            white_balance: WhiteBalance::Auto,
            flicker: Flicker::Auto,
            exposure_mode: ExposureMode::Auto,
            sharpness: 0,
            brightness: 50,
            contrast: 0,
            iso: 0,
            saturation: 0,
            effect: Effect::None,
            focus_mode: FocusMode::Auto,
            flash: FlashMode::Off,
            exposure_lock: false,
            white_balance_lock: false,
            metering_areas: Vec::new(),
            manual_exposure_us: 0,
            manual_gain: 0,
        }
    }
}

/// Full parameter set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub preview: PreviewParams,
    pub picture: PictureParams,
    pub three_a: ThreeA,
}

impl Parameters {
    /// Parsed bracketing entries, empty when bracketing is off
    pub fn bracket_entries(&self) -> Result<Vec<BracketEntry>> {
        parse_bracketing_range(&self.picture.bracketing)
    }

    /// Reject values the adapter can't act on, before any side effect
    pub fn validate(&self, max_bracket_entries: usize) -> Result<Vec<BracketEntry>> {
        if self.preview.width == 0 || self.preview.height == 0 {
            return Err(AdapterError::BadValue(format!(
                "preview size {}x{}",
                self.preview.width, self.preview.height
            )));
        }
        if self.picture.width == 0 || self.picture.height == 0 {
            return Err(AdapterError::BadValue(format!(
                "picture size {}x{}",
                self.picture.width, self.picture.height
            )));
        }
        if self.preview.min_fps > self.preview.max_fps {
            return Err(AdapterError::BadValue(format!(
                "fps range {}..{}",
                self.preview.min_fps, self.preview.max_fps
            )));
        }
        if !matches!(self.picture.rotation, 0 | 90 | 180 | 270) {
            return Err(AdapterError::BadValue(format!(
                "rotation {}",
                self.picture.rotation
            )));
        }
        let entries = self.bracket_entries()?;
        if entries.len() > max_bracket_entries {
            return Err(AdapterError::ResourceExhausted(format!(
                "{} bracketing entries, shot queue holds {}",
                entries.len(),
                max_bracket_entries
            )));
        }
        Ok(entries)
    }

    /// Normalised copy: out-of-range quality falls back to 100, zero burst to 1
    pub fn normalized(mut self) -> Self {
        if self.picture.quality == 0 || self.picture.quality > 100 {
            self.picture.quality = 100;
        }
        if self.picture.burst == 0 {
            self.picture.burst = 1;
        }
        self
    }
}

/// Pending bits produced by a parameter change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDiff {
    pub capture: CaptureSettings,
    pub preview: PreviewSettings,
    pub three_a: Settings3A,
    /// Preview geometry changed, takes effect on the next `use_buffers`
    pub preview_geometry: bool,
}

pub fn diff(old: &Parameters, new: &Parameters) -> ParamDiff {
    let mut capture = CaptureSettings::empty();
    let (o, n) = (&old.picture, &new.picture);
    if (o.width, o.height, o.format) != (n.width, n.height, n.format) {
        capture |= CaptureSettings::FORMAT;
    }
    if (o.thumbnail_width, o.thumbnail_height) != (n.thumbnail_width, n.thumbnail_height) {
        capture |= CaptureSettings::THUMBNAIL;
    }
    if o.quality != n.quality {
        capture |= CaptureSettings::QUALITY;
    }
    if o.rotation != n.rotation {
        capture |= CaptureSettings::ROTATION;
    }
    if o.burst != n.burst
        || o.bracketing != n.bracketing
        || old.preview.capture_mode != new.preview.capture_mode
    {
        capture |= CaptureSettings::BURST_EXP_BRACKET;
    }

    let mut preview = PreviewSettings::empty();
    let (o, n) = (&old.preview, &new.preview);
    if o.ldc != n.ldc {
        preview |= PreviewSettings::LDC;
    }
    if o.nsf != n.nsf {
        preview |= PreviewSettings::NSF;
    }
    if o.capture_mode != n.capture_mode {
        preview |= PreviewSettings::CAPTURE_MODE;
    }
    if o.vnf != n.vnf {
        preview |= PreviewSettings::VNF;
    }
    if o.vstab != n.vstab {
        preview |= PreviewSettings::VSTAB;
    }
    let preview_geometry = (o.width, o.height, o.format, o.min_fps, o.max_fps, o.measurement)
        != (n.width, n.height, n.format, n.min_fps, n.max_fps, n.measurement);

    let mut three_a = Settings3A::empty();
    let (o, n) = (&old.three_a, &new.three_a);
    let checks = [
        (o.scene != n.scene, Settings3A::SCENE),
        (o.ev_compensation != n.ev_compensation, Settings3A::EV_COMPENSATION),
        (o.white_balance != n.white_balance, Settings3A::WHITE_BALANCE),
        (o.flicker != n.flicker, Settings3A::FLICKER),
        (o.exposure_mode != n.exposure_mode, Settings3A::EXPOSURE_MODE),
        (o.sharpness != n.sharpness, Settings3A::SHARPNESS),
        (o.brightness != n.brightness, Settings3A::BRIGHTNESS),
        (o.contrast != n.contrast, Settings3A::CONTRAST),
        (o.iso != n.iso, Settings3A::ISO),
        (o.saturation != n.saturation, Settings3A::SATURATION),
        (o.effect != n.effect, Settings3A::EFFECT),
        (o.focus_mode != n.focus_mode, Settings3A::FOCUS),
        (o.flash != n.flash, Settings3A::FLASH),
        (o.exposure_lock != n.exposure_lock, Settings3A::EXPOSURE_LOCK),
        (o.white_balance_lock != n.white_balance_lock, Settings3A::WB_LOCK),
        (o.metering_areas != n.metering_areas, Settings3A::METERING_AREAS),
        (
            (o.manual_exposure_us, o.manual_gain) != (n.manual_exposure_us, n.manual_gain),
            Settings3A::MANUAL_EXPOSURE,
        ),
    ];
    for (changed, bit) in checks {
        if changed {
            three_a |= bit;
        }
    }

    ParamDiff {
        capture,
        preview,
        three_a,
        preview_geometry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_parameters_produce_no_bits() {
        let p = Parameters::default();
        let d = diff(&p, &p.clone());
        assert!(d.capture.is_empty());
        assert!(d.preview.is_empty());
        assert!(d.three_a.is_empty());
        assert!(!d.preview_geometry);
    }

    #[test]
    fn each_axis_maps_to_its_bit() {
        let old = Parameters::default();
        let mut new = old.clone();
        new.picture.width = 1280;
        new.picture.rotation = 90;
        new.preview.vstab = true;
        new.three_a.scene = SceneMode::Night;
        new.three_a.white_balance_lock = true;

        let d = diff(&old, &new);
        assert_eq!(d.capture, CaptureSettings::FORMAT | CaptureSettings::ROTATION);
        assert_eq!(d.preview, PreviewSettings::VSTAB);
        assert_eq!(d.three_a, Settings3A::SCENE | Settings3A::WB_LOCK);
    }

    #[test]
    fn capture_mode_touches_preview_and_shot_queue() {
        let old = Parameters::default();
        let mut new = old.clone();
        new.preview.capture_mode = CaptureMode::CpCam;
        let d = diff(&old, &new);
        assert!(d.preview.contains(PreviewSettings::CAPTURE_MODE));
        assert!(d.capture.contains(CaptureSettings::BURST_EXP_BRACKET));
    }

    #[test]
    fn validation_rejects_oversized_bracketing() {
        let mut p = Parameters::default();
        p.picture.bracketing = "-2,-1,0,1,2".into();
        assert_eq!(p.validate(10).map(|e| e.len()), Ok(5));
        assert!(matches!(
            p.validate(4),
            Err(AdapterError::ResourceExhausted(_))
        ));

        p.picture.bracketing = "abc".into();
        assert!(matches!(p.validate(10), Err(AdapterError::BadValue(_))));
    }

    #[test]
    fn normalization_clamps_quality_and_burst() {
        let mut p = Parameters::default();
        p.picture.quality = 0;
        p.picture.burst = 0;
        let p = p.normalized();
        assert_eq!(p.picture.quality, 100);
        assert_eq!(p.picture.burst, 1);
    }
}
