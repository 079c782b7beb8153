//! Pending settings and the applier that pushes them to the component
//!
//! Three independent masks (capture, preview, 3A). A bit is set when the
//! caller changes the matching parameter and cleared right before the
//! configuration call for it is issued.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::component::{Component, HwResult, Parameter, Setting};
use crate::error::{AdapterError, HwError};
use crate::params::{Parameters, SceneMode, ThreeA};

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CaptureSettings: u32 {
        const FORMAT = 1 << 0;
        const THUMBNAIL = 1 << 1;
        const BURST_EXP_BRACKET = 1 << 2;
        const QUALITY = 1 << 3;
        const ROTATION = 1 << 4;

        /// Only legal while the image port is disabled or the component is loaded
        const LOAD_TIME = Self::FORMAT.bits() | Self::THUMBNAIL.bits() | Self::QUALITY.bits();
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PreviewSettings: u32 {
        const LDC = 1 << 0;
        const NSF = 1 << 1;
        const CAPTURE_MODE = 1 << 2;
        const VNF = 1 << 3;
        const VSTAB = 1 << 4;

        const LOAD_TIME = Self::LDC.bits() | Self::NSF.bits() | Self::CAPTURE_MODE.bits();
        const RUNTIME = Self::VNF.bits() | Self::VSTAB.bits();
    }
}

bitflags! {
    /// Bit order is apply order
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Settings3A: u32 {
        const SCENE = 1 << 0;
        const EV_COMPENSATION = 1 << 1;
        const WHITE_BALANCE = 1 << 2;
        const FLICKER = 1 << 3;
        const EXPOSURE_MODE = 1 << 4;
        const SHARPNESS = 1 << 5;
        const BRIGHTNESS = 1 << 6;
        const CONTRAST = 1 << 7;
        const ISO = 1 << 8;
        const SATURATION = 1 << 9;
        const EFFECT = 1 << 10;
        const FOCUS = 1 << 11;
        const FLASH = 1 << 12;
        const EXPOSURE_LOCK = 1 << 13;
        const WB_LOCK = 1 << 14;
        const METERING_AREAS = 1 << 15;
        const MANUAL_EXPOSURE = 1 << 16;

        /// Bits a non-manual scene mode lets through
        const ALLOWED_UNDER_SCENE = Self::EV_COMPENSATION.bits()
            | Self::FOCUS.bits()
            | Self::WB_LOCK.bits()
            | Self::EXPOSURE_LOCK.bits()
            | Self::WHITE_BALANCE.bits()
            | Self::FLASH.bits();
    }
}

/// Single bits of `mask`, lowest first
fn single_bits(mask: u32) -> impl Iterator<Item = u32> {
    (0..u32::BITS).map(|i| 1u32 << i).filter(move |b| mask & b != 0)
}

/// Destination of configuration calls
pub trait SettingSink {
    fn set_config(&self, setting: Setting) -> HwResult<()>;
    fn set_parameter(&self, param: Parameter) -> HwResult<()>;
}

impl<C: Component + ?Sized> SettingSink for C {
    fn set_config(&self, setting: Setting) -> HwResult<()> {
        Component::set_config(self, setting)
    }

    fn set_parameter(&self, param: Parameter) -> HwResult<()> {
        Component::set_parameter(self, param)
    }
}

/// Outcome of one apply pass
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub failures: Vec<(&'static str, HwError)>,
    /// 3A bits held back by an active scene mode
    pub deferred: Settings3A,
}

impl ApplyReport {
    fn record(&mut self, what: &'static str, result: HwResult<()>) {
        match result {
            Ok(()) => {
                self.applied += 1;
                debug!(what, "setting applied");
            }
            Err(e) => {
                warn!(what, error = %e, "setting failed");
                self.failures.push((what, e));
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> crate::error::Result<usize> {
        match self.failures.first() {
            None => Ok(self.applied),
            Some(&(_, e)) => Err(AdapterError::Hardware(e)),
        }
    }
}

/// Pending masks plus the lock serializing apply passes
#[derive(Debug)]
pub struct SettingsApplier {
    capture: AtomicU32,
    preview: AtomicU32,
    three_a: AtomicU32,
    /// 3A held back while a capture owns the component
    frozen: AtomicBool,
    apply_lock: Mutex<()>,
}

impl Default for SettingsApplier {
    fn default() -> Self {
        Self {
            capture: AtomicU32::new(0),
            preview: AtomicU32::new(0),
            three_a: AtomicU32::new(0),
            frozen: AtomicBool::new(false),
            apply_lock: Mutex::new(()),
        }
    }
}

impl SettingsApplier {
    pub fn mark_capture(&self, bits: CaptureSettings) {
        self.capture.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn mark_preview(&self, bits: PreviewSettings) {
        self.preview.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn mark_3a(&self, bits: Settings3A) {
        self.three_a.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn pending_capture(&self) -> CaptureSettings {
        CaptureSettings::from_bits_truncate(self.capture.load(Ordering::Acquire))
    }

    pub fn pending_preview(&self) -> PreviewSettings {
        PreviewSettings::from_bits_truncate(self.preview.load(Ordering::Acquire))
    }

    pub fn pending_3a(&self) -> Settings3A {
        Settings3A::from_bits_truncate(self.three_a.load(Ordering::Acquire))
    }

    /// Clear `bits`, returning those that were set
    pub fn take_capture(&self, bits: CaptureSettings) -> CaptureSettings {
        let prev = self.capture.fetch_and(!bits.bits(), Ordering::AcqRel);
        CaptureSettings::from_bits_truncate(prev) & bits
    }

    fn take_preview(&self, bits: PreviewSettings) -> PreviewSettings {
        let prev = self.preview.fetch_and(!bits.bits(), Ordering::AcqRel);
        PreviewSettings::from_bits_truncate(prev) & bits
    }

    fn take_3a(&self, bits: Settings3A) -> Settings3A {
        let prev = self.three_a.fetch_and(!bits.bits(), Ordering::AcqRel);
        Settings3A::from_bits_truncate(prev) & bits
    }

    /// Hold back 3A passes until [`thaw`](Self::thaw). Waits for a pass
    /// already running, so none overlaps what the caller does next.
    pub fn freeze(&self) {
        let _guard = self.apply_lock.lock();
        self.frozen.store(true, Ordering::Release);
    }

    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Push pending 3A bits, honouring scene mode precedence.
    ///
    /// A pending scene change is applied alone (plus a non-zero EV
    /// compensation, which the scene resets); the rest waits for the next
    /// pass. Under a non-manual scene only `ALLOWED_UNDER_SCENE` goes out,
    /// everything else stays pending.
    pub fn apply_3a<S: SettingSink + ?Sized>(&self, values: &ThreeA, sink: &S) -> ApplyReport {
        let _guard = self.apply_lock.lock();
        let mut report = ApplyReport::default();

        let pending = self.pending_3a();
        if pending.is_empty() {
            return report;
        }
        if self.is_frozen() {
            debug!(?pending, "3A held back during capture");
            report.deferred = pending;
            return report;
        }

        if !self.take_3a(Settings3A::SCENE).is_empty() {
            report.record("scene", sink.set_config(Setting::Scene(values.scene)));
            if values.ev_compensation != 0 {
                self.take_3a(Settings3A::EV_COMPENSATION);
                report.record(
                    "ev-compensation",
                    sink.set_config(Setting::EvCompensation(values.ev_compensation)),
                );
            }
            report.deferred = self.pending_3a();
            return report;
        }

        let allowed = if values.scene == SceneMode::Manual {
            Settings3A::all()
        } else {
            Settings3A::ALLOWED_UNDER_SCENE
        };
        report.deferred = pending - allowed;

        for bit in single_bits((pending & allowed).bits()) {
            let bit = Settings3A::from_bits_truncate(bit);
            if self.take_3a(bit).is_empty() {
                continue;
            }
            let (what, setting) = three_a_setting(bit, values);
            report.record(what, sink.set_config(setting));
        }
        report
    }

    /// Push the selected pending preview bits
    pub fn apply_preview<S: SettingSink + ?Sized>(
        &self,
        which: PreviewSettings,
        params: &Parameters,
        sink: &S,
    ) -> ApplyReport {
        let _guard = self.apply_lock.lock();
        let mut report = ApplyReport::default();
        let p = &params.preview;

        for bit in single_bits((self.pending_preview() & which).bits()) {
            let bit = PreviewSettings::from_bits_truncate(bit);
            if self.take_preview(bit).is_empty() {
                continue;
            }
            let (what, result) = if bit == PreviewSettings::LDC {
                ("ldc", sink.set_parameter(Parameter::Ldc(p.ldc)))
            } else if bit == PreviewSettings::NSF {
                ("nsf", sink.set_parameter(Parameter::NoiseFilter(p.nsf)))
            } else if bit == PreviewSettings::CAPTURE_MODE {
                (
                    "capture-mode",
                    sink.set_parameter(Parameter::CaptureMode(p.capture_mode)),
                )
            } else if bit == PreviewSettings::VNF {
                ("vnf", sink.set_config(Setting::Vnf(p.vnf)))
            } else {
                ("vstab", sink.set_config(Setting::Vstab(p.vstab)))
            };
            report.record(what, result);
        }
        report
    }

    /// Push the selected pending thumbnail, quality and rotation bits. The
    /// format bit belongs to the image port configure path and the shot
    /// queue bit to the sequencer; both are left alone.
    pub fn apply_capture<S: SettingSink + ?Sized>(
        &self,
        which: CaptureSettings,
        params: &Parameters,
        sink: &S,
    ) -> ApplyReport {
        let _guard = self.apply_lock.lock();
        let mut report = ApplyReport::default();
        let p = &params.picture;
        let which = which - CaptureSettings::FORMAT - CaptureSettings::BURST_EXP_BRACKET;

        for bit in single_bits((self.pending_capture() & which).bits()) {
            let bit = CaptureSettings::from_bits_truncate(bit);
            if self.take_capture(bit).is_empty() {
                continue;
            }
            let (what, result) = if bit == CaptureSettings::THUMBNAIL {
                (
                    "thumbnail",
                    sink.set_parameter(Parameter::Thumbnail {
                        width: p.thumbnail_width,
                        height: p.thumbnail_height,
                    }),
                )
            } else if bit == CaptureSettings::QUALITY {
                ("quality", sink.set_parameter(Parameter::Quality(p.quality)))
            } else {
                ("rotation", sink.set_config(Setting::Rotation(p.rotation)))
            };
            report.record(what, result);
        }
        report
    }

    /// Everything pending again, used on first parameter load
    pub fn mark_all(&self) {
        self.mark_capture(CaptureSettings::all());
        self.mark_preview(PreviewSettings::all());
        self.mark_3a(Settings3A::all());
    }
}

fn three_a_setting(bit: Settings3A, v: &ThreeA) -> (&'static str, Setting) {
    match bit {
        b if b == Settings3A::SCENE => ("scene", Setting::Scene(v.scene)),
        b if b == Settings3A::EV_COMPENSATION => {
            ("ev-compensation", Setting::EvCompensation(v.ev_compensation))
        }
        b if b == Settings3A::WHITE_BALANCE => {
            ("white-balance", Setting::WhiteBalance(v.white_balance))
        }
        b if b == Settings3A::FLICKER => ("flicker", Setting::Flicker(v.flicker)),
        b if b == Settings3A::EXPOSURE_MODE => {
            ("exposure-mode", Setting::ExposureMode(v.exposure_mode))
        }
        b if b == Settings3A::SHARPNESS => ("sharpness", Setting::Sharpness(v.sharpness)),
        b if b == Settings3A::BRIGHTNESS => ("brightness", Setting::Brightness(v.brightness)),
        b if b == Settings3A::CONTRAST => ("contrast", Setting::Contrast(v.contrast)),
        b if b == Settings3A::ISO => ("iso", Setting::Iso(v.iso)),
        b if b == Settings3A::SATURATION => ("saturation", Setting::Saturation(v.saturation)),
        b if b == Settings3A::EFFECT => ("effect", Setting::Effect(v.effect)),
        b if b == Settings3A::FOCUS => ("focus-mode", Setting::FocusMode(v.focus_mode)),
        b if b == Settings3A::FLASH => ("flash", Setting::Flash(v.flash)),
        b if b == Settings3A::EXPOSURE_LOCK => {
            ("exposure-lock", Setting::ExposureLock(v.exposure_lock))
        }
        b if b == Settings3A::WB_LOCK => ("wb-lock", Setting::WhiteBalanceLock(v.white_balance_lock)),
        b if b == Settings3A::METERING_AREAS => (
            "metering-areas",
            Setting::MeteringAreas(v.metering_areas.clone()),
        ),
        _ => (
            "manual-exposure",
            Setting::ManualExposure {
                exposure_us: v.manual_exposure_us,
                gain: v.manual_gain,
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{FlashMode, WhiteBalance};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        fail: Option<&'static str>,
    }

    impl Recorder {
        fn failing(prefix: &'static str) -> Self {
            Self {
                fail: Some(prefix),
                ..Default::default()
            }
        }

        fn log(&self, what: String) -> HwResult<()> {
            let fail = self.fail.is_some_and(|p| what.starts_with(p));
            self.calls.borrow_mut().push(what);
            if fail {
                Err(HwError::BadParameter)
            } else {
                Ok(())
            }
        }

        fn names(&self) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .map(|c| c.split(['(', ' ', '{']).next().unwrap_or_default().to_string())
                .collect()
        }
    }

    impl SettingSink for Recorder {
        fn set_config(&self, setting: Setting) -> HwResult<()> {
            self.log(format!("{setting:?}"))
        }

        fn set_parameter(&self, param: Parameter) -> HwResult<()> {
            self.log(format!("{param:?}"))
        }
    }

    #[test]
    fn bits_apply_in_ascending_order_and_clear() {
        let applier = SettingsApplier::default();
        applier.mark_3a(Settings3A::FLASH | Settings3A::ISO | Settings3A::WHITE_BALANCE);
        let sink = Recorder::default();

        let report = applier.apply_3a(&ThreeA::default(), &sink);
        assert_eq!(report.applied, 3);
        assert_eq!(sink.names(), vec!["WhiteBalance", "Iso", "Flash"]);
        assert!(applier.pending_3a().is_empty());
    }

    #[test]
    fn failures_do_not_stop_remaining_bits() {
        let applier = SettingsApplier::default();
        applier.mark_3a(Settings3A::BRIGHTNESS | Settings3A::CONTRAST | Settings3A::EFFECT);
        let sink = Recorder::failing("Contrast");

        let report = applier.apply_3a(&ThreeA::default(), &sink);
        assert_eq!(report.applied, 2);
        assert_eq!(report.failures, vec![("contrast", HwError::BadParameter)]);
        assert_eq!(sink.names(), vec!["Brightness", "Contrast", "Effect"]);
        // the failed bit was attempted, so it is not pending anymore
        assert!(applier.pending_3a().is_empty());
        assert!(report.into_result().is_err());
    }

    #[test]
    fn scene_change_applies_alone_with_ev_compensation() {
        let applier = SettingsApplier::default();
        applier.mark_3a(Settings3A::SCENE | Settings3A::EV_COMPENSATION | Settings3A::CONTRAST);
        let values = ThreeA {
            scene: SceneMode::Night,
            ev_compensation: 10,
            ..Default::default()
        };
        let sink = Recorder::default();

        let report = applier.apply_3a(&values, &sink);
        assert_eq!(sink.names(), vec!["Scene", "EvCompensation"]);
        assert_eq!(report.deferred, Settings3A::CONTRAST);
        assert_eq!(applier.pending_3a(), Settings3A::CONTRAST);
    }

    #[test]
    fn non_manual_scene_suppresses_but_keeps_bits() {
        let applier = SettingsApplier::default();
        applier.mark_3a(Settings3A::CONTRAST | Settings3A::FLASH | Settings3A::WHITE_BALANCE);
        let mut values = ThreeA {
            scene: SceneMode::Sport,
            flash: FlashMode::Auto,
            white_balance: WhiteBalance::Cloudy,
            ..Default::default()
        };
        let sink = Recorder::default();

        let report = applier.apply_3a(&values, &sink);
        assert_eq!(sink.names(), vec!["WhiteBalance", "Flash"]);
        assert_eq!(report.deferred, Settings3A::CONTRAST);
        assert_eq!(applier.pending_3a(), Settings3A::CONTRAST);

        values.scene = SceneMode::Manual;
        let sink = Recorder::default();
        applier.apply_3a(&values, &sink);
        assert_eq!(sink.names(), vec!["Contrast"]);
        assert!(applier.pending_3a().is_empty());
    }

    #[test]
    fn frozen_applier_keeps_3a_pending_until_thawed() {
        let applier = SettingsApplier::default();
        applier.mark_3a(Settings3A::CONTRAST | Settings3A::ISO);
        applier.freeze();
        let sink = Recorder::default();

        let report = applier.apply_3a(&ThreeA::default(), &sink);
        assert_eq!(report.applied, 0);
        assert_eq!(report.deferred, Settings3A::CONTRAST | Settings3A::ISO);
        assert!(sink.names().is_empty());

        applier.thaw();
        applier.apply_3a(&ThreeA::default(), &sink);
        assert_eq!(sink.names(), vec!["Contrast", "Iso"]);
        assert!(applier.pending_3a().is_empty());
    }

    #[test]
    fn fresh_report_is_empty() {
        let report = ApplyReport::default();
        assert!(report.is_clean());
        assert!(report.deferred.is_empty());
        assert_eq!(report.into_result(), Ok(0));
    }

    #[test]
    fn preview_apply_only_touches_selected_group() {
        let applier = SettingsApplier::default();
        applier.mark_preview(PreviewSettings::LDC | PreviewSettings::VSTAB);
        let sink = Recorder::default();
        let params = Parameters::default();

        applier.apply_preview(PreviewSettings::RUNTIME, &params, &sink);
        assert_eq!(sink.names(), vec!["Vstab"]);
        assert_eq!(applier.pending_preview(), PreviewSettings::LDC);

        applier.apply_preview(PreviewSettings::LOAD_TIME, &params, &sink);
        assert_eq!(sink.names(), vec!["Vstab", "Ldc"]);
        assert!(applier.pending_preview().is_empty());
    }

    #[test]
    fn capture_apply_leaves_format_and_shot_queue_bits() {
        let applier = SettingsApplier::default();
        applier.mark_capture(CaptureSettings::all());
        let sink = Recorder::default();
        let params = Parameters::default();

        applier.apply_capture(CaptureSettings::LOAD_TIME, &params, &sink);
        assert_eq!(sink.names(), vec!["Thumbnail", "Quality"]);
        assert_eq!(
            applier.pending_capture(),
            CaptureSettings::FORMAT | CaptureSettings::BURST_EXP_BRACKET | CaptureSettings::ROTATION
        );
        assert_eq!(
            applier.take_capture(CaptureSettings::ROTATION),
            CaptureSettings::ROTATION
        );
        assert!(applier.take_capture(CaptureSettings::ROTATION).is_empty());
    }
}
