//! 出力制限
//!
//! 低回転時の同期外れ防止、温度、電源電圧から出力デューティの上限を決める。
//! 実際に適用するデューティは常に要求値と各上限の最小値。

use crate::params::{protection, DemagComp, Settings};
use crate::shared::SupplySample;

/// 温度による上限
///
/// 制限温度未満は 255、以降 `TEMP_STEP_C` ごとに 192 / 128 / 64 / 0。
pub fn temperature_ceiling(temperature_c: i16, limit_c: Option<i16>) -> u8 {
    let Some(limit) = limit_c else {
        return 255;
    };
    if temperature_c < limit {
        return 255;
    }
    match (temperature_c - limit) / protection::TEMP_STEP_C {
        0 => 192,
        1 => 128,
        2 => 64,
        _ => 0,
    }
}

/// 電源電圧による上限
pub fn voltage_ceiling(millivolts: u16, cells: u8, mv_per_cell: Option<u16>) -> u8 {
    let Some(per_cell) = mv_per_cell else {
        return 255;
    };
    if cells == 0 {
        return 255;
    }
    let threshold = cells as u32 * per_cell as u32;
    let mv = millivolts as u32;
    if mv >= threshold {
        return 255;
    }
    let steps = (threshold - mv) / protection::VOLTAGE_MV_PER_STEP as u32;
    255u32.saturating_sub(steps) as u8
}

/// バス電圧からLiPoセル数を推定
pub fn detect_cells(millivolts: u16) -> u8 {
    let full = protection::CELL_FULL_MV as u32;
    ((millivolts as u32 + full - 1) / full).min(u8::MAX as u32) as u8
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerLimiter {
    /// 電圧・温度による上限
    pwm_limit: u8,
    /// スプールアップ中の上限
    spoolup_limit: u8,
    /// 低回転時の上限
    low_rpm_limit: u8,
    spoolup_ticks: u16,
    spoolup_time: u8,
    startup_pwm: u8,
    demag_comp: DemagComp,
    temp_limit_c: Option<i16>,
    low_voltage_mv_per_cell: Option<u16>,
    cells: u8,
}

impl PowerLimiter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            pwm_limit: 255,
            spoolup_limit: settings.startup_pwm,
            low_rpm_limit: 255,
            spoolup_ticks: 0,
            spoolup_time: settings.spoolup_time,
            startup_pwm: settings.startup_pwm,
            demag_comp: settings.demag_comp,
            temp_limit_c: settings.temp_limit_c,
            low_voltage_mv_per_cell: settings.low_voltage_mv_per_cell,
            cells: 0,
        }
    }

    pub fn pwm_limit(&self) -> u8 {
        self.pwm_limit
    }

    pub fn spoolup_limit(&self) -> u8 {
        self.spoolup_limit
    }

    pub fn low_rpm_limit(&self) -> u8 {
        self.low_rpm_limit
    }

    pub fn cells(&self) -> u8 {
        self.cells
    }

    /// アーミング時にセル数を確定
    pub fn arm(&mut self, supply: Option<SupplySample>) {
        if let Some(sample) = supply {
            self.cells = detect_cells(sample.millivolts);
            info!("Detected {} cells at {} mV", self.cells, sample.millivolts);
        }
    }

    /// 始動前にスプールアップを初期化（起動パワーは再試行ごとに変わる）
    pub fn reset_for_start(&mut self, startup_pwm: u8) {
        self.startup_pwm = startup_pwm;
        self.spoolup_limit = startup_pwm.min(self.pwm_limit);
        self.spoolup_ticks = 0;
        self.low_rpm_limit = 255;
    }

    /// 停止時のリセット
    pub fn stop(&mut self) {
        self.spoolup_limit = 0;
        self.spoolup_ticks = 0;
        self.low_rpm_limit = 255;
    }

    /// 低回転制限の更新（run3）
    pub fn update_low_rpm(&mut self, period4x: u16, startup: bool) -> u8 {
        let hi = (period4x >> 8) as u8;
        self.low_rpm_limit = if startup || hi == 0 {
            255
        } else {
            let limit = (255 / hi) as u16 * self.demag_comp.low_rpm_slope() as u16;
            (limit.min(255) as u8).max(self.startup_pwm)
        };
        self.low_rpm_limit
    }

    /// デマグ補償を有効にするか（run3）
    pub fn demag_enabled(&self, period4x: u16, duty: u8, startup: bool) -> bool {
        if startup {
            return false;
        }
        if duty >= protection::DEMAG_FORCE_DUTY {
            return true;
        }
        (period4x >> 8) < 0x0A
    }

    /// ハウスキーピング周期ごとの更新
    ///
    /// `requested` は制限前の要求デューティ。
    pub fn housekeeping(&mut self, supply: Option<SupplySample>, requested: u8, governor_active: bool) {
        let ceiling = match supply {
            Some(s) => temperature_ceiling(s.temperature_c, self.temp_limit_c).min(voltage_ceiling(
                s.millivolts,
                self.cells,
                self.low_voltage_mv_per_cell,
            )),
            None => 255,
        };
        if ceiling < self.pwm_limit {
            if self.pwm_limit == 255 {
                warn!("Power limited: ceiling={}", ceiling);
            }
            self.pwm_limit = ceiling;
        } else {
            self.pwm_limit = self
                .pwm_limit
                .saturating_add(protection::RECOVERY_STEP)
                .min(ceiling);
        }

        self.spoolup(requested, governor_active);
    }

    fn spoolup(&mut self, requested: u8, governor_active: bool) {
        let n = self.spoolup_time as u16;
        self.spoolup_ticks = self.spoolup_ticks.saturating_add(1);
        let t = self.spoolup_ticks;

        let step = if t <= 3 * n {
            0
        } else if t <= 10 * n {
            if t % 3 == 0 {
                1
            } else {
                0
            }
        } else if t <= 15 * n {
            1
        } else {
            5
        };

        if requested > self.spoolup_limit || governor_active {
            self.spoolup_limit = self.spoolup_limit.saturating_add(step);
        }
        self.spoolup_limit = self.spoolup_limit.min(self.pwm_limit);
    }

    /// 要求値に各上限を適用
    pub fn apply(&self, requested: u8) -> u8 {
        requested
            .min(self.pwm_limit)
            .min(self.spoolup_limit)
            .min(self.low_rpm_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;

    fn limiter() -> PowerLimiter {
        PowerLimiter::new(&Params::default().decode().unwrap())
    }

    #[test]
    fn test_temperature_ceiling_steps() {
        let limit = Some(100);
        assert_eq!(temperature_ceiling(25, limit), 255);
        assert_eq!(temperature_ceiling(100, limit), 192);
        assert_eq!(temperature_ceiling(105, limit), 128);
        assert_eq!(temperature_ceiling(110, limit), 64);
        assert_eq!(temperature_ceiling(115, limit), 0);
        assert_eq!(temperature_ceiling(150, None), 255);
    }

    #[test]
    fn test_ceilings_are_monotonic() {
        let mut last = 255;
        for t in -20..200 {
            let c = temperature_ceiling(t, Some(90));
            assert!(c <= last);
            last = c;
        }
        // 電圧は下がるほど上限も下がる
        let mut last = 0;
        for mv in (10_000..13_000).step_by(10) {
            let c = voltage_ceiling(mv, 4, Some(3_000));
            assert!(c >= last);
            last = c;
        }
        assert_eq!(voltage_ceiling(12_000, 4, Some(3_000)), 255);
        assert_eq!(voltage_ceiling(11_000, 4, None), 255);
    }

    #[test]
    fn test_cell_detection() {
        assert_eq!(detect_cells(16_800), 4);
        assert_eq!(detect_cells(12_600), 3);
        assert_eq!(detect_cells(11_100), 3);
        assert_eq!(detect_cells(7_400), 2);
    }

    #[test]
    fn test_low_rpm_limit() {
        let mut l = limiter();
        assert_eq!(l.update_low_rpm(0x7F00, true), 255);
        // 低速は起動パワーで下限
        assert_eq!(l.update_low_rpm(0x7F00, false), 50);
        assert_eq!(l.update_low_rpm(0x0800, false), 255);
        assert_eq!(l.update_low_rpm(0x0080, false), 255);
    }

    #[test]
    fn test_demag_enable_rules() {
        let l = limiter();
        assert!(!l.demag_enabled(0x0200, 200, true));
        assert!(!l.demag_enabled(0x0B00, 0x20, false));
        assert!(l.demag_enabled(0x0B00, 0x40, false));
        assert!(l.demag_enabled(0x0900, 0x10, false));
    }

    #[test]
    fn test_pwm_limit_drops_fast_and_recovers_slowly() {
        let mut l = limiter();
        let hot = SupplySample {
            millivolts: 0,
            temperature_c: 112,
        };
        l.housekeeping(Some(hot), 0, false);
        assert_eq!(l.pwm_limit(), 64);

        let cool = SupplySample {
            millivolts: 0,
            temperature_c: 25,
        };
        l.housekeeping(Some(cool), 0, false);
        assert_eq!(l.pwm_limit(), 65);
        for _ in 0..300 {
            l.housekeeping(Some(cool), 0, false);
        }
        assert_eq!(l.pwm_limit(), 255);
    }

    #[test]
    fn test_spoolup_ramp() {
        let mut l = limiter();
        l.reset_for_start(50);
        let n = 3u16;
        let mut last = l.spoolup_limit();
        for tick in 1..=200u16 {
            l.housekeeping(None, 255, false);
            let now = l.spoolup_limit();
            assert!(now >= last);
            if tick <= 3 * n {
                assert_eq!(now, 50);
            }
            last = now;
        }
        assert_eq!(last, 255);
    }

    #[test]
    fn test_spoolup_holds_without_demand() {
        let mut l = limiter();
        l.reset_for_start(50);
        for _ in 0..100 {
            l.housekeeping(None, 40, false);
        }
        assert_eq!(l.spoolup_limit(), 50);
        assert_eq!(l.apply(200), 50);
    }

    #[test]
    fn test_apply_is_minimum() {
        let mut l = limiter();
        l.reset_for_start(200);
        l.update_low_rpm(0x7F00, false);
        assert_eq!(l.apply(255), 200.min(l.low_rpm_limit()));
    }
}
