//! ガバナー
//!
//! スロットル指令と転流周期から、負荷によらず回転数（またはデューティ）を保つ
//! PI制御。1回転に1回更新する。

use crate::params::{
    governor as gov, GovernorMode, GovernorRange, GovernorTarget, Settings, GOV_STOP_THRESHOLD,
};

/// 帯域ごとの起動可能最大周期
pub fn range_max_period4x(range: GovernorRange) -> u16 {
    match range {
        GovernorRange::High => gov::HIGH_RANGE_MAX_PERIOD4X,
        GovernorRange::Mid => gov::MID_RANGE_MAX_PERIOD4X,
        GovernorRange::Low => gov::LOW_RANGE_MAX_PERIOD4X,
    }
}

/// 速度モードの目標周期（period4x/2 単位）
pub fn speed_target(range: GovernorRange, request: u8) -> u16 {
    let inv = (255 - request) as u16;
    match range {
        GovernorRange::High => 192 + 2 * inv,
        GovernorRange::Mid => 256 + 4 * inv,
        GovernorRange::Low => 448 + 8 * inv,
    }
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Governor {
    mode: GovernorMode,
    range: GovernorRange,
    target_source: GovernorTarget,
    /// アーミング中に記録した目標値
    arm_target: u8,
    p_gain: u8,
    i_gain: u8,
    active: bool,
    /// 最新のスロットル指令
    command: u8,
    /// スルーレート制限後の要求値
    request: u8,
    target: u16,
    proportional: i32,
    integral: i32,
    output: u8,
}

impl Governor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            mode: settings.governor_mode,
            range: settings.governor_range,
            target_source: settings.governor_target,
            arm_target: 0,
            p_gain: settings.gov_p_gain,
            i_gain: settings.gov_i_gain,
            active: false,
            command: 0,
            request: 0,
            target: 0,
            proportional: 0,
            integral: 0,
            output: 0,
        }
    }

    pub fn mode(&self) -> GovernorMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// 最新のスロットル指令（ガバナー出力ではない）
    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn arm_target(&self) -> u8 {
        self.arm_target
    }

    /// アーミング時の目標値を記録する
    pub fn set_arm_target(&mut self, target: u8) {
        self.arm_target = target;
        debug!("Governor arm target: {}", target);
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    pub fn integral(&self) -> i32 {
        self.integral
    }

    pub fn proportional(&self) -> i32 {
        self.proportional
    }

    /// 要求値を目標に追従させる（ハウスキーピング周期ごと）
    pub fn spool_request(&mut self, throttle: u8) -> u8 {
        self.command = throttle;
        let wanted = self.wanted_request(throttle);
        if wanted > self.request {
            self.request = self.request.saturating_add(gov::SPOOLRATE).min(wanted);
        } else {
            self.request = wanted;
        }
        self.request
    }

    /// 固定目標は有効化後かつスロットルが下限以上のときだけ使う。
    /// それまではスロットルに追従してスプールアップ・ダウンする。
    fn wanted_request(&self, throttle: u8) -> u8 {
        if !self.active || throttle < gov::FIXED_TARGET_MIN_THROTTLE {
            return throttle;
        }
        match self.target_source {
            GovernorTarget::Tx => throttle,
            GovernorTarget::Arm => self.arm_target,
            GovernorTarget::Setup(target) => target,
        }
    }

    /// 有効/無効の判定（run1）
    pub fn update_activation(&mut self, throttle: u8, startup: bool, period4x: u16) -> bool {
        if self.mode == GovernorMode::Off {
            return false;
        }
        let fast_enough = period4x < range_max_period4x(self.range);
        let want = throttle >= GOV_STOP_THRESHOLD && !startup && fast_enough;

        if want && !self.active {
            self.active = true;
            self.proportional = 0;
            self.integral = 0;
            self.output = self.request;
            debug!("Governor activated: period4x={}", period4x);
        } else if !want && self.active {
            self.deactivate();
            debug!("Governor deactivated: throttle={} period4x={}", throttle, period4x);
        }
        self.active
    }

    /// 無効化（P/I項をゼロに戻す）
    pub fn deactivate(&mut self) {
        self.active = false;
        self.proportional = 0;
        self.integral = 0;
        self.target = 0;
    }

    /// 電源投入直後と同じ状態に戻す
    pub fn reset(&mut self) {
        self.deactivate();
        self.command = 0;
        self.request = 0;
        self.output = 0;
    }

    /// PI更新（run2、1回転に1回）
    ///
    /// `measured_duty` はデューティモードでのみ使う。
    pub fn update(&mut self, period4x: u16, measured_duty: u8, pwm_limit: u8) -> u8 {
        if !self.active {
            return self.command;
        }

        let error = match self.mode {
            GovernorMode::Speed => {
                self.target = speed_target(self.range, self.request);
                (period4x >> 1) as i32 - self.target as i32
            }
            GovernorMode::Duty => {
                self.target = self.request as u16;
                self.request as i32 - measured_duty as i32
            }
            GovernorMode::Off => return self.command,
        };

        let limit = gov::CORRECTION_LIMIT;
        self.proportional = (self.p_gain as i32 * error / 16).clamp(-limit, limit);
        self.integral = (self.integral + error).clamp(-gov::INTEGRAL_LIMIT, gov::INTEGRAL_LIMIT);
        let i = (self.i_gain as i32 * self.integral / 256).clamp(-limit, limit);

        let out = self.request as i32 + self.proportional + i;
        self.output = out.clamp(0, pwm_limit as i32) as u8;
        self.output
    }

    /// 適用すべき要求デューティ（無効時はスロットルそのまま）
    pub fn output(&self) -> u8 {
        if self.active {
            self.output
        } else {
            self.command
        }
    }
}
