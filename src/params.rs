//! ユーザー設定パラメータとチューニング定数
//!
//! `Params` はフラッシュに保存される生の設定コード（すべて `u8`）で、
//! `Params::decode` で検証済みの `Settings` に変換してから制御ループに渡す。
//! 制御ループは1サイクルの途中で設定を読み直さない。


/// RC入力の最大値（デューティ 0-255）
pub const RCP_MAX: u8 = 255;

/// ガバナー/スロットルの停止判定しきい値（RCP_MAX/10）
pub const GOV_STOP_THRESHOLD: u8 = RCP_MAX / 10;

/// 起動時の基準PWM（起動パワー倍率 1.0x のとき）
pub const PWM_START: u8 = 50;

/// ゲイン倍率テーブル（0x10 = 1.0x、0.13x～8.0x）
pub const GOV_GAIN_TABLE: [u8; 13] = [
    0x02, 0x03, 0x04, 0x06, 0x08, 0x0C, 0x10, 0x18, 0x20, 0x30, 0x40, 0x60, 0x80,
];

/// 起動パワー倍率テーブル（0x40 = 1.0x）
pub const STARTUP_POWER_TABLE: [u8; 13] = [
    0x04, 0x06, 0x08, 0x0C, 0x10, 0x18, 0x20, 0x30, 0x40, 0x60, 0x80, 0xA0, 0xC0,
];

/// ハウスキーピング周期 [ms]
pub const HOUSEKEEPING_PERIOD_MS: u32 = 32;

/// デフォルト設定コード
pub const DEFAULT_GOV_P_GAIN: u8 = 7; // 1.0x
pub const DEFAULT_GOV_I_GAIN: u8 = 7; // 1.0x
pub const DEFAULT_GOV_MODE: u8 = 3; // Off
pub const DEFAULT_GOV_RANGE: u8 = 1; // High
pub const DEFAULT_GOV_TARGET: u8 = 1; // スロットル
pub const DEFAULT_GOV_SETUP_TARGET: u8 = 180;
pub const DEFAULT_LOW_VOLTAGE_LIMIT: u8 = 1; // 3.0V/セル
pub const DEFAULT_STARTUP_POWER: u8 = 9; // 1.0x
pub const DEFAULT_PWM_MODE: u8 = 1; // 高周波
pub const DEFAULT_DIRECTION: u8 = 1; // 正転
pub const DEFAULT_COMM_TIMING: u8 = 3; // 中（15°）
pub const DEFAULT_DEMAG_COMP: u8 = 2; // Low
pub const DEFAULT_BEACON_DELAY: u8 = 4; // 10分
pub const DEFAULT_TEMP_PROTECTION: u8 = 3; // 100°C
pub const DEFAULT_SPOOLUP_TIME: u8 = 3;
pub const DEFAULT_STARTUP_RETRIES: u8 = 3;
pub const DEFAULT_RC_STOP_LIMIT: u8 = 64; // 64 × 32ms ≈ 2s
pub const DEFAULT_RESTART_DELAY: u8 = 30; // 30 × 100ms = 3s

/// ガバナー関連
pub mod governor {
    /// ガバナー要求値のスルーレート [/32ms]
    pub const SPOOLRATE: u8 = 2;

    /// 固定目標（アーミング/設定値）を使うスロットル下限（約20%）
    pub const FIXED_TARGET_MIN_THROTTLE: u8 = 50;

    /// 積分項の上限
    pub const INTEGRAL_LIMIT: i32 = 0x7FFF;

    /// P/I補正の上限（1回あたり）
    pub const CORRECTION_LIMIT: i32 = 127;

    /// 帯域ごとの起動可能最大周期（period4x、これ未満で有効化）
    pub const HIGH_RANGE_MAX_PERIOD4X: u16 = 0x0500;
    pub const MID_RANGE_MAX_PERIOD4X: u16 = 0x0A00;
    pub const LOW_RANGE_MAX_PERIOD4X: u16 = 0x1200;
}

/// 始動シーケンス関連
pub mod startup {
    /// 最初のステップ周期 [ticks]（5ms）
    pub const INITIAL_STEP_TICKS: u16 = 10_000;

    /// 最短ステップ周期 [ticks]（1ms）
    pub const MIN_STEP_TICKS: u16 = 2_000;

    /// ステップごとの周期倍率（/256）
    pub const ACCEL_FACTOR: u16 = 230;

    /// 閉ループ移行に必要な連続ゼロクロス確認数
    pub const OK_REQUIRED: u8 = 6;

    /// 1回の試行で許す連続未検出数
    pub const FAIL_BOUND: u8 = 24;

    /// デッドロック回避の乱択を行う確認数の上限
    pub const RANDOMIZE_BELOW_OK: u8 = 8;

    /// 再試行前の停止時間 [ms]
    pub const SETTLE_MS: u32 = 50;

    /// 初期ラン期間の電気回転数
    pub const INITIAL_RUN_ROTATIONS: u8 = 12;

    /// 始動中のPWMノイズ窓 [ticks]
    pub const NOISE_GAP_TICKS: u16 = 20;
}

/// アーミング・保護関連
pub mod protection {
    /// アーミングに必要な停止指令の継続時間 [ms]
    pub const ARM_MS: u32 = 300;

    /// 始動要求のグリッチフィルタ [ms]
    pub const START_FILTER_MS: u32 = 30;

    /// アイドル時のポーリング間隔 [ms]
    pub const IDLE_POLL_MS: u32 = 10;

    /// RC信号ロスト判定 [ハウスキーピング周期数]（10 × 32ms）
    pub const SIGNAL_TIMEOUT_TICKS: u8 = 10;

    /// ビーコン間隔 [ms]
    pub const BEACON_INTERVAL_MS: u32 = 3_000;

    /// 逆転時の追加待ち [ms]
    pub const REVERSAL_DELAY_MS: u32 = 300;

    /// 停止判定周期（period4x）
    pub const STALL_PERIOD4X: u16 = 0xF000;

    /// 方向転換ブレーキ終了判定周期（period4x）
    pub const BRAKE_STOP_PERIOD4X: u16 = 0x6000;

    /// 温度保護のステップ幅 [°C]
    pub const TEMP_STEP_C: i16 = 5;

    /// 電圧降下1mVあたりの制限（この値[mV]ごとに1段下げる）
    pub const VOLTAGE_MV_PER_STEP: u16 = 4;

    /// 制限値の回復速度 [/32ms]
    pub const RECOVERY_STEP: u8 = 1;

    /// 1セルあたりの満充電電圧 [mV]（セル数検出用）
    pub const CELL_FULL_MV: u16 = 4_200;

    /// デマグ補償を強制有効にするデューティ
    pub const DEMAG_FORCE_DUTY: u8 = 0x40;
}

/// 経験的に決めた転流タイミングのチューニング値
pub mod tuning {
    /// period4x の最小値
    pub const MIN_PERIOD4X: u16 = 0x0100;

    /// 初期ラン開始時の period4x
    pub const INITIAL_PERIOD4X: u16 = 0x7F00;

    /// 平均化窓を最も広くする period4x 上位バイト
    pub const SLOW_BREAKPOINT: u8 = 0x08;

    /// 平均化窓を中間にする period4x 上位バイト
    pub const MID_BREAKPOINT: u8 = 0x04;

    /// 処理時間補償の短縮項 [ticks]
    pub const OVERHEAD_TICKS: u16 = 1;

    /// 各待ち時間の最小値 [ticks]
    pub const MIN_WAIT_TICKS: u16 = 2;

    /// デマグメトリックの下限
    pub const DEMAG_METRIC_FLOOR: u16 = 120;

    /// タイミングを1段進めるデマグメトリック
    pub const DEMAG_ADVANCE_1: u16 = 130;

    /// タイミングをさらに1段進めるデマグメトリック
    pub const DEMAG_ADVANCE_2: u16 = 160;
}

/// パラメータ検証エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamError {
    /// ゲイン番号が範囲外
    InvalidGain,
    /// ガバナーモードが範囲外
    InvalidGovernorMode,
    /// ガバナー帯域が範囲外
    InvalidGovernorRange,
    /// ガバナー目標の取り方が範囲外
    InvalidGovernorTarget,
    /// 低電圧制限コードが範囲外
    InvalidLowVoltageLimit,
    /// 起動パワー番号が範囲外
    InvalidStartupPower,
    /// PWMモードが範囲外
    InvalidPwmMode,
    /// 回転方向が範囲外
    InvalidDirection,
    /// 転流タイミングが範囲外
    InvalidCommTiming,
    /// デマグ補償が範囲外
    InvalidDemagComp,
    /// ビーコン遅延が範囲外
    InvalidBeaconDelay,
    /// 温度保護コードが範囲外
    InvalidTempProtection,
    /// スプールアップ時間が範囲外
    InvalidSpoolupTime,
}

/// ガバナー目標の取り方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GovernorTarget {
    /// スロットルに追従
    Tx,
    /// アーミング中の最大スロットル
    Arm,
    /// 設定値で固定
    Setup(u8),
}

/// ガバナー動作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GovernorMode {
    /// 転流周期を目標に追従（閉ループ）
    Speed,
    /// 出力デューティを要求値に追従（半閉ループ）
    Duty,
    /// ガバナーなし（デューティ＝スロットル）
    Off,
}

/// ガバナー帯域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GovernorRange {
    High,
    Mid,
    Low,
}

/// PWMモード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PwmMode {
    /// 高周波PWM
    High,
    /// 低周波PWM
    Low,
    /// 低周波＋ダンプド（同期整流）
    DampedLight,
}

impl PwmMode {
    pub fn damped(self) -> bool {
        matches!(self, PwmMode::DampedLight)
    }

    pub fn high_frequency(self) -> bool {
        matches!(self, PwmMode::High)
    }
}

/// 回転方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Normal,
    Reversed,
    Bidirectional,
}

/// デマグ補償レベル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DemagComp {
    Off,
    Low,
    High,
}

impl DemagComp {
    /// 電力カットのしきい値
    pub fn power_off_threshold(self) -> u16 {
        match self {
            DemagComp::Off => 255,
            DemagComp::Low => 160,
            DemagComp::High => 130,
        }
    }

    /// 低回転制限の傾き
    pub fn low_rpm_slope(self) -> u8 {
        match self {
            DemagComp::Off => 12,
            DemagComp::Low => 10,
            DemagComp::High => 5,
        }
    }
}

/// 保存される生の設定コード
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Params {
    /// ガバナーPゲイン番号（1-13）
    pub gov_p_gain: u8,
    /// ガバナーIゲイン番号（1-13）
    pub gov_i_gain: u8,
    /// ガバナーモード（1=Speed, 2=Duty, 3=Off）
    pub gov_mode: u8,
    /// ガバナー帯域（1=High, 2=Mid, 3=Low）
    pub gov_range: u8,
    /// ガバナー目標（1=スロットル, 2=アーミング時, 3=設定値）
    pub gov_target: u8,
    /// 設定値モードの目標（0-255）
    pub gov_setup_target: u8,
    /// 低電圧制限（0=Off, n=2.9V+0.1V×n /セル, 1-5）
    pub low_voltage_limit: u8,
    /// 起動パワー番号（1-13）
    pub startup_power: u8,
    /// PWMモード（1=High, 2=Low, 3=DampedLight）
    pub pwm_mode: u8,
    /// 回転方向（1=Normal, 2=Reversed, 3=Bidirectional）
    pub direction: u8,
    /// 転流タイミング（1=Low ... 3=Medium ... 5=High）
    pub comm_timing: u8,
    /// デマグ補償（1=Off, 2=Low, 3=High）
    pub demag_comp: u8,
    /// ビーコン遅延（1=1分, 2=2分, 3=5分, 4=10分, 5=なし）
    pub beacon_delay: u8,
    /// 温度保護（0=Off, n=70°C+10°C×n, 1-7）
    pub temp_protection: u8,
    /// スプールアップ時間係数（1-17）
    pub spoolup_time: u8,
    /// 始動失敗の許容回数（0以上）
    pub startup_retries: u8,
    /// 停止判定までのハウスキーピング周期数
    pub rc_stop_limit: u8,
    /// 再始動禁止時間（×100ms）
    pub restart_delay: u8,
}

impl Params {
    pub const fn default() -> Self {
        Self {
            gov_p_gain: DEFAULT_GOV_P_GAIN,
            gov_i_gain: DEFAULT_GOV_I_GAIN,
            gov_mode: DEFAULT_GOV_MODE,
            gov_range: DEFAULT_GOV_RANGE,
            gov_target: DEFAULT_GOV_TARGET,
            gov_setup_target: DEFAULT_GOV_SETUP_TARGET,
            low_voltage_limit: DEFAULT_LOW_VOLTAGE_LIMIT,
            startup_power: DEFAULT_STARTUP_POWER,
            pwm_mode: DEFAULT_PWM_MODE,
            direction: DEFAULT_DIRECTION,
            comm_timing: DEFAULT_COMM_TIMING,
            demag_comp: DEFAULT_DEMAG_COMP,
            beacon_delay: DEFAULT_BEACON_DELAY,
            temp_protection: DEFAULT_TEMP_PROTECTION,
            spoolup_time: DEFAULT_SPOOLUP_TIME,
            startup_retries: DEFAULT_STARTUP_RETRIES,
            rc_stop_limit: DEFAULT_RC_STOP_LIMIT,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    /// 設定コードを検証してデコード
    pub fn decode(&self) -> Result<Settings, ParamError> {
        let gov_p_gain = gain(self.gov_p_gain)?;
        let gov_i_gain = gain(self.gov_i_gain)?;

        let governor_mode = match self.gov_mode {
            1 => GovernorMode::Speed,
            2 => GovernorMode::Duty,
            3 => GovernorMode::Off,
            _ => return Err(ParamError::InvalidGovernorMode),
        };
        let governor_range = match self.gov_range {
            1 => GovernorRange::High,
            2 => GovernorRange::Mid,
            3 => GovernorRange::Low,
            _ => return Err(ParamError::InvalidGovernorRange),
        };
        let governor_target = match self.gov_target {
            1 => GovernorTarget::Tx,
            2 => GovernorTarget::Arm,
            3 => GovernorTarget::Setup(self.gov_setup_target),
            _ => return Err(ParamError::InvalidGovernorTarget),
        };
        let low_voltage_mv_per_cell = match self.low_voltage_limit {
            0 => None,
            n @ 1..=5 => Some(2_900 + 100 * n as u16),
            _ => return Err(ParamError::InvalidLowVoltageLimit),
        };
        let startup_pwm = match self.startup_power {
            n @ 1..=13 => startup_pwm(n - 1),
            _ => return Err(ParamError::InvalidStartupPower),
        };
        let pwm_mode = match self.pwm_mode {
            1 => PwmMode::High,
            2 => PwmMode::Low,
            3 => PwmMode::DampedLight,
            _ => return Err(ParamError::InvalidPwmMode),
        };
        let direction = match self.direction {
            1 => Direction::Normal,
            2 => Direction::Reversed,
            3 => Direction::Bidirectional,
            _ => return Err(ParamError::InvalidDirection),
        };
        if !(1..=5).contains(&self.comm_timing) {
            return Err(ParamError::InvalidCommTiming);
        }
        let demag_comp = match self.demag_comp {
            1 => DemagComp::Off,
            2 => DemagComp::Low,
            3 => DemagComp::High,
            _ => return Err(ParamError::InvalidDemagComp),
        };
        let beacon_delay_ms = match self.beacon_delay {
            1 => Some(60_000),
            2 => Some(120_000),
            3 => Some(300_000),
            4 => Some(600_000),
            5 => None,
            _ => return Err(ParamError::InvalidBeaconDelay),
        };
        let temp_limit_c = match self.temp_protection {
            0 => None,
            n @ 1..=7 => Some(70 + 10 * n as i16),
            _ => return Err(ParamError::InvalidTempProtection),
        };
        if !(1..=17).contains(&self.spoolup_time) {
            return Err(ParamError::InvalidSpoolupTime);
        }

        Ok(Settings {
            gov_p_gain,
            gov_i_gain,
            governor_mode,
            governor_range,
            governor_target,
            low_voltage_mv_per_cell,
            startup_power_index: self.startup_power - 1,
            startup_pwm,
            pwm_mode,
            direction,
            comm_timing: self.comm_timing,
            demag_comp,
            beacon_delay_ms,
            temp_limit_c,
            spoolup_time: self.spoolup_time,
            startup_retries: self.startup_retries,
            rc_stop_limit: self.rc_stop_limit.max(1),
            restart_delay_ms: self.restart_delay as u32 * 100,
            tuning: Tuning::default(),
        })
    }

    /// デコードに失敗したらデフォルト設定を使う
    pub fn decode_or_default(&self) -> Settings {
        match self.decode() {
            Ok(settings) => settings,
            Err(e) => {
                error!("Invalid parameters: {:?}, using defaults", e);
                Settings::default()
            }
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::default()
    }
}

fn gain(code: u8) -> Result<u8, ParamError> {
    match code {
        1..=13 => Ok(GOV_GAIN_TABLE[code as usize - 1]),
        _ => Err(ParamError::InvalidGain),
    }
}

/// 起動パワー番号（0ベース）から起動PWMを計算
pub fn startup_pwm(index: u8) -> u8 {
    let idx = (index as usize).min(STARTUP_POWER_TABLE.len() - 1);
    let pwm = PWM_START as u16 * STARTUP_POWER_TABLE[idx] as u16 / 0x40;
    pwm.clamp(1, 255) as u8
}

/// 転流タイミングのチューニング値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tuning {
    pub min_period4x: u16,
    pub slow_breakpoint: u8,
    pub mid_breakpoint: u8,
    pub overhead_ticks: u16,
    pub min_wait_ticks: u16,
    pub startup_noise_gap: u16,
    pub initial_step_ticks: u16,
    pub min_step_ticks: u16,
    pub accel_factor: u16,
    pub startup_ok_required: u8,
    pub startup_fail_bound: u8,
    pub initial_run_rotations: u8,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            min_period4x: tuning::MIN_PERIOD4X,
            slow_breakpoint: tuning::SLOW_BREAKPOINT,
            mid_breakpoint: tuning::MID_BREAKPOINT,
            overhead_ticks: tuning::OVERHEAD_TICKS + crate::timing::READ_OVERHEAD_TICKS,
            min_wait_ticks: tuning::MIN_WAIT_TICKS,
            startup_noise_gap: startup::NOISE_GAP_TICKS,
            initial_step_ticks: startup::INITIAL_STEP_TICKS,
            min_step_ticks: startup::MIN_STEP_TICKS,
            accel_factor: startup::ACCEL_FACTOR,
            startup_ok_required: startup::OK_REQUIRED,
            startup_fail_bound: startup::FAIL_BOUND,
            initial_run_rotations: startup::INITIAL_RUN_ROTATIONS,
        }
    }
}

/// デコード済み設定（制御ループが使う読み取り専用スナップショット）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Settings {
    /// Pゲイン倍率（0x10 = 1.0x）
    pub gov_p_gain: u8,
    /// Iゲイン倍率（0x10 = 1.0x）
    pub gov_i_gain: u8,
    pub governor_mode: GovernorMode,
    pub governor_range: GovernorRange,
    pub governor_target: GovernorTarget,
    /// 1セルあたりの低電圧制限 [mV]
    pub low_voltage_mv_per_cell: Option<u16>,
    /// 起動パワー番号（0ベース）
    pub startup_power_index: u8,
    /// 起動PWM
    pub startup_pwm: u8,
    pub pwm_mode: PwmMode,
    pub direction: Direction,
    /// 転流タイミング（1-5）
    pub comm_timing: u8,
    pub demag_comp: DemagComp,
    /// ビーコン遅延 [ms]（Noneなら鳴らさない）
    pub beacon_delay_ms: Option<u32>,
    /// 温度保護の開始温度 [°C]
    pub temp_limit_c: Option<i16>,
    pub spoolup_time: u8,
    pub startup_retries: u8,
    pub rc_stop_limit: u8,
    pub restart_delay_ms: u32,
    pub tuning: Tuning,
}

impl Default for Settings {
    fn default() -> Self {
        // デフォルトコードのデコード結果と同じ
        Self {
            gov_p_gain: 0x10,
            gov_i_gain: 0x10,
            governor_mode: GovernorMode::Off,
            governor_range: GovernorRange::High,
            governor_target: GovernorTarget::Tx,
            low_voltage_mv_per_cell: Some(3_000),
            startup_power_index: DEFAULT_STARTUP_POWER - 1,
            startup_pwm: PWM_START,
            pwm_mode: PwmMode::High,
            direction: Direction::Normal,
            comm_timing: DEFAULT_COMM_TIMING,
            demag_comp: DemagComp::Low,
            beacon_delay_ms: Some(600_000),
            temp_limit_c: Some(100),
            spoolup_time: DEFAULT_SPOOLUP_TIME,
            startup_retries: DEFAULT_STARTUP_RETRIES,
            rc_stop_limit: DEFAULT_RC_STOP_LIMIT,
            restart_delay_ms: DEFAULT_RESTART_DELAY as u32 * 100,
            tuning: Tuning::default(),
        }
    }
}
