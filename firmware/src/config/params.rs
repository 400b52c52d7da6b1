//! ボード固有の設定パラメータ
//!
//! ESCの動作パラメータ（ガバナー、始動パワー等）は `g4_esc::params` 側にあり、
//! ここには配線と周辺回路で決まる値だけを置く。

/// ゲートドライバ（GPIOE）
pub mod gate {
    /// A相ハイサイド/ローサイドのピン番号
    pub const A_HIGH: usize = 9;
    pub const A_LOW: usize = 8;
    pub const B_HIGH: usize = 11;
    pub const B_LOW: usize = 10;
    pub const C_HIGH: usize = 13;
    pub const C_LOW: usize = 12;

    /// デッドタイム [CPUサイクル]（170MHzで約300ns）
    pub const DEAD_TIME_CYCLES: u32 = 51;
}

/// 逆起電力コンパレータ入力（GPIOB、外部コンパレータ出力）
pub mod comparator {
    pub const A_PIN: usize = 6;
    pub const B_PIN: usize = 7;
    pub const C_PIN: usize = 8;
}

/// 転流タイマー（TIM2、32ビット）
pub mod comm_timer {
    /// 170MHz / (84 + 1) = 2MHz（1ティック = 500ns）
    pub const PRESCALER: u16 = 84;

    /// NVIC優先度（PWMの次）
    pub const IRQ_PRIORITY: u8 = 0x10;
}

/// ソフトウェアPWM（TIM3）
pub mod pwm {
    use embassy_stm32::time::Hertz;

    /// タイマークロック
    pub const TIMER_CLOCK: Hertz = Hertz(170_000_000);

    /// 高周波PWMモードの周波数
    pub const HIGH_FREQUENCY: Hertz = Hertz(24_000);

    /// 低周波PWMモードの周波数
    pub const LOW_FREQUENCY: Hertz = Hertz(8_000);

    /// NVIC優先度（最優先）
    pub const IRQ_PRIORITY: u8 = 0x00;
}

/// 電源電圧の分圧回路（PC1 = ADC2_IN7）
pub mod supply {
    /// 分圧抵抗の上側 [Ω]
    pub const R_UPPER: f32 = 33_300.0;
    /// 分圧抵抗の下側 [Ω]
    pub const R_LOWER: f32 = 3_300.0;
    /// ADC分解能（12ビット）
    pub const ADC_MAX: u16 = 4096;
    /// ADC基準電圧 [V]
    pub const VREF: f32 = 3.3;
    /// ローパスフィルタ係数
    pub const FILTER_ALPHA: f32 = 0.1;
    /// 監視周期 [ms]
    pub const PERIOD_MS: u64 = 100;
}

/// 基板温度のNTCサーミスタ（PC2 = ADC2_IN8、下側NTC）
pub mod thermistor {
    /// 25°Cでの抵抗値 [Ω]
    pub const R25: f32 = 10_000.0;
    /// B定数 [K]
    pub const BETA: f32 = 3_380.0;
    /// 直列抵抗（上側） [Ω]
    pub const R_SERIES: f32 = 10_000.0;
}

/// RC入力（PA0、EXTI0）
pub mod rc {
    /// パルス幅の下限（スロットル0） [µs]
    pub const MIN_PULSE_US: u32 = 1_000;
    /// パルス幅の上限（スロットル最大） [µs]
    pub const MAX_PULSE_US: u32 = 2_000;
    /// 双方向モードの中立位置 [µs]
    pub const CENTER_PULSE_US: u32 = 1_500;
    /// これを外れたパルスはノイズとして捨てる [µs]
    pub const VALID_RANGE_US: (u32, u32) = (800, 2_200);
    /// パルスが来なければ信号ロストとする [ms]
    pub const SIGNAL_TIMEOUT_MS: u64 = 100;
}
