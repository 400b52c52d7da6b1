//! ハードウェア初期化モジュール
//!
//! クロック設定と、ESC用タイマー・GPIOの初期化を集約します。

use embassy_stm32::time::Hertz;
use embassy_stm32::Config;
use g4_esc::params::PwmMode;

use crate::config::pwm;
use crate::{comm_timer, motor_driver, pwm_timer};

/// RCCクロック設定を初期化
///
/// HSI → PLL（÷4 × 85 ÷ 2）で170MHz生成
pub fn create_clock_config() -> Config {
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::mux::{Adcsel, ClockMux};
        use embassy_stm32::rcc::{Pll, PllMul, PllPreDiv, PllRDiv, PllSource, Sysclk};

        config.rcc.hsi = true;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: None,
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;

        let mut clock_mux = ClockMux::default();
        clock_mux.adc12sel = Adcsel::SYS;
        config.rcc.mux = clock_mux;
    }
    config
}

/// PWMモード → PWM周波数
pub fn pwm_frequency(mode: PwmMode) -> Hertz {
    if mode.high_frequency() {
        pwm::HIGH_FREQUENCY
    } else {
        pwm::LOW_FREQUENCY
    }
}

/// ゲート出力、転流タイマー、ソフトウェアPWMの初期化
///
/// ゲートを全オフにしてから割り込みを有効にする。
///
/// # Safety
/// PACを使用した直接レジスタ操作を含む
pub unsafe fn init_esc_peripherals(pwm_mode: PwmMode) {
    info!("Initializing gate driver pins (PE8-PE13)...");
    unsafe { motor_driver::init_gate_pins() };

    info!("Initializing TIM2 commutation timer (2MHz)...");
    unsafe { comm_timer::init_comm_timer() };

    let frequency = pwm_frequency(pwm_mode);
    info!("Initializing TIM3 software PWM ({}Hz)...", frequency.0);
    unsafe { pwm_timer::init_pwm_timer(frequency) };
}
