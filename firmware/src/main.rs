#![no_std]
#![no_main]

mod fmt;

mod comm_timer;
mod config;
mod hardware;
mod motor_driver;
mod pwm_timer;
mod state;
mod supply_monitor;
mod tasks;

#[cfg(not(feature = "defmt"))]
use panic_halt as _;
#[cfg(feature = "defmt")]
use {defmt_rtt as _, panic_probe as _};

use embassy_executor::{InterruptExecutor, Spawner};
use embassy_stm32::{
    adc::{Adc, AdcChannel, SampleTime},
    crc::{Config as CrcConfig, Crc},
    exti::ExtiInput,
    flash::Flash,
    gpio::{Level, Output, Pull, Speed},
    interrupt,
    interrupt::{InterruptExt, Priority},
};
use embassy_time::{Duration, Timer};
use g4_esc::params::Direction;

use motor_driver::Board;
use tasks::{motor_control_task, rc_input_task, signal_task, supply_monitor_task};

/// RC入力・電源監視・表示を動かす高優先度エグゼキュータ
static EXECUTOR_HIGH: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn UART4() {
    unsafe { EXECUTOR_HIGH.on_interrupt() }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // ハードウェア初期化
    let config = hardware::create_clock_config();
    let p = embassy_stm32::init(config);

    info!("═══════════════════════════════════════════════════════");
    info!("");
    info!("        G4-ESC  Sensorless BLDC Controller");
    info!("        STM32G431VB @ 170MHz");
    info!("");
    info!("═══════════════════════════════════════════════════════");

    // フラッシュとCRC初期化（設定ロード用）
    let mut flash = Flash::new_blocking(p.FLASH);

    // STM32デフォルト設定: CRC-32、poly=0x04C11DB7
    let crc_config = CrcConfig::new(
        embassy_stm32::crc::InputReverseConfig::None,
        false, // reverse_out
        embassy_stm32::crc::PolySize::Width32,
        0xFFFFFFFF, // crc_init_value
        0x04C11DB7, // crc_poly (CRC-32)
    )
    .unwrap();
    let mut crc = Crc::new(p.CRC, crc_config);

    info!("Loading configuration from flash...");
    let stored = config::load_or_initialize_config(&mut flash, &mut crc);
    let settings = stored.params.decode_or_default();
    info!("Config loaded: version={}", stored.version);
    info!("  {:?}", stored.params);

    // ゲート出力と転流・PWMタイマー
    unsafe {
        hardware::init_esc_peripherals(settings.pwm_mode);
    }

    // 高優先度エグゼキュータ（PWM・転流タイマー割り込みより低い）
    interrupt::UART4.set_priority(Priority::P6);
    let high_spawner = EXECUTOR_HIGH.start(interrupt::UART4);

    // RC入力（PA0）
    let rc_pin = ExtiInput::new(p.PA0, p.EXTI0, Pull::Down);
    let bidirectional = settings.direction == Direction::Bidirectional;
    high_spawner.spawn(rc_input_task(rc_pin, bidirectional)).unwrap();

    // 電源監視（PC1 = ADC2_IN7、PC2 = ADC2_IN8）
    let mut adc2 = Adc::new(p.ADC2);
    adc2.set_sample_time(SampleTime::CYCLES640_5);
    let voltage_pin = p.PC1.degrade_adc();
    let thermistor_pin = p.PC2.degrade_adc();
    high_spawner
        .spawn(supply_monitor_task(adc2, voltage_pin, thermistor_pin))
        .unwrap();

    // LED表示
    let leds = [
        Output::new(p.PC13, Level::Low, Speed::Low),
        Output::new(p.PC14, Level::Low, Speed::Low),
        Output::new(p.PC15, Level::Low, Speed::Low),
    ];
    high_spawner.spawn(signal_task(leds)).unwrap();

    info!("Starting ESC control...");

    // 転流ループはスレッドモードで回す
    let board = unsafe { Board::new() };
    spawner.spawn(motor_control_task(board, settings)).unwrap();

    loop {
        Timer::after(Duration::from_millis(1000)).await;
    }
}
