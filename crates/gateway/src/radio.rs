//! Frame reception. The `hw` feature selects the real SX1276 transceiver
//! over SPI/GPIO; without it a UDP socket stands in so the whole pipeline
//! can be driven by the node simulator on a development machine.

use std::fmt;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Default listen address of the development backend. 1700 is the port LoRa
/// packet forwarders conventionally use.
pub const DEFAULT_UDP_BIND: &str = "0.0.0.0:1700";

/// One received LoRa frame with its link metrics.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub bytes: Vec<u8>,
    pub rssi_dbm: i16,
    pub snr_db: f32,
}

#[derive(Debug)]
pub enum RadioError {
    /// The version register never read back the expected chip id.
    Unresponsive,
    Io(String),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresponsive => write!(f, "radio unresponsive after repeated probes"),
            Self::Io(e) => write!(f, "radio i/o error: {e}"),
        }
    }
}

impl std::error::Error for RadioError {}

/// The radio contract the coordinator drives: configure once, then pull
/// frames. `reset` power-cycles and reconfigures after a fault.
#[async_trait]
pub trait Radio: Send {
    async fn init(&mut self) -> Result<(), RadioError>;
    /// Next valid frame, or `None` on a backend fault worth backing off
    /// from. Zero-length and oversized frames are dropped here, with a
    /// warning, and never reach the decoder.
    async fn receive(&mut self) -> Option<ReceivedFrame>;
    async fn reset(&mut self) -> Result<(), RadioError>;
}

// ---------------------------------------------------------------------------
// UDP development backend (no `hw` feature)
// ---------------------------------------------------------------------------

/// Receives frames as raw UDP datagrams from the node simulator. There is no
/// radio path, so link metrics are nominal constants.
pub struct UdpRadio {
    socket: UdpSocket,
}

const SIM_RSSI_DBM: i16 = -60;
const SIM_SNR_DB: f32 = 9.5;

impl UdpRadio {
    pub async fn bind(addr: &str) -> Result<Self, RadioError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| RadioError::Io(e.to_string()))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, RadioError> {
        self.socket
            .local_addr()
            .map_err(|e| RadioError::Io(e.to_string()))
    }
}

#[async_trait]
impl Radio for UdpRadio {
    async fn init(&mut self) -> Result<(), RadioError> {
        info!(addr = %self.local_addr()?, "udp radio backend listening");
        Ok(())
    }

    async fn receive(&mut self) -> Option<ReceivedFrame> {
        let mut buf = [0u8; 512];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("udp radio recv failed: {e}");
                    return None;
                }
            };
            if len == 0 || len > 255 {
                warn!(len, %peer, "dropping frame with invalid length");
                continue;
            }
            return Some(ReceivedFrame {
                bytes: buf[..len].to_vec(),
                rssi_dbm: SIM_RSSI_DBM,
                snr_db: SIM_SNR_DB,
            });
        }
    }

    async fn reset(&mut self) -> Result<(), RadioError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SX1276 over SPI (feature `hw`)
// ---------------------------------------------------------------------------

#[cfg(feature = "hw")]
pub use sx1276::Sx1276;

#[cfg(feature = "hw")]
mod sx1276 {
    use std::time::Duration;

    use async_trait::async_trait;
    use rppal::gpio::{Gpio, InputPin, OutputPin};
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
    use tracing::{debug, info, warn};

    use super::{Radio, RadioError, ReceivedFrame};

    // ── SX1276 register map (LoRa page) ────────────────────────────────────
    const REG_FIFO: u8 = 0x00;
    const REG_OP_MODE: u8 = 0x01;
    const REG_FRF_MSB: u8 = 0x06;
    const REG_FRF_MID: u8 = 0x07;
    const REG_FRF_LSB: u8 = 0x08;
    const REG_PA_CONFIG: u8 = 0x09;
    const REG_OCP: u8 = 0x0B;
    const REG_LNA: u8 = 0x0C;
    const REG_FIFO_ADDR_PTR: u8 = 0x0D;
    const REG_FIFO_TX_BASE_ADDR: u8 = 0x0E;
    const REG_FIFO_RX_BASE_ADDR: u8 = 0x0F;
    const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
    const REG_IRQ_FLAGS: u8 = 0x12;
    const REG_RX_NB_BYTES: u8 = 0x13;
    const REG_PKT_SNR_VALUE: u8 = 0x19;
    const REG_PKT_RSSI_VALUE: u8 = 0x1A;
    const REG_MODEM_CONFIG_1: u8 = 0x1D;
    const REG_MODEM_CONFIG_2: u8 = 0x1E;
    const REG_PREAMBLE_MSB: u8 = 0x20;
    const REG_PREAMBLE_LSB: u8 = 0x21;
    const REG_MODEM_CONFIG_3: u8 = 0x26;
    const REG_DETECTION_OPTIMIZE: u8 = 0x31;
    const REG_DETECTION_THRESHOLD: u8 = 0x37;
    const REG_SYNC_WORD: u8 = 0x39;
    const REG_VERSION: u8 = 0x42;

    // ── Operating modes ────────────────────────────────────────────────────
    const MODE_LONG_RANGE: u8 = 0x80;
    const MODE_SLEEP: u8 = 0x00;
    const MODE_RX_CONTINUOUS: u8 = 0x05;

    // ── IRQ flag bits ──────────────────────────────────────────────────────
    const IRQ_RX_DONE: u8 = 0x40;
    const IRQ_PAYLOAD_CRC_ERROR: u8 = 0x20;

    const CHIP_VERSION: u8 = 0x12;
    /// 868.0 MHz in 32 MHz / 2^19 frequency steps.
    const FRF_868_MHZ: u32 = 0x00D9_0000;
    /// Packet RSSI register offset for the HF port.
    const RSSI_OFFSET: i16 = 137;

    const PROBE_ATTEMPTS: u8 = 3;
    const RX_POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub struct Sx1276 {
        spi: Spi,
        reset_pin: OutputPin,
        dio0: InputPin,
    }

    fn io(e: impl std::fmt::Display) -> RadioError {
        RadioError::Io(e.to_string())
    }

    impl Sx1276 {
        pub fn open(reset_gpio: u8, dio0_gpio: u8) -> Result<Self, RadioError> {
            let spi = open_spi()?;
            let gpio = Gpio::new().map_err(io)?;
            let mut reset_pin = gpio.get(reset_gpio).map_err(io)?.into_output();
            reset_pin.set_high();
            let dio0 = gpio.get(dio0_gpio).map_err(io)?.into_input();
            Ok(Self {
                spi,
                reset_pin,
                dio0,
            })
        }

        fn write_register(&mut self, reg: u8, value: u8) -> Result<(), RadioError> {
            self.spi.write(&[reg | 0x80, value]).map_err(io)?;
            Ok(())
        }

        fn read_register(&mut self, reg: u8) -> Result<u8, RadioError> {
            let mut rx = [0u8; 2];
            self.spi.transfer(&mut rx, &[reg & 0x7F, 0x00]).map_err(io)?;
            Ok(rx[1])
        }

        /// Hardware reset line: low 10 ms, high, 10 ms settle.
        fn pulse_reset(&mut self) {
            self.reset_pin.set_low();
            std::thread::sleep(Duration::from_millis(10));
            self.reset_pin.set_high();
            std::thread::sleep(Duration::from_millis(10));
        }

        fn reopen_spi(&mut self) -> Result<(), RadioError> {
            self.spi = open_spi()?;
            Ok(())
        }

        /// Full modem configuration: 868 MHz, BW 125 kHz, SF9, CR 4/5, CRC
        /// on, LNA AGC, explicit header, sync word 0x12, then continuous
        /// receive.
        fn configure(&mut self) -> Result<(), RadioError> {
            self.write_register(REG_OP_MODE, MODE_SLEEP)?;
            std::thread::sleep(Duration::from_millis(10));
            self.write_register(REG_OP_MODE, MODE_SLEEP | MODE_LONG_RANGE)?;

            self.write_register(REG_FRF_MSB, (FRF_868_MHZ >> 16) as u8)?;
            self.write_register(REG_FRF_MID, (FRF_868_MHZ >> 8) as u8)?;
            self.write_register(REG_FRF_LSB, FRF_868_MHZ as u8)?;

            self.write_register(REG_PA_CONFIG, 0x8F)?; // PA_BOOST, max power
            self.write_register(REG_LNA, 0x23)?; // max gain, boost on
            self.write_register(REG_DETECTION_OPTIMIZE, 0xC5)?;
            self.write_register(REG_DETECTION_THRESHOLD, 0x0C)?;
            self.write_register(REG_OCP, 0x2F)?; // 150 mA current limit

            self.write_register(REG_FIFO_TX_BASE_ADDR, 0)?;
            self.write_register(REG_FIFO_RX_BASE_ADDR, 0)?;

            self.write_register(REG_MODEM_CONFIG_1, 0x72)?; // BW 125 kHz, CR 4/5, explicit header
            self.write_register(REG_MODEM_CONFIG_2, 0x94)?; // SF9, CRC on
            self.write_register(REG_MODEM_CONFIG_3, 0x04)?; // LNA AGC

            self.write_register(REG_PREAMBLE_MSB, 0x00)?;
            self.write_register(REG_PREAMBLE_LSB, 0x10)?;
            self.write_register(REG_SYNC_WORD, 0x12)?;

            self.write_register(REG_OP_MODE, MODE_RX_CONTINUOUS | MODE_LONG_RANGE)?;
            info!("sx1276 configured: 868 MHz, SF9, BW 125 kHz, CR 4/5");
            Ok(())
        }

        /// Pull the packet out of the FIFO after RX-done.
        fn read_frame(&mut self) -> Result<Option<ReceivedFrame>, RadioError> {
            let len = self.read_register(REG_RX_NB_BYTES)? as usize;
            if len == 0 {
                warn!("dropping zero-length frame");
                return Ok(None);
            }

            let current = self.read_register(REG_FIFO_RX_CURRENT_ADDR)?;
            self.write_register(REG_FIFO_ADDR_PTR, current)?;

            let mut bytes = vec![0u8; len];
            for b in bytes.iter_mut() {
                *b = self.read_register(REG_FIFO)?;
            }

            let rssi_dbm = self.read_register(REG_PKT_RSSI_VALUE)? as i16 - RSSI_OFFSET;
            let snr_db = self.read_register(REG_PKT_SNR_VALUE)? as i8 as f32 / 4.0;

            Ok(Some(ReceivedFrame {
                bytes,
                rssi_dbm,
                snr_db,
            }))
        }
    }

    fn open_spi() -> Result<Spi, RadioError> {
        Spi::new(Bus::Spi0, SlaveSelect::Ss0, 8_000_000, Mode::Mode0).map_err(io)
    }

    #[async_trait]
    impl Radio for Sx1276 {
        async fn init(&mut self) -> Result<(), RadioError> {
            self.pulse_reset();

            let mut attempts = PROBE_ATTEMPTS;
            loop {
                match self.read_register(REG_VERSION) {
                    Ok(CHIP_VERSION) => break,
                    Ok(v) => debug!("unexpected chip version 0x{v:02x}"),
                    Err(e) => debug!("version probe failed: {e}"),
                }
                attempts -= 1;
                if attempts == 0 {
                    return Err(RadioError::Unresponsive);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                if attempts == 1 {
                    // Last chance: recover the SPI bus and the module.
                    warn!("reprobing after SPI bus reset");
                    self.reopen_spi()?;
                    self.pulse_reset();
                }
            }

            self.configure()
        }

        async fn receive(&mut self) -> Option<ReceivedFrame> {
            loop {
                if !self.dio0.is_high() {
                    tokio::time::sleep(RX_POLL_INTERVAL).await;
                    continue;
                }

                let irq = match self.read_register(REG_IRQ_FLAGS) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("irq read failed: {e}");
                        return None;
                    }
                };
                if let Err(e) = self.write_register(REG_IRQ_FLAGS, 0xFF) {
                    warn!("irq clear failed: {e}");
                    return None;
                }

                if irq & IRQ_RX_DONE == 0 {
                    continue;
                }
                if irq & IRQ_PAYLOAD_CRC_ERROR != 0 {
                    debug!("dropping frame with invalid CRC");
                    continue;
                }

                match self.read_frame() {
                    Ok(Some(frame)) => return Some(frame),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("fifo read failed: {e}");
                        return None;
                    }
                }
            }
        }

        async fn reset(&mut self) -> Result<(), RadioError> {
            self.pulse_reset();
            if self.read_register(REG_VERSION)? != CHIP_VERSION {
                return Err(RadioError::Unresponsive);
            }
            self.configure()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
