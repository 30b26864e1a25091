//! InvenSense MPU-6050 accelerometer on an I2C bus.
//!
//! The driver is generic over [`embedded_hal::i2c::I2c`], so any platform HAL that
//! exposes the bus (a Linux `/dev/i2c-N` wrapper, a USB bridge) can feed the sampler.
//! Only the accelerometer is used: ±2 g full scale, digital low-pass filter off, one
//! 6-byte burst read per sample.

use crate::hardware::capabilities::{ReadingSource, SourceError};
use crate::measurement::AxisSample;
use embedded_hal::i2c::{ErrorKind, I2c};

/// Address with AD0 tied low.
pub const DEFAULT_ADDRESS: u8 = 0x68;

const CONFIG: u8 = 0x1A;
const ACCEL_CONFIG: u8 = 0x1C;
const ACCEL_XOUT_H: u8 = 0x3B;
const PWR_MGMT_1: u8 = 0x6B;
const WHO_AM_I: u8 = 0x75;
const EXPECTED_ID: u8 = 0x68;

/// PLL with X gyro reference, sleep cleared.
const WAKE_PLL_X: u8 = 0x01;
/// LSB per g at ±2 g.
const LSB_PER_G: f64 = 16_384.0;

/// MPU-6050 reading source.
pub struct Mpu6050<I> {
    i2c: I,
    address: u8,
}

impl<I: I2c> Mpu6050<I> {
    /// Check the chip identity at `address` and configure it for high-rate sampling.
    pub fn new(i2c: I, address: u8) -> Result<Self, SourceError> {
        let mut sensor = Self { i2c, address };
        sensor.configure()?;
        Ok(sensor)
    }

    fn configure(&mut self) -> Result<(), SourceError> {
        let mut id = [0u8];
        self.i2c
            .write_read(self.address, &[WHO_AM_I], &mut id)
            .map_err(bus_error)?;
        if id[0] != EXPECTED_ID {
            return Err(SourceError::Io(format!(
                "unexpected WHO_AM_I 0x{:02x} at address 0x{:02x}",
                id[0], self.address
            )));
        }
        self.write_register(PWR_MGMT_1, WAKE_PLL_X)?;
        self.write_register(ACCEL_CONFIG, 0x00)?;
        self.write_register(CONFIG, 0x00)
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SourceError> {
        self.i2c.write(self.address, &[register, value]).map_err(bus_error)
    }

    /// Give the bus back.
    pub fn release(self) -> I {
        self.i2c
    }
}

impl<I: I2c + Send> ReadingSource for Mpu6050<I> {
    fn name(&self) -> &str {
        "mpu6050"
    }

    fn read(&mut self) -> Result<AxisSample, SourceError> {
        let mut raw = [0u8; 6];
        self.i2c
            .write_read(self.address, &[ACCEL_XOUT_H], &mut raw)
            .map_err(bus_error)?;
        let axis = |hi: usize| f64::from(i16::from_be_bytes([raw[hi], raw[hi + 1]])) / LSB_PER_G;
        Ok(AxisSample::new(axis(0), axis(2), axis(4)))
    }
}

/// A missing ACK means nothing answered at the address.
fn bus_error<E: embedded_hal::i2c::Error>(e: E) -> SourceError {
    match e.kind() {
        ErrorKind::NoAcknowledge(_) => SourceError::Disconnected,
        kind => SourceError::Io(kind.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorType, NoAcknowledgeSource, Operation};

    /// Register file behind one I2C address, auto-incrementing like the real part.
    struct RegisterBus {
        address: u8,
        registers: [u8; 128],
        pointer: usize,
        present: bool,
    }

    impl RegisterBus {
        fn mpu() -> Self {
            let mut registers = [0u8; 128];
            registers[WHO_AM_I as usize] = EXPECTED_ID;
            registers[PWR_MGMT_1 as usize] = 0x40;
            Self {
                address: DEFAULT_ADDRESS,
                registers,
                pointer: 0,
                present: true,
            }
        }
    }

    impl ErrorType for RegisterBus {
        type Error = ErrorKind;
    }

    impl I2c for RegisterBus {
        fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), ErrorKind> {
            if !self.present || address != self.address {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        let Some((&register, values)) = bytes.split_first() else {
                            continue;
                        };
                        self.pointer = register as usize;
                        for &value in values {
                            self.registers[self.pointer] = value;
                            self.pointer += 1;
                        }
                    }
                    Operation::Read(buffer) => {
                        for byte in buffer.iter_mut() {
                            *byte = self.registers[self.pointer];
                            self.pointer += 1;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn setup_wakes_the_device() {
        let sensor = Mpu6050::new(RegisterBus::mpu(), DEFAULT_ADDRESS).unwrap();
        let bus = sensor.release();
        assert_eq!(bus.registers[PWR_MGMT_1 as usize], WAKE_PLL_X);
        assert_eq!(bus.registers[ACCEL_CONFIG as usize], 0x00);
    }

    #[test]
    fn burst_read_is_scaled_to_g() {
        let mut bus = RegisterBus::mpu();
        let at = ACCEL_XOUT_H as usize;
        bus.registers[at..at + 6].copy_from_slice(&[0x40, 0x00, 0xC0, 0x00, 0x20, 0x00]);
        let mut sensor = Mpu6050::new(bus, DEFAULT_ADDRESS).unwrap();
        assert_eq!(sensor.read().unwrap(), AxisSample::new(1.0, -1.0, 0.5));
    }

    #[test]
    fn absent_device_reads_as_disconnected() {
        let mut bus = RegisterBus::mpu();
        bus.present = false;
        assert!(matches!(
            Mpu6050::new(bus, DEFAULT_ADDRESS),
            Err(SourceError::Disconnected)
        ));
        assert!(matches!(
            Mpu6050::new(RegisterBus::mpu(), 0x69),
            Err(SourceError::Disconnected)
        ));
    }

    #[test]
    fn wrong_chip_is_rejected() {
        let mut bus = RegisterBus::mpu();
        bus.registers[WHO_AM_I as usize] = 0x70;
        match Mpu6050::new(bus, DEFAULT_ADDRESS) {
            Err(SourceError::Io(message)) => assert!(message.contains("0x70")),
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("accepted a foreign chip"),
        }
    }
}
