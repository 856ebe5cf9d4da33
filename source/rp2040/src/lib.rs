#![no_std]
#![allow(async_fn_in_trait)]

use embassy_rp::{
    flash::{Blocking, Flash},
    gpio::{AnyPin, Output},
    peripherals::FLASH,
    uart::{Async, Instance, Uart},
};
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
use ttnode_core::{sched::PowerControl, Error, ModemSerial};

pub fn get_unique_id(flash: &mut FLASH) -> Option<u64> {
    let mut flash: Flash<'_, FLASH, Blocking, { 2 * 1024 * 1024 }> = Flash::new_blocking(flash);

    let mut id = [0u8; core::mem::size_of::<u64>()];
    flash.blocking_unique_id(&mut id).ok()?;
    Some(u64::from_be_bytes(id))
}

/// Device address reported to the service, folded from the flash unique ID
pub fn device_id(unique_id: u64) -> u32 {
    let folded = (unique_id >> 32) as u32 ^ unique_id as u32;
    // zero means "unassigned" on the service side
    if folded == 0 {
        1
    } else {
        folded
    }
}

pub fn get_rand(unique_id: u64) -> ChaCha8Rng {
    // TODO: seed from the ring oscillator as well as the unique ID
    let mut seed = [0u8; 32];
    let uid = unique_id.to_le_bytes();
    seed.chunks_exact_mut(8).for_each(|c| {
        c.copy_from_slice(&uid);
    });
    ChaCha8Rng::from_seed(seed)
}

/// The UART shared by the modem and the UART sensors
pub struct ModemUart<T: Instance + 'static> {
    uart: Uart<'static, T, Async>,
}

impl<T: Instance + 'static> ModemUart<T> {
    pub fn new(uart: Uart<'static, T, Async>) -> Self {
        Self { uart }
    }
}

impl<T: Instance + 'static> ModemSerial for ModemUart<T> {
    type SerError = ();

    async fn write(&mut self, data: &[u8]) -> Result<(), Error<Self::SerError>> {
        // Commands are short, and replies start arriving before an async
        // write would have been scheduled back in
        if data.len() <= 16 {
            self.uart.blocking_write(data).map_err(drop)?;
        } else {
            self.uart.write(data).await.map_err(drop)?;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error<Self::SerError>> {
        // One byte at a time: the modem never says how much is coming
        let Some(first) = buf.first_mut() else {
            return Ok(0);
        };
        self.uart.read(core::slice::from_mut(first)).await.map_err(drop)?;
        Ok(1)
    }
}

/// Sensor group power switches on GPIO, indexed by the group's power parameter
pub struct GpioPower<const N: usize> {
    pins: [Output<'static, AnyPin>; N],
}

impl<const N: usize> GpioPower<N> {
    pub fn new(mut pins: [Output<'static, AnyPin>; N]) -> Self {
        pins.iter_mut().for_each(|p| p.set_low());
        Self { pins }
    }
}

impl<const N: usize> PowerControl for GpioPower<N> {
    fn set(&mut self, param: u8, on: bool) {
        let Some(pin) = self.pins.get_mut(usize::from(param)) else {
            return;
        };
        if on {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}
