//! Flash primitives
//!
//! [FlashHal] is implemented by the platform. The storage engine performs
//! exactly one primitive per step, and retries failed primitives after a
//! back-off using [Retrier].

use embassy_time::Instant;

use super::{layout::NvCfg, NvResult};

/// An error reported by a flash primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum FlashError {
    /// The device did not finish in time
    Timeout,
    /// The device reported a failure
    Hardware,
    /// The address range is not valid for this operation
    BadAddress,
}

impl From<FlashError> for NvResult {
    fn from(value: FlashError) -> Self {
        match value {
            FlashError::Timeout => NvResult::Timeout,
            FlashError::Hardware => NvResult::Error,
            FlashError::BadAddress => NvResult::BadArgs,
        }
    }
}

/// Raw NOR flash access
///
/// Erased flash reads as `0xFF`. A write can only clear bits.
pub trait FlashHal {
    /// Read `buf.len()` bytes starting at `addr`
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` starting at `addr`
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase the sector starting at `addr`
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;
}

impl<T: FlashHal + ?Sized> FlashHal for &mut T {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        T::read(self, addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        T::write(self, addr, data)
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        T::erase_sector(self, addr)
    }
}

/// Program flash, refusing protected addresses without touching the device
pub fn guarded_write<C: NvCfg, F: FlashHal>(
    flash: &mut F,
    addr: u32,
    data: &[u8],
) -> Result<(), FlashError> {
    if addr < C::MIN_WRITE_ADDRESS {
        return Err(FlashError::BadAddress);
    }
    flash.write(addr, data)
}

/// Erase a sector, refusing protected addresses without touching the device
pub fn guarded_erase<C: NvCfg, F: FlashHal>(flash: &mut F, addr: u32) -> Result<(), FlashError> {
    if addr < C::MIN_WRITE_ADDRESS {
        return Err(FlashError::BadAddress);
    }
    flash.erase_sector(addr)
}

/// Read a little endian word
pub fn read_u32<F: FlashHal>(flash: &mut F, addr: u32) -> Result<u32, FlashError> {
    let mut b = [0u8; 4];
    flash.read(addr, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Bounded retry state for one flash primitive
#[derive(Debug, Default)]
pub struct Retrier {
    used: u8,
    wait_until: Option<Instant>,
}

impl Retrier {
    /// A fresh retry budget
    pub const fn new() -> Self {
        Self {
            used: 0,
            wait_until: None,
        }
    }

    /// May a primitive be attempted at `now`?
    pub fn ready(&self, now: Instant) -> bool {
        self.wait_until.map(|t| now >= t).unwrap_or(true)
    }

    /// The primitive succeeded, restore the budget
    pub fn reset(&mut self) {
        self.used = 0;
        self.wait_until = None;
    }

    /// The primitive failed at `now`
    ///
    /// Returns None if it should be retried after the back-off, or the
    /// final result if the budget is spent. Rejected addresses are never
    /// retried.
    pub fn failed<C: NvCfg>(&mut self, err: FlashError, now: Instant) -> Option<NvResult> {
        if err == FlashError::BadAddress {
            self.reset();
            return Some(NvResult::BadArgs);
        }
        if self.used >= C::FLASH_RETRIES {
            spine_error!("flash failed after {} retries", self.used);
            self.reset();
            return Some(err.into());
        }
        self.used += 1;
        self.wait_until = Some(now + C::RETRY_DELAY);
        spine_debug!("flash retry {}", self.used);
        None
    }
}

#[cfg(any(test, feature = "std"))]
pub use ram::RamFlash;

#[cfg(any(test, feature = "std"))]
mod ram {
    use super::{FlashError, FlashHal};

    /// Flash held in memory, with NOR semantics
    ///
    /// Every access is validated against the covered range exactly like
    /// the hardware driver, and erases must be sector aligned.
    #[derive(Debug, Clone)]
    pub struct RamFlash {
        base: u32,
        sector_size: u32,
        mem: Vec<u8>,
        writes: usize,
        erases: usize,
    }

    impl RamFlash {
        /// Erased flash covering `base..base + len`
        pub fn new(base: u32, len: u32, sector_size: u32) -> Self {
            Self {
                base,
                sector_size,
                mem: vec![0xFF; len as usize],
                writes: 0,
                erases: 0,
            }
        }

        fn range(&self, addr: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
            let start = addr
                .checked_sub(self.base)
                .ok_or(FlashError::BadAddress)? as usize;
            let end = start.checked_add(len).ok_or(FlashError::BadAddress)?;
            if end > self.mem.len() {
                return Err(FlashError::BadAddress);
            }
            Ok(start..end)
        }

        /// The raw contents
        pub fn bytes(&self) -> &[u8] {
            &self.mem
        }

        /// The bytes at `addr..addr + len`
        pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
            match self.range(addr, len) {
                Ok(r) => &self.mem[r],
                Err(_) => &[],
            }
        }

        /// Number of successful writes
        pub fn write_count(&self) -> usize {
            self.writes
        }

        /// Number of successful sector erases
        pub fn erase_count(&self) -> usize {
            self.erases
        }
    }

    impl FlashHal for RamFlash {
        fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
            let r = self.range(addr, buf.len())?;
            buf.copy_from_slice(&self.mem[r]);
            Ok(())
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
            let r = self.range(addr, data.len())?;
            self.mem[r]
                .iter_mut()
                .zip(data.iter())
                .for_each(|(m, d)| *m &= *d);
            self.writes += 1;
            Ok(())
        }

        fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
            if addr.wrapping_sub(self.base) % self.sector_size != 0 {
                return Err(FlashError::BadAddress);
            }
            let r = self.range(addr, self.sector_size as usize)?;
            self.mem[r].fill(0xFF);
            self.erases += 1;
            Ok(())
        }
    }
}
