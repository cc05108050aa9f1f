use lazy_static::lazy_static;
use log::{info, warn};

use crate::{env::{schedule::Machine, Image, Kernel, LOG2NENV}, err::Error};

/// default number of physical frames
pub const NPAGES: usize = 1024;

/// Boot-time sizing of the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// the env table holds `1 << log2_nenv` slots
    pub log2_nenv: usize,
    /// physical frames in simulated RAM
    pub npages: usize,
    pub ncpu: usize,
}

impl KernelConfig {
    pub const fn new() -> Self {
        KernelConfig {
            log2_nenv: LOG2NENV,
            npages: NPAGES,
            ncpu: 1,
        }
    }

    pub const fn log2_nenv(mut self, log2_nenv: usize) -> Self {
        self.log2_nenv = log2_nenv;
        self
    }

    pub const fn npages(mut self, npages: usize) -> Self {
        self.npages = npages;
        self
    }

    pub const fn ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    /// The table must fit in an env id next to its generation, and there
    /// must be at least one frame and one cpu.
    pub fn validate(&self) -> Result<(), Error> {
        if self.log2_nenv == 0 || self.log2_nenv > LOG2NENV || self.npages == 0 || self.ncpu == 0 {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// the kernel booted by [`Init`]
    pub static ref KERNEL: Kernel = Kernel::new(KernelConfig::default())
        .unwrap_or_else(|err| panic!("mos init failed: {}", err));
}

pub struct Init;

impl Init {
    /// Load the boot programs and give cpu 0 to the scheduler.
    pub fn init<M: Machine>(&mut self, images: &[Image], machine: &M) -> ! {
        info!("mos init");
        for image in images {
            if let Err(err) = KERNEL.env_create(image) {
                warn!("boot program at {:?} not loaded: {}", image.entry, err);
            }
        }
        KERNEL.schedule(0, machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
        assert_eq!(KernelConfig::default().log2_nenv(0).validate(), Err(Error::Inval));
        assert_eq!(KernelConfig::default().log2_nenv(LOG2NENV + 1).validate(), Err(Error::Inval));
        assert_eq!(KernelConfig::default().npages(0).validate(), Err(Error::Inval));
        assert_eq!(KernelConfig::default().ncpu(0).validate(), Err(Error::Inval));
        assert!(Kernel::new(KernelConfig::default().ncpu(0)).is_err());
    }
}
