use crate::hal::protection::{ProtectionState, ProtectionUnit, ResetCause, SystemReset};

/// Protection unit that records every save and restore it goes through.
#[derive(Debug)]
pub struct FakeMpu {
    pub enabled: bool,
    pub region_config: u32,
    pub saves: usize,
    pub restores: usize,
}

impl Default for FakeMpu {
    fn default() -> Self { Self { enabled: true, region_config: 0x5EC0_0001, saves: 0, restores: 0 } }
}

impl ProtectionUnit for FakeMpu {
    fn save_and_disable(&mut self) -> ProtectionState {
        self.saves += 1;
        let state = ProtectionState(self.region_config | (self.enabled as u32) << 31);
        self.enabled = false;
        state
    }

    fn restore(&mut self, state: ProtectionState) {
        self.restores += 1;
        self.enabled = state.0 >> 31 == 1;
        self.region_config = state.0 & !(1 << 31);
    }
}

/// Host stand-in for a system reset. There is nothing to reset on the
/// host, so the calling thread unwinds with the cause in the panic
/// message instead.
#[derive(Debug, Default)]
pub struct PanickingReset;

impl SystemReset for PanickingReset {
    fn reset(&mut self, cause: ResetCause) -> ! {
        log::warn!("System reset requested: {:?}", cause);
        panic!("system reset: {:?}", cause)
    }
}
