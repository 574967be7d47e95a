//! QA test-suite configuration.

/// Independent boolean flags selecting which QA steps run, with one
/// mutual-exclusion rule: enabling `flash_fast` clears `flash_erase_blank`
/// and vice versa. Enforced here, in the setters, not at plan-start time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QaConfig {
    sram_basic: bool,
    sram_full: bool,
    flash_erase_blank: bool,
    flash_fast: bool,
    ppb_unlock: bool,
    backup_flash_probe: bool,
}

impl QaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sram_basic(&self) -> bool {
        self.sram_basic
    }

    pub fn set_sram_basic(&mut self, enabled: bool) {
        self.sram_basic = enabled;
    }

    pub fn sram_full(&self) -> bool {
        self.sram_full
    }

    pub fn set_sram_full(&mut self, enabled: bool) {
        self.sram_full = enabled;
    }

    pub fn flash_erase_blank(&self) -> bool {
        self.flash_erase_blank
    }

    pub fn set_flash_erase_blank(&mut self, enabled: bool) {
        self.flash_erase_blank = enabled;
        if enabled {
            self.flash_fast = false;
        }
    }

    pub fn flash_fast(&self) -> bool {
        self.flash_fast
    }

    pub fn set_flash_fast(&mut self, enabled: bool) {
        self.flash_fast = enabled;
        if enabled {
            self.flash_erase_blank = false;
        }
    }

    pub fn ppb_unlock(&self) -> bool {
        self.ppb_unlock
    }

    pub fn set_ppb_unlock(&mut self, enabled: bool) {
        self.ppb_unlock = enabled;
    }

    pub fn backup_flash_probe(&self) -> bool {
        self.backup_flash_probe
    }

    pub fn set_backup_flash_probe(&mut self, enabled: bool) {
        self.backup_flash_probe = enabled;
    }

    /// Number of steps a QA plan will run with this configuration. Mirrors
    /// `plan::qa`'s own counting so callers (e.g. a progress bar) can size
    /// themselves before the plan starts.
    pub fn enabled_step_count(&self) -> usize {
        [
            self.sram_basic,
            self.sram_full,
            self.flash_erase_blank || self.flash_fast,
            self.ppb_unlock,
            self.backup_flash_probe,
        ]
        .iter()
        .filter(|&&b| b)
        .count()
    }
}
