/// Process-wide enablement toggle.  Only explicit user action flips it; it is
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnablementGate {
    enabled: bool,
}

impl EnablementGate {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_open(&self) -> bool {
        self.enabled
    }

    /// Returns whether the value changed.
    pub fn set(&mut self, enabled: bool) -> bool {
        let changed = self.enabled != enabled;
        self.enabled = enabled;
        changed
    }

    /// Returns the new value.
    pub fn toggle(&mut self) -> bool {
        self.enabled = !self.enabled;
        self.enabled
    }
}

impl Default for EnablementGate {
    fn default() -> Self {
        Self::new(true)
    }
}
