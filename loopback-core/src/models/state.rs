/// Engine lifecycle.
///
/// ```text
/// (open) → Opened → Running → Stopping → Stopped → (closed on drop)
/// ```
///
/// `Closed` is not a variant: an engine that has been closed no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Opened,
    Running,
    Stopping,
    Stopped,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Buffers returned by the device are recycled only while this holds.
    pub fn recycles_buffers(&self) -> bool {
        matches!(self, Self::Opened | Self::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}
