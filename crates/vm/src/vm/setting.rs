/// User-configurable settings for the virtual machine.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of nested frames before `RuntimeError` is raised.
    pub recursion_limit: usize,

    /// Log every block popped while unwinding, at trace level.
    pub trace_unwinding: bool,
}

impl Settings {
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_trace_unwinding(mut self, trace: bool) -> Self {
        self.trace_unwinding = trace;
        self
    }
}

/// Sensible default settings.
impl Default for Settings {
    fn default() -> Self {
        Self {
            recursion_limit: if cfg!(debug_assertions) { 256 } else { 1000 },
            trace_unwinding: false,
        }
    }
}
