//! Configuration for the engine.
//!
//! The configuration controls how procedures are hosted and how strictly the
//! pre-call synchroniser treats unusual replies:
//! - Thread naming and stack size for procedure threads
//! - Whether "nothing to do" during a broadcast is an error
//! - Size of the synchroniser's transition log

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix for the OS thread name of every procedure.
    pub thread_name_prefix: String,
    /// Stack size for procedure threads. `None` uses the platform default.
    pub stack_size: Option<usize>,
    /// Treat "nothing to do" from a procedure that owes an acknowledgement
    /// as a protocol violation instead of an implicit acknowledgement.
    pub strict_acknowledgement: bool,
    /// Maximum number of synchroniser state transitions kept for inspection.
    ///
    /// `0` disables the log.
    pub transition_log_capacity: usize,
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            thread_name_prefix: String::from("coro:"),
            stack_size: None,
            strict_acknowledgement: false,
            transition_log_capacity: 256,
        }
    }

    /// Sets the procedure thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the procedure thread stack size in bytes.
    #[must_use]
    pub const fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Sets whether a missing acknowledgement is a protocol violation.
    #[must_use]
    pub const fn strict_acknowledgement(mut self, value: bool) -> Self {
        self.strict_acknowledgement = value;
        self
    }

    /// Sets the transition log capacity.
    #[must_use]
    pub const fn transition_log_capacity(mut self, capacity: usize) -> Self {
        self.transition_log_capacity = capacity;
        self
    }

    /// Thread name for a procedure with the given name.
    pub(crate) fn thread_name(&self, procedure: &str) -> String {
        format!("{}{procedure}", self.thread_name_prefix)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.thread_name_prefix, "coro:");
        assert!(config.stack_size.is_none());
        assert!(!config.strict_acknowledgement);
        assert_eq!(config.transition_log_capacity, 256);
    }

    #[test]
    fn builder_setters() {
        let config = EngineConfig::new()
            .thread_name_prefix("t-")
            .stack_size(64 * 1024)
            .strict_acknowledgement(true)
            .transition_log_capacity(0);

        assert_eq!(config.thread_name("body"), "t-body");
        assert_eq!(config.stack_size, Some(64 * 1024));
        assert!(config.strict_acknowledgement);
        assert_eq!(config.transition_log_capacity, 0);
    }
}
