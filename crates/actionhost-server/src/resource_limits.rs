//! Resource limits for sandboxed actions.
//!
//! Tenant code is untrusted, so every action runs under a wall-clock deadline,
//! every store call it makes has its own deadline, and the engine's loop and
//! recursion guards are armed before the first statement runs.

use std::time::Duration;

/// Resource limits for one action execution.
///
/// # Fields
///
/// - `execution_timeout` - Wall-clock budget for the whole action (default: 30 seconds)
/// - `store_call_timeout` - Deadline for each store call and pool acquisition (default: 10 seconds)
/// - `loop_iteration_limit` - Iterations any single loop may run (default: 10,000,000)
/// - `recursion_limit` - Maximum call depth (default: 512)
///
/// # Memory Limiting
///
/// Boa has no heap cap. A runaway allocation is only stopped indirectly by the
/// loop limit and the execution deadline.
///
/// # Example
///
/// ```
/// use actionhost_server::ResourceLimits;
/// use std::time::Duration;
///
/// let limits = ResourceLimits::new()
///     .with_execution_timeout(Duration::from_secs(5))
///     .with_store_call_timeout(Duration::from_secs(2));
/// assert!(limits.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub execution_timeout: Duration,
    pub store_call_timeout: Duration,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            store_call_timeout: Duration::from_secs(10),
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
        }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_store_call_timeout(mut self, timeout: Duration) -> Self {
        self.store_call_timeout = timeout;
        self
    }

    pub fn with_loop_iteration_limit(mut self, limit: u64) -> Self {
        self.loop_iteration_limit = limit;
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Validates the resource limits configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Either timeout is zero
    /// - Either timeout is excessively long (> 1 hour)
    /// - The loop or recursion limit is zero
    pub fn validate(&self) -> Result<(), String> {
        for (name, timeout) in [
            ("execution timeout", self.execution_timeout),
            ("store call timeout", self.store_call_timeout),
        ] {
            if timeout.is_zero() {
                return Err(format!("{} must be greater than zero", name));
            }
            if timeout.as_secs() > 3600 {
                return Err(format!(
                    "{} must be <= 1 hour (got {} seconds)",
                    name,
                    timeout.as_secs()
                ));
            }
        }

        if self.loop_iteration_limit == 0 {
            return Err("loop iteration limit must be greater than zero".to_string());
        }
        if self.recursion_limit == 0 {
            return Err("recursion limit must be greater than zero".to_string());
        }

        Ok(())
    }
}
