use crate::error::Error;

/// Size of the heap arena reserved for each instance, in bytes.
pub const DEFAULT_HEAP_SIZE: usize = 16_000_000;

/// Stack size given to worker threads unless configured otherwise.
pub const DEFAULT_WORKER_STACK_SIZE: usize = 256 * 1024;

/// Smallest worker stack the adapter will request from the operating system.
pub const MIN_WORKER_STACK_SIZE: usize = 16 * 1024;

/// Number of exit handlers each thread, and each instance, may register.
pub const DEFAULT_MAX_EXIT_HANDLERS: usize = 32;

/// Resource limits and policy knobs for an instance.
///
/// Both `Limits::default()` and the `with_*` builders are `const`, so limits can be declared as
/// statics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Size of the heap arena reserved when the instance is created. (default 16,000,000)
    pub heap_size: usize,
    /// Stack size of worker threads. (default 256K)
    pub worker_stack_size: usize,
    /// Maximum number of exit handlers per thread, and for the instance itself. (default 32)
    pub max_exit_handlers: usize,
    /// Promote extension images loaded from worker threads to process-wide ownership as soon as
    /// they are loaded. (default true)
    pub promote_worker_loads: bool,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits::default()
    }
}

impl Limits {
    pub const fn default() -> Limits {
        Limits {
            heap_size: DEFAULT_HEAP_SIZE,
            worker_stack_size: DEFAULT_WORKER_STACK_SIZE,
            max_exit_handlers: DEFAULT_MAX_EXIT_HANDLERS,
            promote_worker_loads: true,
        }
    }

    pub const fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }

    pub const fn with_worker_stack_size(mut self, worker_stack_size: usize) -> Self {
        self.worker_stack_size = worker_stack_size;
        self
    }

    pub const fn with_max_exit_handlers(mut self, max_exit_handlers: usize) -> Self {
        self.max_exit_handlers = max_exit_handlers;
        self
    }

    pub const fn with_promote_worker_loads(mut self, promote_worker_loads: bool) -> Self {
        self.promote_worker_loads = promote_worker_loads;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.heap_size == 0 {
            return Err(Error::InvalidArgument("heap size must be greater than 0"));
        }
        if self.worker_stack_size < MIN_WORKER_STACK_SIZE {
            return Err(Error::InvalidArgument(
                "worker stack size must be at least MIN_WORKER_STACK_SIZE",
            ));
        }
        if self.max_exit_handlers == 0 {
            tracing::info!("exit handler registration is disabled for this instance");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_override_defaults() {
        const LIMITS: Limits = Limits::default()
            .with_heap_size(4096)
            .with_max_exit_handlers(2)
            .with_promote_worker_loads(false);
        assert_eq!(LIMITS.heap_size, 4096);
        assert_eq!(LIMITS.max_exit_handlers, 2);
        assert!(!LIMITS.promote_worker_loads);
        assert_eq!(LIMITS.worker_stack_size, DEFAULT_WORKER_STACK_SIZE);
        assert!(LIMITS.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_limits() {
        assert!(matches!(
            Limits::default().with_heap_size(0).validate(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Limits::default().with_worker_stack_size(1024).validate(),
            Err(Error::InvalidArgument(_))
        ));
    }
}
