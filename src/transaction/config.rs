//! Transaction manager configuration.

/// Options for a [`TxManager`](crate::transaction::TxManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Thread name for the workers spawned by
    /// [`TxManager::with_transaction_cancellable`](crate::transaction::TxManager::with_transaction_cancellable).
    pub worker_thread_name: String,
    /// Stack size for those workers; `None` keeps the platform default.
    pub worker_stack_size: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: "txscope-worker".to_string(),
            worker_stack_size: None,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread name.
    pub fn worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    /// Set the worker stack size in bytes.
    pub fn worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = Some(bytes);
        self
    }
}
