//! Interface to the scheduler's record of why tasks ended.

use crate::backend;
use crate::target::TaskId;

use async_trait::async_trait;
use std::sync::Arc;

/// Tells apart a task being preempted from a transient network failure.
///
/// When a job shrinks, the scheduler cancels tasks and the backends behind
/// them drop their connections. To a dispatcher, that looks exactly like a
/// flaky network. Consulting the task's error code keeps such cancellations
/// from being retried as if they were blips.
#[async_trait]
pub trait ErrorCodeOracle: Send + Sync {
    /// Returns true if `error` is the kind of failure preemption produces.
    fn should_check_error_code(&self, error: &backend::Error) -> bool;

    /// Returns the error code the task ended with, if it has ended.
    async fn task_error_code(&self, task_id: TaskId) -> Option<i32>;
}

pub type SharedOracle = Arc<dyn ErrorCodeOracle>;
