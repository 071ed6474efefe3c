//! Defines the [`Executor`] trait and its [default implementation][pool].

use futures::future::BoxFuture;
use futures::task::SpawnExt;

/// Runs the background work of a node, i.e. retransmissions and maintenance.
pub trait Executor: Send + Sync + 'static {
    /// Executes the given task.
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<(), futures::task::SpawnError>;
}

impl<S: futures::task::Spawn + Send + Sync + 'static> Executor for S {
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<(), futures::task::SpawnError> {
        self.spawn(task)
    }
}

/// Creates a thread pool with `workers` threads.
pub fn pool(workers: usize) -> Result<futures::executor::ThreadPool, std::io::Error> {
    futures::executor::ThreadPool::builder()
        .pool_size(workers.max(1))
        .name_prefix("replipaxos-")
        .create()
}

/// Executor which runs each task to completion on the calling thread.
///
/// Only suitable when tasks never wait on timers, e.g. in tests which inject
/// an immediate sleep into the messenger.
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<(), futures::task::SpawnError> {
        futures::executor::block_on(task);
        Ok(())
    }
}
