use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use instant::Instant;

use crate::app::Replicable;
use crate::config::PaxosConfig;
use crate::error::BuildError;
use crate::event::EventStream;
use crate::executor::{self, Executor};
use crate::failure_detection::FailureDetector;
use crate::instrument::Instrumentation;
use crate::journal::JournalLogger;
use crate::logger::{MemoryLogger, PaxosLogger};
use crate::membership::{Membership, NoMembership};
use crate::messenger::{Messenger, Transport};
use crate::rate_limit::RateLimiter;
use crate::NodeId;

use super::{Inner, PaxosManager};

#[derive(Default)]
pub struct ManagerBuilderBlank;

impl ManagerBuilderBlank {
    pub fn new() -> Self {
        Self
    }

    pub fn for_node(self, node_id: NodeId) -> ManagerBuilderWithNodeId {
        ManagerBuilderWithNodeId { node_id }
    }
}

enum LogSetup {
    WorkingDir(PathBuf),
    Ephemeral,
    Custom(Arc<dyn PaxosLogger>),
}

pub struct ManagerBuilderWithNodeId {
    node_id: NodeId,
}

impl ManagerBuilderWithNodeId {
    /// Keeps the durable log in `dir`, which must be empty or have been used
    /// by a manager before.
    pub fn working_in(self, dir: impl AsRef<std::path::Path>) -> ManagerBuilderWithNodeIdAndLogger {
        self.with_log(LogSetup::WorkingDir(dir.as_ref().to_path_buf()))
    }

    /// Keeps the log in memory. Nothing survives a restart.
    pub fn working_ephemerally(self) -> ManagerBuilderWithNodeIdAndLogger {
        self.with_log(LogSetup::Ephemeral)
    }

    pub fn logging_to(self, logger: Arc<dyn PaxosLogger>) -> ManagerBuilderWithNodeIdAndLogger {
        self.with_log(LogSetup::Custom(logger))
    }

    fn with_log(self, log: LogSetup) -> ManagerBuilderWithNodeIdAndLogger {
        ManagerBuilderWithNodeIdAndLogger {
            node_id: self.node_id,
            log,
        }
    }
}

pub struct ManagerBuilderWithNodeIdAndLogger {
    node_id: NodeId,
    log: LogSetup,
}

impl ManagerBuilderWithNodeIdAndLogger {
    pub fn communicating_via(
        self,
        transport: Arc<dyn Transport>,
    ) -> ManagerBuilderWithNodeIdAndLoggerAndTransport {
        ManagerBuilderWithNodeIdAndLoggerAndTransport {
            node_id: self.node_id,
            log: self.log,
            transport,
        }
    }
}

pub struct ManagerBuilderWithNodeIdAndLoggerAndTransport {
    node_id: NodeId,
    log: LogSetup,
    transport: Arc<dyn Transport>,
}

impl ManagerBuilderWithNodeIdAndLoggerAndTransport {
    pub fn executing(self, app: Arc<dyn Replicable>) -> ManagerBuilder {
        ManagerBuilder {
            node_id: self.node_id,
            log: self.log,
            transport: self.transport,
            app,
            config: PaxosConfig::default(),
            membership: Arc::new(NoMembership),
            executor: None,
            maintained: true,
        }
    }
}

pub struct ManagerBuilder {
    node_id: NodeId,
    log: LogSetup,
    transport: Arc<dyn Transport>,
    app: Arc<dyn Replicable>,
    config: PaxosConfig,
    membership: Arc<dyn Membership>,
    executor: Option<Arc<dyn Executor>>,
    maintained: bool,
}

impl ManagerBuilder {
    pub fn with_config(mut self, config: PaxosConfig) -> Self {
        self.config = config;

        self
    }

    /// Lets the manager create groups it receives packets for.
    pub fn with_membership(mut self, membership: Arc<dyn Membership>) -> Self {
        self.membership = membership;

        self
    }

    /// Runs retransmissions and maintenance on `executor` rather than on a
    /// dedicated thread pool.
    pub fn spawning_on(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);

        self
    }

    /// Leaves calling [`tick`](PaxosManager::tick) and
    /// [`sweep`](PaxosManager::sweep) to the caller.
    pub fn without_maintenance(mut self) -> Self {
        self.maintained = false;

        self
    }

    /// Builds the manager, recovering every group found in the log.
    pub fn build(self) -> Result<(PaxosManager, EventStream), BuildError> {
        let config = self.config;

        let logger: Arc<dyn PaxosLogger> = match self.log {
            LogSetup::WorkingDir(dir) => Arc::new(JournalLogger::open(dir)?),
            LogSetup::Ephemeral => Arc::new(MemoryLogger::new()),
            LogSetup::Custom(logger) => logger,
        };

        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(executor::pool(config.messenger_workers).map_err(BuildError::Executor)?),
        };

        let messenger = Messenger::new(
            self.node_id,
            self.transport,
            executor,
            config.retransmit_base_delay,
        );

        let (sender, receiver) = futures::channel::mpsc::unbounded();

        let manager = PaxosManager {
            inner: Arc::new(Inner {
                me: self.node_id,
                detector: FailureDetector::new(
                    self.node_id,
                    config.failure_detection_timeout,
                    config.coordinator_failure_timeout,
                ),
                instrumentation: Arc::new(Instrumentation::new(config.profiler_alpha)),
                rate_limiter: config.max_request_rate.map(RateLimiter::new),
                logger,
                app: self.app,
                membership: self.membership,
                messenger,
                instances: Mutex::new(HashMap::new()),
                morgue: Mutex::new(HashMap::new()),
                events: sender,
                last_ping: Mutex::new(Instant::now()),
                config,
            }),
        };

        manager.inner.recover_all()?;

        if self.maintained {
            manager.spawn_maintenance()?;
        }

        Ok((manager, EventStream::new(receiver)))
    }
}
