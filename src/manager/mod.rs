//! The [`PaxosManager`], which hosts every replica group of a node.
//!
//! Incoming frames are routed to the group they belong to. Groups not in
//! memory are unpaused, recovered or, if the membership service says this node
//! is a member, created on the fly. Periodic maintenance drives the groups'
//! timers and pauses groups that went quiet.

mod builder;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use futures::future::FutureExt;
use instant::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::app::Replicable;
use crate::config::PaxosConfig;
use crate::error::{CreateGroupError, LogError, ProposeError};
use crate::event::Event;
use crate::failure_detection::FailureDetector;
use crate::instance::{InstanceContext, Outcome, PaxosInstance};
use crate::instrument::Instrumentation;
use crate::logger::PaxosLogger;
use crate::membership::Membership;
use crate::messenger::Messenger;
use crate::packet::{self, PacketBody, PaxosPacket, RequestPacket};
use crate::rate_limit::RateLimiter;
use crate::recovery::{RecoveryInfo, SlotBallotState};
use crate::task::{MessagingTask, Task};
use crate::util::lock;
use crate::{GroupId, NodeId, Slot, Version};

pub use builder::{
    ManagerBuilder, ManagerBuilderBlank, ManagerBuilderWithNodeId,
    ManagerBuilderWithNodeIdAndLogger, ManagerBuilderWithNodeIdAndLoggerAndTransport,
};

type InstanceRef = Arc<Mutex<PaxosInstance>>;

/// Handle to the replica groups of one node.
///
/// Handles are cheap to clone. Background maintenance stops once the last
/// handle is dropped.
#[derive(Clone)]
pub struct PaxosManager {
    inner: Arc<Inner>,
}

struct Inner {
    me: NodeId,
    config: PaxosConfig,
    logger: Arc<dyn PaxosLogger>,
    app: Arc<dyn Replicable>,
    membership: Arc<dyn Membership>,
    messenger: Messenger,
    detector: FailureDetector,
    instrumentation: Arc<Instrumentation>,
    rate_limiter: Option<RateLimiter>,
    /// Locked before any instance.
    instances: Mutex<HashMap<GroupId, InstanceRef>>,
    /// Recently killed groups, whose stale packets must not resurrect them.
    morgue: Mutex<HashMap<GroupId, (Version, Instant)>>,
    events: futures::channel::mpsc::UnboundedSender<Event>,
    last_ping: Mutex<Instant>,
}

impl PaxosManager {
    pub fn node_id(&self) -> NodeId {
        self.inner.me
    }

    pub fn config(&self) -> &PaxosConfig {
        &self.inner.config
    }

    pub fn instrumentation(&self) -> Arc<Instrumentation> {
        Arc::clone(&self.inner.instrumentation)
    }

    /// Creates a replica group with this node as one of `members`.
    ///
    /// An older version of the group is replaced, an equal or newer one is
    /// left alone.
    pub fn create_group(
        &self,
        group: GroupId,
        version: Version,
        members: Vec<NodeId>,
        initial_state: Option<Vec<u8>>,
    ) -> Result<(), CreateGroupError> {
        self.inner.create_group(group, version, members, initial_state)
    }

    /// Deletes the group, returning whether it existed.
    pub fn delete_group(&self, group: &GroupId) -> bool {
        self.inner.delete_group(group)
    }

    /// Submits `request` to `group`.
    ///
    /// Completes once the request was handed to the coordinator. Execution is
    /// reported through [`Event::Executed`].
    pub async fn propose(
        &self,
        group: &GroupId,
        mut request: RequestPacket,
    ) -> Result<(), ProposeError> {
        if let Some(limiter) = &self.inner.rate_limiter {
            limiter.record().await;
        }

        request.client = Some(self.inner.me);

        self.inner.propose(group, request)
    }

    /// Handles a frame received from the transport.
    pub fn handle_incoming(&self, frame: &[u8]) {
        self.inner.handle_incoming(frame);
    }

    /// Drives the timers of every active group once.
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// Pauses quiescent groups that have been idle for long, returning how
    /// many were paused.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Sends a ping to every node sharing a group with this one.
    pub fn ping(&self) {
        self.inner.ping();
    }

    /// The next slot `group` will execute, if it is in memory.
    pub fn next_slot(&self, group: &GroupId) -> Option<Slot> {
        self.inner
            .lookup(group)
            .map(|instance| lock(&instance).next_slot())
    }

    /// Whether this node currently coordinates `group`.
    pub fn is_coordinator(&self, group: &GroupId) -> bool {
        self.inner
            .lookup(group)
            .map_or(false, |instance| lock(&instance).is_coordinator())
    }

    pub fn version_of(&self, group: &GroupId) -> Option<Version> {
        match self.inner.lookup(group) {
            Some(instance) => Some(lock(&instance).version()),
            None => self
                .inner
                .logger
                .recovery_info(group)
                .ok()
                .flatten()
                .map(|info| info.version),
        }
    }

    /// The state `group` had reached when it was stopped at `version`.
    ///
    /// Kept after the group itself is gone, until deleted through
    /// [`delete_final_state`](Self::delete_final_state).
    pub fn final_state(
        &self,
        group: &GroupId,
        version: Version,
    ) -> Result<Option<SlotBallotState>, LogError> {
        self.inner.logger.final_state(group, version)
    }

    pub fn delete_final_state(&self, group: &GroupId, version: Version) -> Result<(), LogError> {
        self.inner.logger.delete_final_state(group, version)
    }

    /// Whether `group` is known, in memory or paused.
    pub fn contains(&self, group: &GroupId) -> bool {
        self.version_of(group).is_some()
    }

    /// Groups in memory.
    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<_> = lock(&self.inner.instances).keys().cloned().collect();
        groups.sort();
        groups
    }

    fn spawn_maintenance(&self) -> Result<(), futures::task::SpawnError> {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.maintenance_interval;

        self.inner
            .messenger
            .executor()
            .execute(maintain(weak, interval).boxed())
    }
}

async fn maintain(inner: Weak<Inner>, interval: std::time::Duration) {
    loop {
        futures_timer::Delay::new(interval).await;

        match inner.upgrade() {
            Some(inner) => inner.maintain(),
            None => break,
        }
    }
}

impl Inner {
    fn context(&self) -> InstanceContext<'_> {
        InstanceContext {
            me: self.me,
            config: &self.config,
            logger: self.logger.as_ref(),
            app: self.app.as_ref(),
            detector: &self.detector,
            instrumentation: &self.instrumentation,
        }
    }

    fn emit(&self, event: Event) {
        // nobody listening is fine
        let _ = self.events.unbounded_send(event);
    }

    fn lookup(&self, group: &GroupId) -> Option<InstanceRef> {
        lock(&self.instances).get(group).cloned()
    }

    /// Rebuilds every group found in the log.
    fn recover_all(&self) -> Result<usize, LogError> {
        let infos = self.logger.recovery_infos()?;
        let count = infos.len();

        for info in infos {
            // the application state of a paused group did not survive
            self.logger.unpause(&info.group)?;
            self.detector.monitor(&info.members);

            let (version, outcome) = {
                let mut instances = lock(&self.instances);
                let mut instance = PaxosInstance::recover(&self.context(), &info)?;
                let outcome = instance.take();
                let version = instance.version();

                instances.insert(info.group.clone(), Arc::new(Mutex::new(instance)));
                (version, outcome)
            };

            self.dispatch(&info.group, version, outcome);
        }

        if count > 0 {
            info!(node = self.me, groups = count, "Recovered groups from log.");
        }

        Ok(count)
    }

    /// Returns the instance of `group`, bringing it back into memory if it was
    /// paused or is only known to the log.
    fn activate(&self, group: &GroupId) -> Result<Option<InstanceRef>, LogError> {
        let (instance, version, outcome) = {
            let mut instances = lock(&self.instances);

            if let Some(instance) = instances.get(group) {
                return Ok(Some(Arc::clone(instance)));
            }

            let ctx = self.context();
            let mut instance = if let Some(idle) = self.logger.unpause(group)? {
                PaxosInstance::from_idle(&ctx, idle)?
            } else if let Some(info) = self.logger.recovery_info(group)? {
                PaxosInstance::recover(&ctx, &info)?
            } else {
                return Ok(None);
            };

            let outcome = instance.take();
            let version = instance.version();
            self.detector.monitor(instance.members());
            let instance = Arc::new(Mutex::new(instance));

            instances.insert(group.clone(), Arc::clone(&instance));
            (instance, version, outcome)
        };

        self.dispatch(group, version, outcome);

        Ok(Some(instance))
    }

    fn create_group(
        &self,
        group: GroupId,
        version: Version,
        members: Vec<NodeId>,
        initial_state: Option<Vec<u8>>,
    ) -> Result<(), CreateGroupError> {
        if members.is_empty() {
            return Err(CreateGroupError::NoMembers);
        }
        if !members.contains(&self.me) {
            return Err(CreateGroupError::NotMember(self.me));
        }

        let outcome = {
            let mut instances = lock(&self.instances);

            let existing = match instances.get(&group) {
                Some(instance) => Some(lock(instance).version()),
                None => self.logger.recovery_info(&group)?.map(|info| info.version),
            };

            if let Some(existing) = existing {
                if existing >= version {
                    return Err(CreateGroupError::Exists {
                        group,
                        version: existing,
                    });
                }

                info!(node = self.me, group = %group, existing, version, "Replacing group.");
                self.kill_locked(&mut instances, &group);
                self.emit(Event::Deleted {
                    group: group.clone(),
                    version: existing,
                });
            }

            self.logger.put_recovery_info(RecoveryInfo {
                group: group.clone(),
                version,
                members: members.clone(),
                state: initial_state.clone(),
            })?;

            if !self.app.restore(&group, initial_state.as_deref()) {
                warn!(node = self.me, group = %group, "Application rejected initial state.");
            }

            self.detector.monitor(&members);
            self.messenger.reset(&group);
            lock(&self.morgue).remove(&group);

            let ctx = self.context();
            let mut instance = PaxosInstance::new(&ctx, group.clone(), version, members);
            let outcome = instance.start(&ctx);

            instances.insert(group.clone(), Arc::new(Mutex::new(instance)));
            outcome
        };

        debug!(node = self.me, group = %group, version, "Created group.");

        self.emit(Event::Created {
            group: group.clone(),
            version,
        });
        self.dispatch(&group, version, outcome);

        Ok(())
    }

    /// Removes every trace of `group`, returning its version if it existed.
    fn kill_locked(
        &self,
        instances: &mut HashMap<GroupId, InstanceRef>,
        group: &GroupId,
    ) -> Option<Version> {
        let version = match instances.remove(group) {
            Some(instance) => {
                let instance = lock(&instance);
                self.detector.unmonitor(instance.members());
                Some(instance.version())
            }
            None => self
                .logger
                .recovery_info(group)
                .unwrap_or_else(|err| {
                    warn!(node = self.me, group = %group, ?err, "Failed to read recovery info.");
                    None
                })
                .map(|info| info.version),
        }?;

        if let Err(err) = self.logger.remove(group) {
            error!(node = self.me, group = %group, ?err, "Failed to remove group from log.");
        }

        self.messenger.forget(group);
        lock(&self.morgue).insert(group.clone(), (version, Instant::now()));

        Some(version)
    }

    /// Kills a stopped group, keeping its final checkpoint as final state.
    fn retire_locked(
        &self,
        instances: &mut HashMap<GroupId, InstanceRef>,
        group: &GroupId,
        version: Version,
    ) {
        let kept = self.logger.read_checkpoint(group).and_then(|checkpoint| match checkpoint {
            Some(checkpoint) => self.logger.put_final_state(group, version, checkpoint),
            None => Ok(()),
        });

        if let Err(err) = kept {
            error!(node = self.me, group = %group, version, ?err, "Failed to keep final state.");
        }

        self.kill_locked(instances, group);
    }

    fn delete_group(&self, group: &GroupId) -> bool {
        let killed = {
            let mut instances = lock(&self.instances);
            self.kill_locked(&mut instances, group)
        };

        match killed {
            Some(version) => {
                info!(node = self.me, group = %group, version, "Deleted group.");

                self.emit(Event::Deleted {
                    group: group.clone(),
                    version,
                });
                true
            }
            None => false,
        }
    }

    /// Whether `group` was killed at `version` or later.
    fn is_dead(&self, group: &GroupId, version: Version) -> bool {
        lock(&self.morgue)
            .get(group)
            .map_or(false, |(killed, _)| *killed >= version)
    }

    fn propose(&self, group: &GroupId, request: RequestPacket) -> Result<(), ProposeError> {
        let mut retried = false;

        loop {
            let instance = self
                .activate(group)?
                .ok_or_else(|| ProposeError::UnknownGroup(group.clone()))?;

            let mut guard = lock(&instance);

            // paused between lookup and locking
            if guard.is_paused() && !retried {
                drop(guard);
                retried = true;
                continue;
            }

            let outcome = guard.propose(&self.context(), request)?;
            let version = guard.version();
            drop(guard);

            self.dispatch(group, version, outcome);

            return Ok(());
        }
    }

    fn handle_incoming(&self, frame: &[u8]) {
        let packets = match packet::decode_frame(frame) {
            Ok(packets) => packets,
            Err(err) => {
                warn!(node = self.me, ?err, "Dropping malformed frame.");
                return;
            }
        };

        // replies to every packet of a batch leave together
        let mut outbox = Vec::new();

        for packet in packets {
            let sender = packet.sender();
            if let Some(sender) = sender {
                self.detector.heard_from(sender);
            }

            trace!(
                node = self.me,
                group = %packet.group,
                ?sender,
                "Received {}.",
                packet.type_name()
            );

            match packet.body {
                PacketBody::FailureDetect { .. } => {}
                PacketBody::FindReplicaGroup { from, members } => {
                    self.handle_find_replica_group(packet.group, packet.version, from, members)
                }
                _ => self.route(packet, sender, &mut outbox),
            }
        }

        self.flush(outbox);
    }

    fn route(&self, packet: PaxosPacket, sender: Option<NodeId>, outbox: &mut Vec<MessagingTask>) {
        let group = packet.group.clone();
        let version = packet.version;

        let instance = match self.instance_for(&group, version, sender) {
            Some(instance) => instance,
            None => return,
        };

        let outcome = {
            let mut instance = lock(&instance);

            if instance.version() != version {
                trace!(node = self.me, group = %group, version, "Version mismatch.");
                return;
            }

            let start = Instant::now();
            let outcome = instance.handle_packet(&self.context(), packet);
            self.instrumentation.update_delay("handle", start);
            outcome
        };

        self.dispatch_into(&group, version, outcome, outbox);
    }

    /// Finds the instance a packet of `group` at `version` belongs to.
    fn instance_for(
        &self,
        group: &GroupId,
        version: Version,
        sender: Option<NodeId>,
    ) -> Option<InstanceRef> {
        let instance = match self.activate(group) {
            Ok(instance) => instance,
            Err(err) => {
                error!(node = self.me, group = %group, ?err, "Failed to restore group.");
                return None;
            }
        };

        match instance {
            Some(instance) => {
                let current = lock(&instance).version();

                if version < current {
                    trace!(node = self.me, group = %group, version, current, "Dropping stale packet.");
                    None
                } else if version > current {
                    self.discover(group, version, sender)
                } else {
                    Some(instance)
                }
            }
            None if self.is_dead(group, version) => {
                trace!(node = self.me, group = %group, version, "Dropping packet of killed group.");
                None
            }
            None => self.discover(group, version, sender),
        }
    }

    /// Creates `group` if the membership service knows it, or asks `sender`
    /// about it otherwise.
    fn discover(
        &self,
        group: &GroupId,
        version: Version,
        sender: Option<NodeId>,
    ) -> Option<InstanceRef> {
        match self.membership.current_members(group, version) {
            Some(members) => {
                if !members.contains(&self.me) {
                    debug!(node = self.me, group = %group, version, "Not a member, dropping.");
                    return None;
                }

                match self.create_group(group.clone(), version, members, None) {
                    Ok(()) | Err(CreateGroupError::Exists { .. }) => self.lookup(group),
                    Err(err) => {
                        warn!(node = self.me, group = %group, version, %err, "Failed to create group.");
                        None
                    }
                }
            }
            None => {
                if let Some(sender) = sender.filter(|s| *s != self.me) {
                    debug!(node = self.me, group = %group, version, to = sender, "Asking for group.");

                    self.messenger.send(&MessagingTask::unicast(
                        sender,
                        PaxosPacket::new(
                            group.clone(),
                            version,
                            PacketBody::FindReplicaGroup {
                                from: self.me,
                                members: None,
                            },
                        ),
                    ));
                }
                None
            }
        }
    }

    fn handle_find_replica_group(
        &self,
        group: GroupId,
        version: Version,
        from: NodeId,
        members: Option<Vec<NodeId>>,
    ) {
        match members {
            None => {
                let known = match self.lookup(&group) {
                    Some(instance) => {
                        let instance = lock(&instance);
                        Some((instance.version(), instance.members().to_vec()))
                    }
                    None => self
                        .logger
                        .recovery_info(&group)
                        .ok()
                        .flatten()
                        .map(|info| (info.version, info.members)),
                };

                if let Some((version, members)) = known {
                    self.messenger.send(&MessagingTask::unicast(
                        from,
                        PaxosPacket::new(
                            group,
                            version,
                            PacketBody::FindReplicaGroup {
                                from: self.me,
                                members: Some(members),
                            },
                        ),
                    ));
                }
            }
            Some(members) => {
                if !members.contains(&self.me) || self.is_dead(&group, version) {
                    return;
                }

                match self.create_group(group.clone(), version, members, None) {
                    Ok(()) => info!(node = self.me, group = %group, version, from, "Discovered group."),
                    Err(CreateGroupError::Exists { .. }) => {}
                    Err(err) => warn!(node = self.me, group = %group, %err, "Failed to create discovered group."),
                }
            }
        }
    }

    /// Carries out the outcome of an instance of `group`, including whatever
    /// the instance sends to itself.
    fn dispatch(&self, group: &GroupId, version: Version, outcome: Outcome) {
        let mut outbox = Vec::new();
        self.dispatch_into(group, version, outcome, &mut outbox);
        self.flush(outbox);
    }

    /// Like [`dispatch`](Self::dispatch), but leaves remote messages in
    /// `outbox`.
    fn dispatch_into(
        &self,
        group: &GroupId,
        version: Version,
        outcome: Outcome,
        outbox: &mut Vec<MessagingTask>,
    ) {
        let mut local = VecDeque::new();

        self.carry_out(group, version, outcome, &mut local, outbox);

        while let Some(packet) = local.pop_front() {
            let instance = match self.lookup(&packet.group) {
                Some(instance) => instance,
                None => continue,
            };

            let (group, version, outcome) = {
                let mut instance = lock(&instance);

                if instance.version() != packet.version {
                    continue;
                }

                let outcome = instance.handle_packet(&self.context(), packet);
                (instance.group().clone(), instance.version(), outcome)
            };

            self.carry_out(&group, version, outcome, &mut local, outbox);
        }
    }

    /// Sends `outbox`, merging tasks bound for the same recipients.
    fn flush(&self, outbox: Vec<MessagingTask>) {
        if outbox.is_empty() {
            return;
        }

        let tasks = outbox.len();
        let merged = MessagingTask::coalesce(outbox);
        self.instrumentation
            .update_value("batch", tasks as f64 / merged.len().max(1) as f64);

        for task in &merged {
            self.messenger.send(task);
        }
    }

    fn carry_out(
        &self,
        group: &GroupId,
        version: Version,
        outcome: Outcome,
        local: &mut VecDeque<PaxosPacket>,
        outbox: &mut Vec<MessagingTask>,
    ) {
        for mut task in outcome.tasks {
            task.stamp(group, version);

            let task = match task {
                Task::Message(task) => task,
                Task::LogAndMessage(task) => {
                    let (task, log_msg) = task.into_parts();
                    let start = Instant::now();

                    // nothing may be sent that relies on an unlogged promise
                    if let Err(err) = self.logger.append(&log_msg) {
                        error!(
                            node = self.me,
                            group = %group,
                            ?err,
                            "Failed to log {}.",
                            log_msg.type_name()
                        );
                        continue;
                    }

                    self.instrumentation.update_delay("log", start);
                    task
                }
            };

            if task.is_empty() {
                continue;
            }

            let (to_self, remote) = task.split_local(self.me);
            local.extend(to_self);

            outbox.extend(remote);
        }

        let mut executed = None;
        let mut stopped = false;

        for event in outcome.events {
            match &event {
                Event::Executed { slot, .. } => executed = Some(*slot),
                Event::Stopped { .. } => stopped = true,
                _ => {}
            }
            self.emit(event);
        }

        if let Some(slot) = executed {
            self.messenger.supersede(group, slot + 1);
        }

        if stopped {
            let mut instances = lock(&self.instances);

            let current = instances.get(group).map(|i| lock(i).version());
            if current == Some(version) {
                self.retire_locked(&mut instances, group, version);
            }
        }
    }

    fn tick(&self) {
        let instances: Vec<_> = lock(&self.instances).values().cloned().collect();

        for instance in instances {
            let (group, version, outcome) = {
                let mut instance = lock(&instance);
                let outcome = instance.tick(&self.context());
                (instance.group().clone(), instance.version(), outcome)
            };

            if !outcome.is_empty() {
                self.dispatch(&group, version, outcome);
            }
        }
    }

    fn sweep(&self) -> usize {
        let paused = {
            let mut instances = lock(&self.instances);
            let mut paused = Vec::new();

            for (group, instance) in instances.iter() {
                let mut instance = lock(instance);

                if instance.is_stopped() || !instance.is_long_idle() || !instance.is_quiescent() {
                    continue;
                }

                // without a pause record the group is recovered from its log
                if let Err(err) = self.logger.pause(instance.to_idle()) {
                    warn!(node = self.me, group = %group, ?err, "Failed to log pause.");
                }

                paused.push(group.clone());
            }

            for group in &paused {
                if let Some(instance) = instances.remove(group) {
                    self.detector.unmonitor(lock(&instance).members());
                }
                self.messenger.reset(group);
            }

            paused
        };

        let count = paused.len();

        for group in paused {
            trace!(node = self.me, group = %group, "Paused group.");
            self.emit(Event::Paused { group });
        }

        if count > 0 {
            debug!(node = self.me, count, "Paused idle groups.");
        }

        count
    }

    fn ping(&self) {
        *lock(&self.last_ping) = Instant::now();

        let targets = self.detector.ping_targets();
        if targets.is_empty() {
            return;
        }

        self.messenger.send(&MessagingTask::multicast(
            targets,
            PaxosPacket::new(GroupId::new(), 0, PacketBody::FailureDetect { from: self.me }),
        ));
    }

    fn maintain(&self) {
        let start = Instant::now();

        self.tick();
        self.sweep();

        if start.saturating_duration_since(*lock(&self.last_ping)) >= self.config.ping_interval {
            self.ping();
        }

        let morgue_delay = self.config.morgue_delay;
        lock(&self.morgue).retain(|group, (_, killed)| {
            let keep = start.saturating_duration_since(*killed) < morgue_delay;
            if !keep {
                self.messenger.reset(group);
            }
            keep
        });

        self.instrumentation.update_delay("maintenance", start);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::PaxosManager;
    use crate::app::Replicable;
    use crate::config::PaxosConfig;
    use crate::error::{CreateGroupError, IoError, LogError, ProposeError};
    use crate::event::{Event, EventStream};
    use crate::logger::{MemoryLogger, PaxosLogger};
    use crate::messenger::{SendOutcome, Transport};
    use crate::packet::{decode_frame, encode_frame, PValue, PacketBody, PaxosPacket, RequestPacket};
    use crate::recovery::{IdlePaxosState, RecoveryInfo, SlotBallotState};
    use crate::util::lock;
    use crate::{Ballot, GroupId, NodeId, Slot, Version};

    #[derive(Default)]
    struct Counter {
        counts: Mutex<HashMap<GroupId, u64>>,
    }

    impl Replicable for Counter {
        fn execute(&self, group: &GroupId, _request: &RequestPacket, _recovery: bool) -> bool {
            *self.counts.lock().unwrap().entry(group.clone()).or_default() += 1;
            true
        }

        fn checkpoint(&self, group: &GroupId) -> Option<Vec<u8>> {
            let counts = self.counts.lock().unwrap();
            counts.get(group).map(|c| c.to_be_bytes().to_vec())
        }

        fn restore(&self, group: &GroupId, state: Option<&[u8]>) -> bool {
            let count = state
                .and_then(|s| s.try_into().ok())
                .map(u64::from_be_bytes)
                .unwrap_or_default();
            self.counts.lock().unwrap().insert(group.clone(), count);
            true
        }
    }

    /// Records frames instead of sending them.
    #[derive(Default)]
    struct Outbox {
        frames: Mutex<Vec<(NodeId, PaxosPacket)>>,
        batches: Mutex<Vec<(NodeId, Vec<PaxosPacket>)>>,
    }

    impl Outbox {
        fn clear(&self) {
            self.frames.lock().unwrap().clear();
            self.batches.lock().unwrap().clear();
        }

        fn prepare_replies(&self) -> usize {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, p)| matches!(p.body, PacketBody::PrepareReply { .. }))
                .count()
        }
    }

    impl Transport for Outbox {
        fn send(&self, to: NodeId, frame: &[u8]) -> SendOutcome {
            let packets = decode_frame(frame).unwrap();
            self.frames
                .lock()
                .unwrap()
                .extend(packets.iter().cloned().map(|p| (to, p)));
            self.batches.lock().unwrap().push((to, packets));
            SendOutcome::Sent(frame.len())
        }
    }

    /// A [`MemoryLogger`] whose appends fail on demand.
    #[derive(Default)]
    struct FlakyLogger {
        log: MemoryLogger,
        failing: AtomicBool,
    }

    impl PaxosLogger for FlakyLogger {
        fn append(&self, packet: &PaxosPacket) -> Result<(), LogError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LogError::IoError(IoError::new(
                    "disk full",
                    std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
                )));
            }
            self.log.append(packet)
        }

        fn read_checkpoint(&self, group: &GroupId) -> Result<Option<SlotBallotState>, LogError> {
            self.log.read_checkpoint(group)
        }

        fn read_since(&self, group: &GroupId, slot: Slot) -> Result<Vec<PaxosPacket>, LogError> {
            self.log.read_since(group, slot)
        }

        fn logged_decisions(
            &self,
            group: &GroupId,
            from: Slot,
            to: Slot,
        ) -> Result<Vec<PValue>, LogError> {
            self.log.logged_decisions(group, from, to)
        }

        fn logged_accepts(&self, group: &GroupId, from: Slot) -> Result<Vec<PValue>, LogError> {
            self.log.logged_accepts(group, from)
        }

        fn put_checkpoint(
            &self,
            group: &GroupId,
            checkpoint: SlotBallotState,
        ) -> Result<(), LogError> {
            self.log.put_checkpoint(group, checkpoint)
        }

        fn garbage_collect(&self, group: &GroupId, below: Slot) -> Result<(), LogError> {
            self.log.garbage_collect(group, below)
        }

        fn put_recovery_info(&self, info: RecoveryInfo) -> Result<(), LogError> {
            self.log.put_recovery_info(info)
        }

        fn recovery_info(&self, group: &GroupId) -> Result<Option<RecoveryInfo>, LogError> {
            self.log.recovery_info(group)
        }

        fn recovery_infos(&self) -> Result<Vec<RecoveryInfo>, LogError> {
            self.log.recovery_infos()
        }

        fn remove(&self, group: &GroupId) -> Result<(), LogError> {
            self.log.remove(group)
        }

        fn put_final_state(
            &self,
            group: &GroupId,
            version: Version,
            state: SlotBallotState,
        ) -> Result<(), LogError> {
            self.log.put_final_state(group, version, state)
        }

        fn final_state(
            &self,
            group: &GroupId,
            version: Version,
        ) -> Result<Option<SlotBallotState>, LogError> {
            self.log.final_state(group, version)
        }

        fn delete_final_state(&self, group: &GroupId, version: Version) -> Result<(), LogError> {
            self.log.delete_final_state(group, version)
        }

        fn pause(&self, state: IdlePaxosState) -> Result<(), LogError> {
            self.log.pause(state)
        }

        fn unpause(&self, group: &GroupId) -> Result<Option<IdlePaxosState>, LogError> {
            self.log.unpause(group)
        }
    }

    fn manager(id: NodeId) -> (PaxosManager, EventStream, Arc<Outbox>) {
        manager_with(id, PaxosConfig::default(), Arc::new(MemoryLogger::new()))
    }

    fn manager_with(
        id: NodeId,
        config: PaxosConfig,
        logger: Arc<dyn PaxosLogger>,
    ) -> (PaxosManager, EventStream, Arc<Outbox>) {
        let outbox = Arc::new(Outbox::default());
        let (manager, events) = crate::manager_builder()
            .for_node(id)
            .logging_to(logger)
            .communicating_via(Arc::clone(&outbox) as Arc<dyn Transport>)
            .executing(Arc::new(Counter::default()))
            .with_config(config)
            .spawning_on(Arc::new(crate::executor::Inline))
            .without_maintenance()
            .build()
            .unwrap();

        (manager, events, outbox)
    }

    fn accept(slot: Slot, ballot: Ballot) -> PaxosPacket {
        PaxosPacket::new(
            "g",
            0,
            PacketBody::Accept {
                from: ballot.coordinator,
                pvalue: PValue {
                    slot,
                    ballot,
                    request: RequestPacket::new(slot, format!("v{}", slot)),
                },
                majority_frontier: 0,
                all_frontier: 0,
            },
        )
    }

    #[test]
    fn test_single_member_group_executes_synchronously() {
        let (manager, mut events, _) = manager(1);
        let group = "example.com".to_string();

        manager.create_group(group.clone(), 0, vec![1], None).unwrap();
        futures::executor::block_on(manager.propose(&group, RequestPacket::new(1, "a"))).unwrap();

        assert_eq!(manager.next_slot(&group), Some(1));
        assert!(manager.is_coordinator(&group));

        let events = events.drain();
        assert!(matches!(events[0], Event::Created { .. }));
        assert!(events.iter().any(|e| matches!(e, Event::Elected { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Executed { slot: 0, request, .. } if request.value == "a")));
    }

    #[test]
    fn test_create_group_checks_membership_and_version() {
        let (manager, _events, _) = manager(1);
        let group = "g".to_string();

        assert!(matches!(
            manager.create_group(group.clone(), 0, vec![], None),
            Err(CreateGroupError::NoMembers)
        ));
        assert!(matches!(
            manager.create_group(group.clone(), 0, vec![2, 3], None),
            Err(CreateGroupError::NotMember(1))
        ));

        manager.create_group(group.clone(), 1, vec![1], None).unwrap();
        assert!(matches!(
            manager.create_group(group.clone(), 1, vec![1], None),
            Err(CreateGroupError::Exists { version: 1, .. })
        ));

        manager.create_group(group.clone(), 2, vec![1], None).unwrap();
        assert_eq!(manager.version_of(&group), Some(2));
    }

    #[test]
    fn test_deleted_group_rejects_requests() {
        let (manager, _events, _) = manager(1);
        let group = "g".to_string();

        manager.create_group(group.clone(), 0, vec![1], None).unwrap();
        assert!(manager.delete_group(&group));
        assert!(!manager.delete_group(&group));

        let result = futures::executor::block_on(manager.propose(&group, RequestPacket::new(1, "x")));
        assert!(matches!(result, Err(ProposeError::UnknownGroup(_))));
    }

    #[test]
    fn test_unknown_group_is_asked_about() {
        let (manager, _events, outbox) = manager(1);

        let prepare = PaxosPacket::new(
            "elsewhere",
            3,
            PacketBody::Prepare {
                ballot: crate::Ballot::new(1, 2),
            },
        );
        manager.handle_incoming(&prepare.to_bytes().unwrap());

        let frames = outbox.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 2);
        assert_eq!(
            frames[0].1.body,
            PacketBody::FindReplicaGroup {
                from: 1,
                members: None
            }
        );
    }

    #[test]
    fn test_group_is_created_from_find_reply() {
        let (manager, _events, _) = manager(1);
        let group = "found".to_string();

        let reply = PaxosPacket::new(
            group.clone(),
            2,
            PacketBody::FindReplicaGroup {
                from: 2,
                members: Some(vec![1, 2, 3]),
            },
        );
        manager.handle_incoming(&reply.to_bytes().unwrap());

        assert_eq!(manager.version_of(&group), Some(2));
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let (manager, _events, outbox) = manager(1);

        manager.handle_incoming(b"not json");

        assert!(outbox.frames.lock().unwrap().is_empty());
        assert!(manager.groups().is_empty());
    }

    #[test]
    fn test_relayed_decision_is_no_sign_of_life_from_coordinator() {
        let config = PaxosConfig::default().with_time_unit(Duration::from_millis(5));
        let (manager, _events, _) = manager_with(3, config, Arc::new(MemoryLogger::new()));
        let group = "g".to_string();

        manager.create_group(group, 0, vec![1, 2, 3], None).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!manager.inner.detector.is_node_up(1));

        // decided by node 1, relayed by node 2
        let decision = PaxosPacket::new(
            "g",
            0,
            PacketBody::Decision {
                from: 2,
                pvalue: PValue {
                    slot: 0,
                    ballot: Ballot::new(1, 1),
                    request: RequestPacket::new(1, "a"),
                },
            },
        );
        manager.handle_incoming(&decision.to_bytes().unwrap());

        assert!(manager.inner.detector.is_node_up(2));
        assert!(!manager.inner.detector.is_node_up(1));
    }

    #[test]
    fn test_deleted_groups_are_forgotten_after_morgue_delay() {
        let config = PaxosConfig {
            morgue_delay: Duration::ZERO,
            ..PaxosConfig::default()
        };
        let (manager, _events, _) = manager_with(1, config, Arc::new(MemoryLogger::new()));

        for i in 0..50 {
            let group = format!("g{}", i);
            manager.create_group(group.clone(), 0, vec![1, 100 + i], None).unwrap();
            assert!(manager.delete_group(&group));
        }

        assert!(manager.inner.detector.ping_targets().is_empty());
        assert_eq!(manager.inner.messenger.tracked_groups(), 50);

        manager.inner.maintain();

        assert_eq!(manager.inner.messenger.tracked_groups(), 0);
        assert!(lock(&manager.inner.morgue).is_empty());
    }

    #[test]
    fn test_ping_targets_follow_live_groups() {
        let (manager, _events, _) = manager(1);

        manager.create_group("a".to_string(), 0, vec![1, 2, 3], None).unwrap();
        manager.create_group("b".to_string(), 0, vec![1, 3, 4], None).unwrap();
        assert_eq!(manager.inner.detector.ping_targets(), vec![2, 3, 4]);

        manager.delete_group(&"a".to_string());
        assert_eq!(manager.inner.detector.ping_targets(), vec![3, 4]);

        // replacing a group does not count its members twice
        manager.create_group("b".to_string(), 1, vec![1, 4], None).unwrap();
        assert_eq!(manager.inner.detector.ping_targets(), vec![4]);
    }

    #[test]
    fn test_nothing_is_sent_on_unlogged_promise() {
        let logger = Arc::new(FlakyLogger::default());
        let (manager, _events, outbox) = manager_with(
            3,
            PaxosConfig::default(),
            Arc::clone(&logger) as Arc<dyn PaxosLogger>,
        );
        let prepare = |number| {
            PaxosPacket::new(
                "g",
                0,
                PacketBody::Prepare {
                    ballot: Ballot::new(number, 2),
                },
            )
        };

        manager.create_group("g".to_string(), 0, vec![1, 2, 3], None).unwrap();
        outbox.clear();

        logger.failing.store(true, Ordering::SeqCst);
        manager.handle_incoming(&prepare(5).to_bytes().unwrap());
        assert_eq!(outbox.prepare_replies(), 0);

        logger.failing.store(false, Ordering::SeqCst);
        manager.handle_incoming(&prepare(6).to_bytes().unwrap());
        assert_eq!(outbox.prepare_replies(), 1);
    }

    #[test]
    fn test_replies_to_a_batch_share_one_frame() {
        let (manager, _events, outbox) = manager(3);

        manager.create_group("g".to_string(), 0, vec![1, 2, 3], None).unwrap();
        outbox.clear();

        let ballot = Ballot::new(5, 2);
        let frame = encode_frame(&[accept(0, ballot), accept(1, ballot)]).unwrap();
        manager.handle_incoming(&frame);

        let batches = outbox.batches.lock().unwrap();
        let replies = batches
            .iter()
            .filter(|(_, packets)| {
                packets
                    .iter()
                    .any(|p| matches!(p.body, PacketBody::AcceptReply { .. }))
            })
            .collect::<Vec<_>>();

        assert_eq!(replies.len(), 1);
        let (to, packets) = replies[0];
        assert_eq!(*to, 2);
        let slots = packets
            .iter()
            .filter_map(|p| match p.body {
                PacketBody::AcceptReply { slot, .. } => Some(slot),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(slots, vec![0, 1]);
    }
}
