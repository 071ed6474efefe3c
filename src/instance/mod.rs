//! The per-group state machine, [`PaxosInstance`].
//!
//! Instances do no I/O of their own beyond reading from the log and writing
//! checkpoints. Everything they want sent or logged is returned as [`Task`]s,
//! which the manager carries out once it released the instance's lock.
//! Messages addressed to all members include the local node; those copies are
//! fed back into the instance by the manager.

mod acceptor;
mod coordinator;

use std::collections::BTreeMap;

use instant::Instant;
use tracing::{debug, info, trace, warn};

use crate::app::Replicable;
use crate::ballot::Ballot;
use crate::config::PaxosConfig;
use crate::error::{LogError, ProposeError};
use crate::event::Event;
use crate::failure_detection::FailureDetector;
use crate::instrument::Instrumentation;
use crate::liveness::ActivePaxosState;
use crate::logger::PaxosLogger;
use crate::packet::{PValue, PacketBody, PaxosPacket, RequestPacket};
use crate::recovery::{IdlePaxosState, RecoveryInfo, SlotBallotState};
use crate::task::{LogMessagingTask, MessagingTask, Task};
use crate::{GroupId, NodeId, Slot, Version};

use acceptor::Acceptor;
use coordinator::Coordinator;

/// Node-wide collaborators an instance works with.
pub struct InstanceContext<'a> {
    pub me: NodeId,
    pub config: &'a PaxosConfig,
    pub logger: &'a dyn PaxosLogger,
    pub app: &'a dyn Replicable,
    pub detector: &'a FailureDetector,
    pub instrumentation: &'a Instrumentation,
}

/// What an instance wants done after handling something.
#[derive(Debug, Default)]
pub struct Outcome {
    pub tasks: Vec<Task>,
    pub events: Vec<Event>,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.events.is_empty()
    }
}

pub struct PaxosInstance {
    me: NodeId,
    group: GroupId,
    version: Version,
    members: Vec<NodeId>,
    acceptor: Acceptor,
    coordinator: Option<Coordinator>,
    liveness: ActivePaxosState,
    /// Set once the instance was paused. Packets reaching it through a stale
    /// handle are dropped.
    paused: bool,
    stopped: bool,
    outcome: Outcome,
}

fn initial_ballot(members: &[NodeId]) -> Ballot {
    Ballot::new(0, members.iter().copied().min().unwrap_or_default())
}

impl PaxosInstance {
    /// Creates the instance of a new group.
    ///
    /// The application is expected to hold the group's initial state already.
    pub fn new(
        ctx: &InstanceContext<'_>,
        group: GroupId,
        version: Version,
        members: Vec<NodeId>,
    ) -> Self {
        let acceptor = Acceptor::new(initial_ballot(&members), 0, 0);

        Self::assemble(ctx, group, version, members, acceptor)
    }

    fn assemble(
        ctx: &InstanceContext<'_>,
        group: GroupId,
        version: Version,
        members: Vec<NodeId>,
        acceptor: Acceptor,
    ) -> Self {
        let liveness = ActivePaxosState::new(
            group.clone(),
            ctx.config.idle_threshold,
            ctx.config.min_resync_delay,
        );

        Self {
            me: ctx.me,
            group,
            version,
            members,
            acceptor,
            coordinator: None,
            liveness,
            paused: false,
            stopped: false,
            outcome: Outcome::default(),
        }
    }

    /// Rebuilds a group from its latest checkpoint and the log records above
    /// it. Nothing is sent while doing so.
    pub fn recover(ctx: &InstanceContext<'_>, info: &RecoveryInfo) -> Result<Self, LogError> {
        let group = &info.group;
        let checkpoint = ctx.logger.read_checkpoint(group)?;

        let mut acceptor = Acceptor::new(initial_ballot(&info.members), 0, 0);
        let state = match &checkpoint {
            Some(checkpoint) => {
                acceptor.install(checkpoint.slot);
                acceptor.observe(checkpoint.ballot);
                checkpoint.state.as_deref()
            }
            None => info.state.as_deref(),
        };

        if !ctx.app.restore(group, state) {
            warn!(group = %group, "Application failed to restore state.");
        }

        let mut instance = Self::assemble(
            ctx,
            group.clone(),
            info.version,
            info.members.clone(),
            acceptor,
        );

        let mut replayed = 0;
        for packet in ctx.logger.read_since(group, instance.acceptor.slot())? {
            match packet.body {
                PacketBody::Prepare { ballot } => instance.acceptor.observe(ballot),
                PacketBody::Accept { pvalue, .. } => instance.acceptor.restore_accepted(pvalue),
                PacketBody::Decision { pvalue, .. } => {
                    instance.acceptor.commit(pvalue);
                }
                _ => continue,
            }
            replayed += 1;
        }

        instance.execute(ctx, true);

        info!(
            group = %group,
            slot = instance.acceptor.slot(),
            ballot = %instance.acceptor.ballot(),
            replayed,
            "Recovered group."
        );

        let slot = instance.acceptor.slot();
        instance.emit(Event::Recovered {
            group: group.clone(),
            slot,
        });

        Ok(instance)
    }

    /// Reloads a paused group.
    ///
    /// Unlike [recovery](Self::recover), the application state is assumed to
    /// be intact.
    pub fn from_idle(ctx: &InstanceContext<'_>, idle: IdlePaxosState) -> Result<Self, LogError> {
        let mut acceptor = Acceptor::new(idle.ballot, idle.slot, idle.gc_slot);

        for pvalue in ctx.logger.logged_accepts(&idle.group, idle.slot)? {
            acceptor.restore_accepted(pvalue);
        }
        for pvalue in ctx.logger.logged_decisions(&idle.group, idle.slot, Slot::MAX)? {
            acceptor.commit(pvalue);
        }

        let mut instance = Self::assemble(ctx, idle.group, idle.version, idle.members, acceptor);

        if let Some((ballot, next_slot)) = idle.coordinator {
            if ballot == instance.acceptor.ballot() {
                instance.coordinator =
                    Some(Coordinator::active(ballot, &instance.members, next_slot));
            }
        }

        debug!(group = %instance.group, slot = instance.acceptor.slot(), "Unpaused group.");

        let group = instance.group.clone();
        instance.emit(Event::Unpaused { group });
        instance.execute(ctx, false);

        Ok(instance)
    }

    /// Pauses the instance, returning what is needed to reload it.
    pub fn to_idle(&mut self) -> IdlePaxosState {
        self.paused = true;

        IdlePaxosState {
            group: self.group.clone(),
            version: self.version,
            members: self.members.clone(),
            slot: self.acceptor.slot(),
            ballot: self.acceptor.ballot(),
            gc_slot: self.acceptor.gc_slot(),
            coordinator: self
                .coordinator
                .as_ref()
                .filter(|c| c.is_active())
                .map(|c| (c.ballot(), c.next_slot())),
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// The next slot to execute.
    pub fn next_slot(&self) -> Slot {
        self.acceptor.slot()
    }

    /// The highest ballot promised.
    pub fn ballot(&self) -> Ballot {
        self.acceptor.ballot()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator.as_ref().map_or(false, Coordinator::is_active)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_long_idle(&self) -> bool {
        self.liveness.is_long_idle()
    }

    /// Whether nothing is in flight, i.e. whether the instance may be paused.
    pub fn is_quiescent(&self) -> bool {
        !self.acceptor.has_unexecuted()
            && self.coordinator.as_ref().map_or(true, Coordinator::is_quiescent)
    }

    /// Kicks off a freshly created instance.
    pub fn start(&mut self, ctx: &InstanceContext<'_>) -> Outcome {
        self.check_run_for_coordinator(ctx);
        self.take()
    }

    /// Submits a request to the group.
    pub fn propose(
        &mut self,
        ctx: &InstanceContext<'_>,
        request: RequestPacket,
    ) -> Result<Outcome, ProposeError> {
        if self.stopped {
            return Err(ProposeError::Stopped(self.group.clone()));
        }
        if self.paused {
            return Err(ProposeError::UnknownGroup(self.group.clone()));
        }

        self.liveness.touch();
        self.route_request(ctx, request)?;

        Ok(self.take())
    }

    pub fn handle_packet(&mut self, ctx: &InstanceContext<'_>, packet: PaxosPacket) -> Outcome {
        if self.paused || self.stopped {
            trace!(group = %self.group, "Dropping {} for inactive instance.", packet.type_name());
            return Outcome::default();
        }

        self.liveness.touch();

        match packet.body {
            PacketBody::Request(request) | PacketBody::Proposal(request) => {
                if let Err(err) = self.route_request(ctx, request) {
                    warn!(group = %self.group, %err, "Dropping request.");
                }
            }
            PacketBody::Prepare { ballot } => self.handle_prepare(ballot),
            PacketBody::PrepareReply {
                from,
                ballot,
                accepted,
                first_slot,
            } => self.handle_prepare_reply(from, ballot, accepted, first_slot),
            PacketBody::Accept {
                from,
                pvalue,
                majority_frontier,
                all_frontier,
            } => self.handle_accept(ctx, from, pvalue, majority_frontier, all_frontier),
            PacketBody::AcceptReply {
                from,
                ballot,
                slot,
                frontier,
            } => self.handle_accept_reply(ctx, from, ballot, slot, frontier),
            PacketBody::Decision { from, pvalue } => self.handle_decision(ctx, from, pvalue),
            PacketBody::SyncRequest {
                from,
                missing,
                far_behind,
            } => self.handle_sync_request(ctx, from, missing, far_behind),
            PacketBody::CheckpointState { from, checkpoint } => {
                self.handle_checkpoint(ctx, from, checkpoint)
            }
            PacketBody::FindReplicaGroup { .. } | PacketBody::FailureDetect { .. } => {}
        }

        if !self.stopped {
            self.check_run_for_coordinator(ctx);
        }

        self.take()
    }

    /// Periodic maintenance: elections, re-broadcasts and catch-up.
    pub fn tick(&mut self, ctx: &InstanceContext<'_>) -> Outcome {
        if self.paused || self.stopped {
            return Outcome::default();
        }

        self.check_run_for_coordinator(ctx);

        let mut retransmissions = Vec::new();

        if let Some(coordinator) = &mut self.coordinator {
            match coordinator.prepare_wait_time() {
                Some(waited) if waited > ctx.config.election_timeout => {
                    coordinator.note_prepare_retransmission();

                    let ballot = coordinator.ballot();
                    debug!(group = %self.group, %ballot, "Re-sending prepare.");

                    retransmissions.push(MessagingTask::multicast(
                        self.members.iter().copied(),
                        PaxosPacket::unstamped(PacketBody::Prepare { ballot }),
                    ));
                }
                Some(_) => {}
                None => {
                    let majority_frontier = coordinator.majority_frontier();
                    let all_frontier = coordinator.all_frontier();

                    for (pvalue, laggards) in
                        coordinator.stale_proposals(ctx.config.rebroadcast_timeout)
                    {
                        trace!(group = %self.group, slot = pvalue.slot, "Re-broadcasting accept.");

                        retransmissions.push(MessagingTask::multicast(
                            laggards,
                            PaxosPacket::unstamped(PacketBody::Accept {
                                from: self.me,
                                pvalue,
                                majority_frontier,
                                all_frontier,
                            }),
                        ));
                    }
                }
            }
        }

        for task in retransmissions {
            self.send(task);
        }

        self.execute(ctx, false);
        self.check_sync(ctx, None, true);

        self.take()
    }

    /// Takes whatever accumulated outside of packet handling, e.g. the events
    /// of a recovery.
    pub fn take(&mut self) -> Outcome {
        std::mem::take(&mut self.outcome)
    }

    fn send(&mut self, task: impl Into<Task>) {
        self.outcome.tasks.push(task.into());
    }

    fn emit(&mut self, event: Event) {
        self.outcome.events.push(event);
    }

    fn others(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .copied()
            .filter(|m| *m != self.me)
            .collect()
    }

    fn check_run_for_coordinator(&mut self, ctx: &InstanceContext<'_>) {
        let current = self.acceptor.ballot();

        if let Some(coordinator) = &self.coordinator {
            if coordinator.ballot() >= current {
                return;
            }
        }

        self.preempt(current);

        let leader = current.coordinator;
        let leader_down = !self.members.contains(&leader) || !ctx.detector.is_node_up(leader);

        let next_in_line = self
            .members
            .iter()
            .copied()
            .filter(|m| ctx.detector.is_node_up(*m))
            .min();

        let run = leader == self.me
            || (leader_down
                && (next_in_line == Some(self.me)
                    || ctx.detector.last_coordinator_long_dead(leader)));

        if run {
            self.run_for_coordinator(current.next_for(self.me));
        }
    }

    fn run_for_coordinator(&mut self, ballot: Ballot) {
        info!(group = %self.group, %ballot, "Running for coordinator.");

        self.coordinator = Some(Coordinator::preparing(
            ballot,
            &self.members,
            self.acceptor.slot(),
        ));

        self.send(MessagingTask::multicast(
            self.members.clone(),
            PaxosPacket::unstamped(PacketBody::Prepare { ballot }),
        ));
    }

    /// Resigns as coordinator if `ballot` is higher than the coordinator's.
    fn preempt(&mut self, ballot: Ballot) {
        let outranked = matches!(&self.coordinator, Some(c) if c.ballot() < ballot);
        if !outranked {
            return;
        }

        let requests = match self.coordinator.take() {
            Some(coordinator) => coordinator.resign(),
            None => return,
        };

        info!(group = %self.group, %ballot, handed_over = requests.len(), "Preempted.");

        self.emit(Event::Preempted {
            group: self.group.clone(),
            ballot,
        });

        if !requests.is_empty() && ballot.coordinator != self.me {
            let proposals = requests
                .into_iter()
                .map(|r| PaxosPacket::unstamped(PacketBody::Proposal(r)))
                .collect();
            self.send(MessagingTask::new([ballot.coordinator], proposals));
        }
    }

    fn route_request(
        &mut self,
        ctx: &InstanceContext<'_>,
        request: RequestPacket,
    ) -> Result<(), ProposeError> {
        self.check_run_for_coordinator(ctx);

        let current = self.acceptor.ballot();
        let coordinating = matches!(&self.coordinator, Some(c) if c.ballot() >= current);

        if coordinating {
            let proposed = match &mut self.coordinator {
                Some(c) => c.propose(&self.group, request, ctx.config.max_outstanding)?,
                None => None,
            };

            if let Some(pvalue) = proposed {
                self.send_accepts(vec![pvalue]);
            }
        } else if current.coordinator == self.me {
            debug!(group = %self.group, "No coordinator to take the request.");
        } else {
            trace!(group = %self.group, to = current.coordinator, "Forwarding request.");

            self.send(MessagingTask::unicast(
                current.coordinator,
                PaxosPacket::unstamped(PacketBody::Proposal(request)),
            ));
        }

        Ok(())
    }

    fn send_accepts(&mut self, proposed: Vec<PValue>) {
        let (majority_frontier, all_frontier) = match &self.coordinator {
            Some(c) => (c.majority_frontier(), c.all_frontier()),
            None => return,
        };

        if proposed.is_empty() {
            return;
        }

        let accepts = proposed
            .into_iter()
            .map(|pvalue| {
                PaxosPacket::unstamped(PacketBody::Accept {
                    from: self.me,
                    pvalue,
                    majority_frontier,
                    all_frontier,
                })
            })
            .collect();

        self.send(MessagingTask::new(self.members.clone(), accepts));
    }

    fn handle_prepare(&mut self, ballot: Ballot) {
        let adopted = self.acceptor.handle_prepare(ballot);

        if adopted {
            self.preempt(ballot);
        } else {
            trace!(group = %self.group, %ballot, current = %self.acceptor.ballot(), "Stale prepare.");
        }

        let (accepted, first_slot) = self.acceptor.promise();
        let reply = MessagingTask::unicast(
            ballot.coordinator,
            PaxosPacket::unstamped(PacketBody::PrepareReply {
                from: self.me,
                ballot: self.acceptor.ballot(),
                accepted,
                first_slot,
            }),
        );

        if adopted {
            let promise = PaxosPacket::unstamped(PacketBody::Prepare { ballot });
            self.send(LogMessagingTask::new(reply, promise));
        } else {
            self.send(reply);
        }
    }

    fn handle_prepare_reply(
        &mut self,
        from: NodeId,
        ballot: Ballot,
        accepted: Vec<PValue>,
        first_slot: Slot,
    ) {
        let own = match &self.coordinator {
            Some(c) => c.ballot(),
            None => return,
        };

        if ballot > own {
            self.acceptor.observe(ballot);
            self.preempt(ballot);
            return;
        }
        if ballot < own {
            trace!(group = %self.group, %ballot, "Stale promise.");
            return;
        }

        let proposed = match &mut self.coordinator {
            Some(c) => c.handle_promise(from, accepted, first_slot),
            None => None,
        };

        if let Some(proposed) = proposed {
            info!(group = %self.group, ballot = %own, carried = proposed.len(), "Elected coordinator.");

            self.emit(Event::Elected {
                group: self.group.clone(),
                ballot: own,
            });
            self.send_accepts(proposed);
        }
    }

    fn handle_accept(
        &mut self,
        ctx: &InstanceContext<'_>,
        from: NodeId,
        pvalue: PValue,
        majority_frontier: Slot,
        all_frontier: Slot,
    ) {
        let accepted = self.acceptor.handle_accept(&pvalue);

        if accepted {
            self.preempt(pvalue.ballot);
            self.acceptor.handle_frontiers(majority_frontier, all_frontier);
        } else {
            trace!(group = %self.group, ballot = %pvalue.ballot, slot = pvalue.slot, "Stale accept.");
        }

        let coordinator = pvalue.ballot.coordinator;
        let reply = MessagingTask::unicast(
            coordinator,
            PaxosPacket::unstamped(PacketBody::AcceptReply {
                from: self.me,
                ballot: self.acceptor.ballot(),
                slot: pvalue.slot,
                frontier: self.acceptor.slot(),
            }),
        );

        if accepted && pvalue.slot >= self.acceptor.slot() {
            let accept = PaxosPacket::unstamped(PacketBody::Accept {
                from,
                pvalue,
                majority_frontier,
                all_frontier,
            });
            self.send(LogMessagingTask::new(reply, accept));
        } else {
            self.send(reply);
        }

        // a majority moved on without this node hearing about it
        let slot = self.acceptor.slot();
        if majority_frontier > slot + ctx.config.sync_threshold && self.liveness.can_sync() {
            let limit = sync_limit(ctx.config);
            let missing: Vec<_> = (slot..majority_frontier)
                .filter(|s| !self.acceptor.is_committed(*s))
                .take(limit)
                .collect();
            let far_behind = majority_frontier - slot > ctx.config.max_sync_gap;

            self.request_sync(Some(from), missing, far_behind);
        }
    }

    fn handle_accept_reply(
        &mut self,
        ctx: &InstanceContext<'_>,
        from: NodeId,
        ballot: Ballot,
        slot: Slot,
        frontier: Slot,
    ) {
        let own = match &self.coordinator {
            Some(c) if c.is_active() => c.ballot(),
            _ => return,
        };

        if ballot > own {
            self.acceptor.observe(ballot);
            self.preempt(ballot);
            return;
        }
        if ballot < own {
            trace!(group = %self.group, %ballot, slot, "Stale accept reply.");
            return;
        }

        let decided = match &mut self.coordinator {
            Some(c) => c.handle_accepted(from, slot, frontier),
            None => None,
        };

        if let Some(pvalue) = decided {
            self.decide(ctx, pvalue);
        }
    }

    fn decide(&mut self, ctx: &InstanceContext<'_>, pvalue: PValue) {
        trace!(group = %self.group, slot = pvalue.slot, "Decided.");

        let decision = PaxosPacket::unstamped(PacketBody::Decision {
            from: self.me,
            pvalue: pvalue.clone(),
        });
        let others = self.others();

        if others.is_empty() {
            self.send(LogMessagingTask::log_only(decision));
        } else {
            let multicast = MessagingTask::multicast(others, decision.clone());
            self.send(LogMessagingTask::new(multicast, decision));
        }

        self.commit(ctx, pvalue);
    }

    fn handle_decision(&mut self, ctx: &InstanceContext<'_>, from: NodeId, pvalue: PValue) {
        if self.acceptor.is_committed(pvalue.slot) {
            trace!(group = %self.group, slot = pvalue.slot, "Duplicate decision.");
            return;
        }

        if pvalue.ballot > self.acceptor.ballot() {
            self.acceptor.observe(pvalue.ballot);
            self.preempt(pvalue.ballot);
        }

        self.send(LogMessagingTask::log_only(PaxosPacket::unstamped(
            PacketBody::Decision {
                from,
                pvalue: pvalue.clone(),
            },
        )));
        self.commit(ctx, pvalue);
        self.check_sync(ctx, Some(from), false);
    }

    fn commit(&mut self, ctx: &InstanceContext<'_>, pvalue: PValue) {
        let lost = self
            .coordinator
            .as_mut()
            .and_then(|c| c.handle_decided(&pvalue));

        self.acceptor.commit(pvalue);
        self.execute(ctx, false);

        if let Some(request) = lost {
            debug!(group = %self.group, id = request.id, "Proposing request again.");

            if let Err(err) = self.route_request(ctx, request) {
                warn!(group = %self.group, %err, "Dropping request.");
            }
        }
    }

    /// Executes committed slots in order, as far as possible.
    fn execute(&mut self, ctx: &InstanceContext<'_>, recovery: bool) {
        if self.stopped {
            return;
        }

        let interval = ctx.config.checkpoint_interval.max(1);

        while let Some(next) = self.acceptor.next_executable() {
            if !next.request.is_noop() {
                let start = Instant::now();

                if !ctx.app.execute(&self.group, &next.request, recovery) {
                    warn!(group = %self.group, slot = next.slot, "Execution failed, will retry.");
                    return;
                }

                ctx.instrumentation.update_delay("execute", start);
            }

            let executed = match self.acceptor.advance() {
                Some(executed) => executed,
                None => break,
            };

            let slot = executed.slot;
            let stop = executed.request.is_stop();

            self.emit(Event::Executed {
                group: self.group.clone(),
                slot,
                request: executed.request,
            });

            if stop || slot % interval == 0 {
                self.checkpoint(ctx, slot);
            }

            if stop {
                info!(group = %self.group, version = self.version, slot, "Group stopped.");

                self.stopped = true;
                self.emit(Event::Stopped {
                    group: self.group.clone(),
                    version: self.version,
                });
                break;
            }
        }
    }

    fn checkpoint(&mut self, ctx: &InstanceContext<'_>, slot: Slot) {
        let start = Instant::now();
        let checkpoint = SlotBallotState {
            slot,
            ballot: self.acceptor.ballot(),
            state: ctx.app.checkpoint(&self.group),
        };

        if let Err(err) = ctx.logger.put_checkpoint(&self.group, checkpoint) {
            warn!(group = %self.group, slot, ?err, "Failed to store checkpoint.");
            return;
        }

        ctx.instrumentation.update_delay("checkpoint", start);

        let below = (slot + 1).min(self.acceptor.all_frontier());
        if below > self.acceptor.gc_slot() {
            match ctx.logger.garbage_collect(&self.group, below) {
                Ok(()) => self.acceptor.garbage_collected(below),
                Err(err) => warn!(group = %self.group, below, ?err, "Failed to collect garbage."),
            }
        }

        debug!(group = %self.group, slot, gc_slot = self.acceptor.gc_slot(), "Checkpointed.");

        self.emit(Event::Checkpointed {
            group: self.group.clone(),
            slot,
        });
    }

    fn check_sync(&mut self, ctx: &InstanceContext<'_>, hint: Option<NodeId>, periodic: bool) {
        let max = match self.acceptor.max_committed() {
            Some(max) => max,
            None => return,
        };

        let gap = max.saturating_sub(self.acceptor.slot());
        let needed = if periodic {
            self.acceptor.next_executable().is_none()
        } else {
            gap > ctx.config.sync_threshold
        };

        if !needed || !self.liveness.can_sync() {
            return;
        }

        let missing = self.acceptor.missing(sync_limit(ctx.config));
        self.request_sync(hint, missing, gap > ctx.config.max_sync_gap);
    }

    fn request_sync(&mut self, hint: Option<NodeId>, missing: Vec<Slot>, far_behind: bool) {
        let recipients = match hint {
            Some(node) if node != self.me && self.members.contains(&node) => vec![node],
            _ => self.others(),
        };

        if recipients.is_empty() {
            return;
        }

        debug!(
            group = %self.group,
            slot = self.acceptor.slot(),
            missing = missing.len(),
            far_behind,
            "Requesting sync."
        );

        self.send(MessagingTask::multicast(
            recipients,
            PaxosPacket::unstamped(PacketBody::SyncRequest {
                from: self.me,
                missing,
                far_behind,
            }),
        ));
        self.liveness.just_synced();
    }

    fn handle_sync_request(
        &mut self,
        ctx: &InstanceContext<'_>,
        from: NodeId,
        missing: Vec<Slot>,
        far_behind: bool,
    ) {
        let gc_slot = self.acceptor.gc_slot();
        let slot = self.acceptor.slot();

        let mut messages = Vec::new();
        let mut decisions = BTreeMap::new();

        if far_behind || missing.iter().any(|s| *s < gc_slot) {
            match ctx.logger.read_checkpoint(&self.group) {
                Ok(Some(checkpoint)) => {
                    let after = checkpoint.slot + 1;

                    match ctx.logger.logged_decisions(&self.group, after, slot) {
                        Ok(logged) => decisions.extend(logged.into_iter().map(|p| (p.slot, p))),
                        Err(err) => warn!(group = %self.group, ?err, "Failed to read decisions."),
                    }

                    messages.push(PaxosPacket::unstamped(PacketBody::CheckpointState {
                        from: self.me,
                        checkpoint,
                    }));
                }
                Ok(None) => {}
                Err(err) => warn!(group = %self.group, ?err, "Failed to read checkpoint."),
            }
        }

        if let (Some(&first), Some(&last)) = (missing.iter().min(), missing.iter().max()) {
            match ctx.logger.logged_decisions(&self.group, first, last + 1) {
                Ok(logged) => decisions.extend(
                    logged
                        .into_iter()
                        .filter(|p| missing.contains(&p.slot))
                        .map(|p| (p.slot, p)),
                ),
                Err(err) => warn!(group = %self.group, ?err, "Failed to read decisions."),
            }

            for slot in &missing {
                if let Some(pvalue) = self.acceptor.committed(*slot) {
                    decisions.insert(*slot, pvalue.clone());
                }
            }
        }

        messages.extend(
            decisions
                .into_values()
                .map(|pvalue| {
                    PaxosPacket::unstamped(PacketBody::Decision {
                        from: self.me,
                        pvalue,
                    })
                }),
        );

        if messages.is_empty() {
            debug!(group = %self.group, from, "Nothing to sync.");
            return;
        }

        debug!(group = %self.group, to = from, count = messages.len(), "Serving sync.");

        self.send(MessagingTask::new([from], messages));
    }

    fn handle_checkpoint(
        &mut self,
        ctx: &InstanceContext<'_>,
        from: NodeId,
        checkpoint: SlotBallotState,
    ) {
        if checkpoint.slot < self.acceptor.slot() {
            trace!(group = %self.group, slot = checkpoint.slot, from, "Stale checkpoint.");
            return;
        }

        if !ctx.app.restore(&self.group, checkpoint.state.as_deref()) {
            warn!(group = %self.group, slot = checkpoint.slot, from, "Failed to install checkpoint.");
            return;
        }

        let slot = checkpoint.slot;
        self.acceptor.install(slot);

        if let Err(err) = ctx.logger.put_checkpoint(&self.group, checkpoint) {
            warn!(group = %self.group, slot, ?err, "Failed to store installed checkpoint.");
        }

        info!(group = %self.group, slot, from, "Installed checkpoint.");

        self.emit(Event::Installed {
            group: self.group.clone(),
            slot,
        });
        self.execute(ctx, false);
    }
}

fn sync_limit(config: &PaxosConfig) -> usize {
    usize::try_from(config.max_sync_gap)
        .unwrap_or(usize::MAX)
        .saturating_add(1)
}
