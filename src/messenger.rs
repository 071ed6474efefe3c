//! Defines the [`Transport`] trait and the [`Messenger`] which sends
//! [`MessagingTask`]s through it.
//!
//! The messenger provides at-least-once, best-effort delivery. A transport that
//! accepts only part of a frame is congested, and the frame may or may not
//! arrive. Such frames are retransmitted in the background after a base delay
//! which doubles with every further partial send. A destination reported as
//! unreachable is given up on. Protocol-level re-broadcasts are what
//! ultimately guarantee progress.
//!
//! All messages of a task travel to each recipient in as few frames as
//! possible, at most [`BATCH_LIMIT`] packets per frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error, info, trace, warn};

use crate::executor::Executor;
use crate::packet::{self, PaxosPacket};
use crate::task::MessagingTask;
use crate::util::lock;
use crate::{GroupId, NodeId, Slot};

/// Result of a single best-effort send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The number of bytes the transport accepted.
    Sent(usize),
    Unreachable,
}

/// A connection-oriented, non-blocking transport.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: NodeId, frame: &[u8]) -> SendOutcome;
}

/// Sleeps for the given duration.
pub type Sleep = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// The default [`Sleep`], backed by `futures_timer`.
pub fn timer_sleep() -> Sleep {
    Arc::new(|delay| futures_timer::Delay::new(delay).boxed())
}

#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

struct Inner {
    me: NodeId,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    sleep: Sleep,
    base_delay: Duration,
    frontiers: Mutex<HashMap<GroupId, Slot>>,
}

/// Frames of a forgotten group are never retransmitted.
const FORGOTTEN: Slot = Slot::MAX;

/// Most packets sent in one frame.
pub const BATCH_LIMIT: usize = 64;

struct Frame {
    bytes: Arc<[u8]>,
    group: GroupId,
    /// Set if every packet belongs to an accept round, to the latest slot.
    accept_round: Option<Slot>,
    kind: &'static str,
    packets: usize,
}

impl Frame {
    fn encode(messages: &[PaxosPacket]) -> Result<Self, crate::error::CodecError> {
        let bytes = packet::encode_frame(messages)?;
        let accept_round = messages
            .iter()
            .map(PaxosPacket::accept_round_slot)
            .collect::<Option<Vec<_>>>()
            .and_then(|slots| slots.into_iter().max());

        Ok(Self {
            bytes: bytes.into(),
            group: messages
                .first()
                .map(|m| m.group.clone())
                .unwrap_or_default(),
            accept_round,
            kind: messages.first().map_or("nothing", PaxosPacket::type_name),
            packets: messages.len(),
        })
    }
}

impl Messenger {
    pub fn new(
        me: NodeId,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        base_delay: Duration,
    ) -> Self {
        Self::with_sleep(me, transport, executor, base_delay, timer_sleep())
    }

    pub fn with_sleep(
        me: NodeId,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        base_delay: Duration,
        sleep: Sleep,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                me,
                transport,
                executor,
                sleep,
                base_delay,
                frontiers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    /// Sends every message of `task` to every recipient.
    pub fn send(&self, task: &MessagingTask) {
        for chunk in task.messages().chunks(BATCH_LIMIT) {
            let frame = match Frame::encode(chunk) {
                Ok(frame) => Arc::new(frame),
                Err(err) => {
                    error!(
                        node = self.inner.me,
                        ?err,
                        "Failed to encode {}.",
                        chunk[0].type_name()
                    );
                    continue;
                }
            };

            for &to in task.recipients() {
                self.send_frame(to, Arc::clone(&frame));
            }
        }
    }

    fn send_frame(&self, to: NodeId, frame: Arc<Frame>) {
        match self.inner.transport.send(to, &frame.bytes) {
            SendOutcome::Sent(n) if n >= frame.bytes.len() => {
                trace!(node = self.inner.me, to, packets = frame.packets, "Sent {}.", frame.kind);
            }
            SendOutcome::Sent(_) => {
                info!(
                    node = self.inner.me,
                    to, "Congested sending {}, will retransmit.",
                    frame.kind
                );

                let inner = Arc::clone(&self.inner);
                let retransmission = async move { inner.retransmit(to, frame).await };

                if let Err(err) = self.inner.executor.execute(retransmission.boxed()) {
                    error!(node = self.inner.me, to, ?err, "Failed to schedule retransmission.");
                }
            }
            SendOutcome::Unreachable => {
                error!(
                    node = self.inner.me,
                    to,
                    "Failed to send {} to unreachable node.",
                    frame.kind
                );
            }
        }
    }

    /// Every slot of `group` below `frontier` was executed locally.
    ///
    /// Pending retransmissions of accepts and accept replies for those slots
    /// are abandoned.
    pub fn supersede(&self, group: &str, frontier: Slot) {
        let mut frontiers = lock(&self.inner.frontiers);

        match frontiers.get_mut(group) {
            Some(f) => {
                if *f != FORGOTTEN && *f < frontier {
                    *f = frontier;
                }
            }
            None => {
                frontiers.insert(group.to_string(), frontier);
            }
        }
    }

    /// Abandons all pending retransmissions for `group`.
    pub fn forget(&self, group: &str) {
        lock(&self.inner.frontiers).insert(group.to_string(), FORGOTTEN);
    }

    /// Stops tracking `group`, e.g. once it was paused or recreated.
    pub fn reset(&self, group: &str) {
        lock(&self.inner.frontiers).remove(group);
    }

    #[cfg(test)]
    pub(crate) fn tracked_groups(&self) -> usize {
        lock(&self.inner.frontiers).len()
    }
}

impl Inner {
    /// Delays between retransmissions: the base delay, doubling each time.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    async fn retransmit(self: Arc<Self>, to: NodeId, frame: Arc<Frame>) {
        let mut backoff = self.backoff();

        while let Some(delay) = backoff.next_backoff() {
            (self.sleep)(delay).await;

            if self.is_superseded(&frame) {
                debug!(node = self.me, to, group = %frame.group, "Retransmission is moot.");
                return;
            }

            match self.transport.send(to, &frame.bytes) {
                SendOutcome::Sent(n) if n >= frame.bytes.len() => return,
                SendOutcome::Sent(_) => {
                    warn!(
                        node = self.me,
                        to,
                        ?delay,
                        "Backing off under severe congestion."
                    );
                }
                SendOutcome::Unreachable => {
                    error!(
                        node = self.me,
                        to,
                        group = %frame.group,
                        "Dropping message, destination is unreachable."
                    );
                    return;
                }
            }
        }
    }

    fn is_superseded(&self, frame: &Frame) -> bool {
        match lock(&self.frontiers).get(&frame.group) {
            Some(&FORGOTTEN) => true,
            Some(&frontier) => frame.accept_round.map_or(false, |slot| slot < frontier),
            None => false,
        }
    }
}
