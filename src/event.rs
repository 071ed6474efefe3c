use futures::channel::mpsc;
use futures::stream::{Stream, StreamExt};
use pin_project::pin_project;

use crate::ballot::Ballot;
use crate::packet::RequestPacket;
use crate::{GroupId, Slot, Version};

/// Emitted through the [`EventStream`] returned when building a manager.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Created {
        group: GroupId,
        version: Version,
    },

    /// The group was deleted or replaced by a newer version.
    Deleted {
        group: GroupId,
        version: Version,
    },

    /// This node completed phase 1 and coordinates the group.
    Elected {
        group: GroupId,
        ballot: Ballot,
    },

    /// This node stopped coordinating the group because it saw a higher ballot.
    Preempted {
        group: GroupId,
        ballot: Ballot,
    },

    /// A decided request was executed.
    ///
    /// No-ops are not executed, but their slots are reported nonetheless.
    Executed {
        group: GroupId,
        slot: Slot,
        request: RequestPacket,
    },

    Checkpointed {
        group: GroupId,
        slot: Slot,
    },

    /// A checkpoint received from a peer was installed.
    Installed {
        group: GroupId,
        slot: Slot,
    },

    /// The group was rebuilt from the durable log. `slot` is the next slot it
    /// will execute.
    Recovered {
        group: GroupId,
        slot: Slot,
    },

    Paused {
        group: GroupId,
    },

    Unpaused {
        group: GroupId,
    },

    /// A stop request was executed.
    Stopped {
        group: GroupId,
        version: Version,
    },
}

impl Event {
    pub fn group(&self) -> &GroupId {
        match self {
            Event::Created { group, .. }
            | Event::Deleted { group, .. }
            | Event::Elected { group, .. }
            | Event::Preempted { group, .. }
            | Event::Executed { group, .. }
            | Event::Checkpointed { group, .. }
            | Event::Installed { group, .. }
            | Event::Recovered { group, .. }
            | Event::Paused { group }
            | Event::Unpaused { group }
            | Event::Stopped { group, .. } => group,
        }
    }
}

#[pin_project]
pub struct EventStream {
    #[pin]
    delegate: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub(crate) fn new(delegate: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { delegate }
    }

    /// Returns all events that are ready without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();

        while let Ok(Some(event)) = self.delegate.try_next() {
            events.push(event);
        }

        events
    }

    /// Waits for the next event matching `predicate`, discarding others.
    pub async fn next_matching(&mut self, predicate: impl Fn(&Event) -> bool) -> Option<Event> {
        while let Some(event) = self.next().await {
            if predicate(&event) {
                return Some(event);
            }
        }

        None
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.project();

        this.delegate.poll_next(cx)
    }
}
