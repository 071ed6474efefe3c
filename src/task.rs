//! Work orders instances hand to the manager.
//!
//! A [`MessagingTask`] says "send these messages to these recipients". The
//! same messages may be multicast to many recipients or many distinct messages
//! may be sent to one recipient; the two lists are independent. A
//! [`LogMessagingTask`] additionally carries one message which is appended to
//! the durable log before anything is transmitted.

use smallvec::SmallVec;

use crate::packet::PaxosPacket;
use crate::{NodeId, Version};

pub type Recipients = SmallVec<[NodeId; 8]>;

#[derive(Clone, Debug)]
pub struct MessagingTask {
    recipients: Recipients,
    messages: Vec<PaxosPacket>,
}

impl MessagingTask {
    /// # Panics
    ///
    /// Panics if `messages` is empty.
    pub fn new(recipients: impl IntoIterator<Item = NodeId>, messages: Vec<PaxosPacket>) -> Self {
        assert!(!messages.is_empty(), "messaging task without messages");

        Self {
            recipients: recipients.into_iter().collect(),
            messages,
        }
    }

    pub fn unicast(to: NodeId, message: PaxosPacket) -> Self {
        Self::new([to], vec![message])
    }

    pub fn multicast(recipients: impl IntoIterator<Item = NodeId>, message: PaxosPacket) -> Self {
        Self::new(recipients, vec![message])
    }

    fn nothing() -> Self {
        Self {
            recipients: Recipients::new(),
            messages: Vec::new(),
        }
    }

    pub fn recipients(&self) -> &[NodeId] {
        &self.recipients
    }

    pub fn messages(&self) -> &[PaxosPacket] {
        &self.messages
    }

    /// Stamps every message with the given group identity.
    pub fn stamp(&mut self, group: &str, version: Version) {
        for message in &mut self.messages {
            message.stamp(group, version);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() || self.recipients.is_empty()
    }

    fn group(&self) -> Option<&str> {
        self.messages.first().map(|m| m.group.as_str())
    }

    /// Merges tasks of the same group and with the same recipients, so that
    /// their messages travel in one frame per recipient.
    ///
    /// The order of messages within each resulting task is preserved.
    pub(crate) fn coalesce(tasks: Vec<MessagingTask>) -> Vec<MessagingTask> {
        let mut merged: Vec<MessagingTask> = Vec::with_capacity(tasks.len());

        for task in tasks {
            if task.is_empty() {
                continue;
            }

            let target = merged
                .iter_mut()
                .find(|m| m.recipients == task.recipients && m.group() == task.group());

            match target {
                Some(target) => target.messages.extend(task.messages),
                None => merged.push(task),
            }
        }

        merged
    }

    /// Splits off the copies addressed to `me`.
    pub(crate) fn split_local(self, me: NodeId) -> (Vec<PaxosPacket>, Option<MessagingTask>) {
        if !self.recipients.contains(&me) {
            return (Vec::new(), Some(self));
        }

        let remote: Recipients = self.recipients.iter().copied().filter(|r| *r != me).collect();

        if remote.is_empty() {
            (self.messages, None)
        } else {
            let local = self.messages.clone();
            (
                local,
                Some(Self {
                    recipients: remote,
                    messages: self.messages,
                }),
            )
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogMessagingTask {
    task: MessagingTask,
    log_msg: PaxosPacket,
}

impl LogMessagingTask {
    pub fn new(task: MessagingTask, log_msg: PaxosPacket) -> Self {
        Self { task, log_msg }
    }

    /// A task that only logs.
    pub fn log_only(log_msg: PaxosPacket) -> Self {
        Self {
            task: MessagingTask::nothing(),
            log_msg,
        }
    }

    pub fn task(&self) -> &MessagingTask {
        &self.task
    }

    pub fn log_msg(&self) -> &PaxosPacket {
        &self.log_msg
    }

    pub fn stamp(&mut self, group: &str, version: Version) {
        self.task.stamp(group, version);
        self.log_msg.stamp(group, version);
    }

    pub fn into_parts(self) -> (MessagingTask, PaxosPacket) {
        (self.task, self.log_msg)
    }
}

#[derive(Clone, Debug)]
pub enum Task {
    Message(MessagingTask),
    LogAndMessage(LogMessagingTask),
}

impl Task {
    pub fn stamp(&mut self, group: &str, version: Version) {
        match self {
            Task::Message(t) => t.stamp(group, version),
            Task::LogAndMessage(t) => t.stamp(group, version),
        }
    }

    /// A task is empty if it neither sends nor logs anything.
    pub fn is_empty(&self) -> bool {
        match self {
            Task::Message(t) => t.is_empty(),
            Task::LogAndMessage(_) => false,
        }
    }
}

impl From<MessagingTask> for Task {
    fn from(task: MessagingTask) -> Self {
        Task::Message(task)
    }
}

impl From<LogMessagingTask> for Task {
    fn from(task: LogMessagingTask) -> Self {
        Task::LogAndMessage(task)
    }
}

#[cfg(test)]
mod tests {
    use super::{LogMessagingTask, MessagingTask, Task};
    use crate::ballot::Ballot;
    use crate::packet::{PacketBody, PaxosPacket};

    fn prepare(number: u32) -> PaxosPacket {
        PaxosPacket::unstamped(PacketBody::Prepare {
            ballot: Ballot::new(number, 1),
        })
    }

    #[test]
    fn test_stamp_reaches_every_message() {
        let mut task = MessagingTask::new([1, 2, 3], vec![prepare(1), prepare(2), prepare(3)]);

        task.stamp("example.com", 4);

        assert!(task
            .messages()
            .iter()
            .all(|m| m.group == "example.com" && m.version == 4));
    }

    #[test]
    fn test_stamp_reaches_log_message() {
        let mut task: Task =
            LogMessagingTask::new(MessagingTask::unicast(2, prepare(1)), prepare(1)).into();

        task.stamp("g", 9);

        match task {
            Task::LogAndMessage(t) => {
                assert_eq!(t.log_msg().group, "g");
                assert_eq!(t.task().messages()[0].version, 9);
            }
            Task::Message(_) => unreachable!(),
        }
    }

    #[test]
    #[should_panic(expected = "messaging task without messages")]
    fn test_refuses_empty_task() {
        MessagingTask::new([1, 2], Vec::new());
    }

    #[test]
    fn test_log_only_is_not_empty() {
        let task: Task = LogMessagingTask::log_only(prepare(1)).into();

        assert!(!task.is_empty());
    }

    #[test]
    fn test_coalesce_merges_per_group_and_recipients() {
        let mut other = prepare(9);
        other.stamp("other", 0);

        let merged = MessagingTask::coalesce(vec![
            MessagingTask::unicast(2, prepare(1)),
            MessagingTask::multicast([2, 3], prepare(2)),
            MessagingTask::unicast(2, prepare(3)),
            MessagingTask::unicast(2, other),
        ]);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].recipients(), &[2]);
        assert_eq!(
            merged[0]
                .messages()
                .iter()
                .map(|m| m.ballot().unwrap().number)
                .collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(merged[1].recipients(), &[2, 3]);
        assert_eq!(merged[2].messages()[0].group, "other");
    }

    #[test]
    fn test_split_local() {
        let (local, remote) = MessagingTask::multicast([1, 2, 3], prepare(1)).split_local(2);

        assert_eq!(local.len(), 1);
        assert_eq!(remote.unwrap().recipients(), &[1, 3]);

        let (local, remote) = MessagingTask::unicast(2, prepare(1)).split_local(2);

        assert_eq!(local.len(), 1);
        assert!(remote.is_none());
    }
}
