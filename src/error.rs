use thiserror::Error;

use crate::{GroupId, NodeId, Version};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid working directory")]
    InvalidWorkingDir(std::path::PathBuf, #[source] BoxError),

    #[error("failed to set up the messenger pool")]
    Executor(#[source] std::io::Error),

    #[error("I/O error")]
    IoError(#[from] IoError),

    #[error("log error")]
    Log(#[from] LogError),

    #[error("failed to spawn maintenance")]
    Spawn(#[from] futures::task::SpawnError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct IoError(String, #[source] std::io::Error);

impl IoError {
    pub(crate) fn new(context: impl Into<String>, source: std::io::Error) -> Self {
        Self(context.into(), source)
    }

    pub(crate) fn invalid_data(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::new(
            context,
            std::io::Error::new(std::io::ErrorKind::InvalidData, source),
        )
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed packet")]
    Json(#[from] serde_json::Error),

    #[error("malformed log record")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error")]
    IoError(#[from] IoError),

    #[error("codec error")]
    Codec(#[from] CodecError),
}

/// A request could not be admitted.
#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("unknown group `{0}`")]
    UnknownGroup(GroupId),

    #[error("group `{0}` is stopped")]
    Stopped(GroupId),

    #[error("coordinator has {0} outstanding requests")]
    Overloaded(usize),

    #[error("paused group could not be restored")]
    Log(#[from] LogError),
}

#[derive(Debug, Error)]
pub enum CreateGroupError {
    #[error("group `{group}` already exists at version {version}")]
    Exists { group: GroupId, version: Version },

    #[error("node {0} is not a member")]
    NotMember(NodeId),

    #[error("group has no members")]
    NoMembers,

    #[error("log error")]
    Log(#[from] LogError),
}
