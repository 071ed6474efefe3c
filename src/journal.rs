//! A [`PaxosLogger`] backed by an append-only journal in a working directory.
//!
//! Every mutation is appended as one frame,
//!
//! ```text
//! | RECORD: u32 | length: u32 | bincode(Record) |
//! ```
//!
//! following a four byte file header. On open the journal is replayed into the
//! same in-memory index the [`MemoryLogger`][crate::logger::MemoryLogger]
//! uses. A torn frame at the tail, as left behind by a crash mid-write, is cut
//! off. Garbage collection eventually rewrites the journal from the records
//! that are still live.

use std::convert::TryInto;
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::{BuildError, CodecError, IoError, LogError};
use crate::logger::{LogIndex, PaxosLogger, Record};
use crate::packet::{PValue, PaxosPacket};
use crate::recovery::{IdlePaxosState, RecoveryInfo, SlotBallotState};
use crate::util::lock;
use crate::{GroupId, Slot, Version};

const MAGIC_BYTES: u32 = 0x7270_786a;
const RECORD: u32 = 0x5245_4344;

const INDICATOR_FILE: &str = ".replipaxos";
const JOURNAL_FILE: &str = "journal.log";
const COMPACTING_FILE: &str = "journal.log.compacting";

/// Number of records appended since the last compaction after which garbage
/// collection triggers another one.
const COMPACTION_THRESHOLD: usize = 4096;

pub struct JournalLogger {
    path: path::PathBuf,
    journal: Mutex<Journal>,
}

struct Journal {
    path: path::PathBuf,
    file: fs::File,
    index: LogIndex,
    appended: usize,
}

impl JournalLogger {
    /// Opens the journal in `working_dir`, replaying whatever it holds.
    ///
    /// The directory must either be empty or have been initialized as a
    /// working directory before.
    pub fn open(working_dir: impl AsRef<path::Path>) -> Result<Self, BuildError> {
        let working_dir = working_dir.as_ref();
        let path = fs::canonicalize(working_dir)
            .map_err(|e| IoError::new(format!("Failed to canonicalize `{:?}`.", working_dir), e))?;

        if !path.is_dir() {
            return Err(BuildError::InvalidWorkingDir(path, "not a directory".into()));
        }

        let indicator_file = path.join(INDICATOR_FILE);

        if !indicator_file.is_file() {
            if read_dir(&path)?.next().is_some() {
                return Err(BuildError::InvalidWorkingDir(
                    path,
                    "no indicator file and not empty".into(),
                ));
            }

            fs::File::create(&indicator_file).map_err(|e| {
                IoError::new(format!("Failed to create `{:?}`.", indicator_file), e)
            })?;
        }

        let journal = Journal::open(path.join(JOURNAL_FILE))?;

        Ok(Self {
            path,
            journal: Mutex::new(journal),
        })
    }

    pub fn working_dir(&self) -> &path::Path {
        &self.path
    }

    /// Rewrites the journal so that it only holds live records.
    pub fn compact(&self) -> Result<(), LogError> {
        lock(&self.journal).compact(&self.path)
    }

    fn write(&self, record: Record) -> Result<(), LogError> {
        lock(&self.journal).write(record)
    }
}

impl Journal {
    fn open(path: path::PathBuf) -> Result<Self, LogError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(to_failed_to_open(&path))?;

        let len = file
            .metadata()
            .map_err(|e| IoError::new(format!("Failed to stat `{}`.", path.display()), e))?
            .len();

        let mut index = LogIndex::default();

        if len == 0 {
            write_u32_to(&path, &mut file, MAGIC_BYTES)?;
            sync(&path, &file)?;
        } else {
            let (records, valid_len) = replay(&path, &mut index, &file)?;

            if valid_len < len {
                warn!(
                    "Cutting off `{}` bytes of torn frame at the end of `{}`.",
                    len - valid_len,
                    path.display()
                );

                file.set_len(valid_len).map_err(|e| {
                    IoError::new(format!("Failed to truncate `{}`.", path.display()), e)
                })?;
            }

            debug!("Replayed `{}` records from `{}`.", records, path.display());
        }

        Ok(Self {
            path,
            file,
            index,
            appended: 0,
        })
    }

    fn write(&mut self, record: Record) -> Result<(), LogError> {
        // promises must hit the disk before they are acted upon
        let durable = matches!(record, Record::Message(_) | Record::FinalState(..));

        append_to(&self.path, &mut self.file, &record)?;

        if durable {
            sync(&self.path, &self.file)?;
        }

        self.index.apply(record);
        self.appended += 1;

        Ok(())
    }

    fn compact(&mut self, dir: &path::Path) -> Result<(), LogError> {
        let compacting = dir.join(COMPACTING_FILE);
        let records = self.index.live_records();

        {
            let mut file = fs::File::create(&compacting).map_err(to_failed_to_open(&compacting))?;

            write_u32_to(&compacting, &mut file, MAGIC_BYTES)?;
            for record in &records {
                append_to(&compacting, &mut file, record)?;
            }
            sync(&compacting, &file)?;
        }

        fs::rename(&compacting, &self.path).map_err(|e| {
            IoError::new(
                format!(
                    "Failed to move `{}` to `{}`.",
                    compacting.display(),
                    self.path.display()
                ),
                e,
            )
        })?;

        self.file = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(to_failed_to_open(&self.path))?;
        self.appended = 0;

        info!(
            "Compacted `{}` down to `{}` records.",
            self.path.display(),
            records.len()
        );

        Ok(())
    }
}

impl PaxosLogger for JournalLogger {
    fn append(&self, packet: &PaxosPacket) -> Result<(), LogError> {
        self.write(Record::Message(packet.clone()))
    }

    fn read_checkpoint(&self, group: &GroupId) -> Result<Option<SlotBallotState>, LogError> {
        Ok(lock(&self.journal).index.checkpoint(group))
    }

    fn read_since(&self, group: &GroupId, slot: Slot) -> Result<Vec<PaxosPacket>, LogError> {
        Ok(lock(&self.journal).index.read_since(group, slot))
    }

    fn logged_decisions(
        &self,
        group: &GroupId,
        from: Slot,
        to: Slot,
    ) -> Result<Vec<PValue>, LogError> {
        Ok(lock(&self.journal).index.decisions(group, from, to))
    }

    fn logged_accepts(&self, group: &GroupId, from: Slot) -> Result<Vec<PValue>, LogError> {
        Ok(lock(&self.journal).index.accepts(group, from))
    }

    fn put_checkpoint(&self, group: &GroupId, checkpoint: SlotBallotState) -> Result<(), LogError> {
        self.write(Record::Checkpoint(group.clone(), checkpoint))
    }

    fn garbage_collect(&self, group: &GroupId, below: Slot) -> Result<(), LogError> {
        let mut journal = lock(&self.journal);

        journal.write(Record::GarbageCollect(group.clone(), below))?;

        if journal.appended >= COMPACTION_THRESHOLD {
            journal.compact(&self.path)?;
        }

        Ok(())
    }

    fn put_recovery_info(&self, info: RecoveryInfo) -> Result<(), LogError> {
        self.write(Record::Recovery(info))
    }

    fn recovery_info(&self, group: &GroupId) -> Result<Option<RecoveryInfo>, LogError> {
        Ok(lock(&self.journal).index.recovery_info(group))
    }

    fn recovery_infos(&self) -> Result<Vec<RecoveryInfo>, LogError> {
        Ok(lock(&self.journal).index.recovery_infos())
    }

    fn remove(&self, group: &GroupId) -> Result<(), LogError> {
        self.write(Record::Remove(group.clone()))
    }

    fn put_final_state(
        &self,
        group: &GroupId,
        version: Version,
        state: SlotBallotState,
    ) -> Result<(), LogError> {
        self.write(Record::FinalState(group.clone(), version, state))
    }

    fn final_state(
        &self,
        group: &GroupId,
        version: Version,
    ) -> Result<Option<SlotBallotState>, LogError> {
        Ok(lock(&self.journal).index.final_state(group, version))
    }

    fn delete_final_state(&self, group: &GroupId, version: Version) -> Result<(), LogError> {
        self.write(Record::DeleteFinalState(group.clone(), version))
    }

    fn pause(&self, state: IdlePaxosState) -> Result<(), LogError> {
        self.write(Record::Pause(state))
    }

    fn unpause(&self, group: &GroupId) -> Result<Option<IdlePaxosState>, LogError> {
        let mut journal = lock(&self.journal);
        let paused = journal.index.paused(group);

        if paused.is_some() {
            journal.write(Record::Unpause(group.clone()))?;
        }

        Ok(paused)
    }
}

/// Replays the journal at `path` into `index`.
///
/// Returns the number of records replayed and the length of the intact prefix.
fn replay(
    path: &path::Path,
    index: &mut LogIndex,
    file: &fs::File,
) -> Result<(usize, u64), LogError> {
    let mut reader = BufReader::new(file);

    let bytes = try_read_u32_from(path, &mut reader)?;
    if bytes != Some(MAGIC_BYTES) {
        return Err(IoError::invalid_data(
            format!("invalid journal `{}`", path.display()),
            format!("expected `0x{:08x?}`, got `0x{:08x?}`.", MAGIC_BYTES, bytes),
        )
        .into());
    }

    let mut offset = 4;
    let mut records = 0;

    loop {
        match try_read_u32_from(path, &mut reader)? {
            Some(RECORD) => {
                let size = match try_read_u32_from(path, &mut reader)? {
                    Some(size) => size as usize,
                    None => break,
                };

                let mut buf = vec![0; size];
                if try_read_exact_from(path, &mut reader, &mut buf)? < size {
                    break;
                }

                let record: Record = bincode::deserialize(&buf).map_err(CodecError::from)?;
                index.apply(record);

                records += 1;
                offset += 8 + size as u64;
            }
            Some(unexpected) => {
                return Err(IoError::invalid_data(
                    format!("Journal `{}` was corrupted.", path.display()),
                    format!("Read unexpected value `{}` at offset `{}`.", unexpected, offset),
                )
                .into());
            }
            None => break,
        }
    }

    Ok((records, offset))
}

fn append_to(path: &path::Path, file: &mut fs::File, record: &Record) -> Result<(), LogError> {
    let serialized = bincode::serialize(record).map_err(CodecError::from)?;
    let size: u32 = serialized.len().try_into().map_err(|_| {
        IoError::invalid_data(
            format!("Failed to write to journal `{}`.", path.display()),
            format!("Unsupported size of `{}`.", serialized.len()),
        )
    })?;

    let mut frame = Vec::with_capacity(8 + serialized.len());
    frame.extend_from_slice(&RECORD.to_be_bytes());
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&serialized);

    // a single write keeps frames of concurrent appenders apart
    write_all_to(path, file, &frame)?;

    Ok(())
}

fn read_dir(dir: &path::Path) -> Result<fs::ReadDir, IoError> {
    dir.read_dir()
        .map_err(|e| IoError::new(format!("Failed to read directory `{:?}`.", dir), e))
}

fn to_failed_to_open(path: &path::Path) -> impl FnOnce(std::io::Error) -> IoError + '_ {
    move |e| IoError::new(format!("Failed to open `{}`.", path.display()), e)
}

fn sync(path: &path::Path, file: &fs::File) -> Result<(), IoError> {
    file.sync_data()
        .map_err(|e| IoError::new(format!("Failed to sync `{}`.", path.display()), e))
}

fn write_u32_to(path: &path::Path, writer: &mut impl Write, v: u32) -> Result<(), IoError> {
    write_all_to(path, writer, &v.to_be_bytes())
}

fn write_all_to(path: &path::Path, writer: &mut impl Write, buf: &[u8]) -> Result<(), IoError> {
    writer
        .write_all(buf)
        .and_then(|_| writer.flush())
        .map_err(|e| IoError::new(format!("Failed to write to `{}`.", path.display()), e))
}

fn try_read_u32_from(path: &path::Path, reader: &mut impl Read) -> Result<Option<u32>, IoError> {
    let mut buf = [0; 4];

    if try_read_exact_from(path, reader, &mut buf)? == buf.len() {
        Ok(Some(u32::from_be_bytes(buf)))
    } else {
        Ok(None)
    }
}

fn try_read_exact_from(
    path: &path::Path,
    reader: &mut impl Read,
    buf: &mut [u8],
) -> Result<usize, IoError> {
    let mut read = 0;

    while read < buf.len() {
        match reader
            .read(&mut buf[read..])
            .map_err(|e| IoError::new(format!("Failed to read from `{}`.", path.display()), e))?
        {
            0 => break,
            n => read += n,
        }
    }

    Ok(read)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;

    use super::{JournalLogger, JOURNAL_FILE};
    use crate::ballot::Ballot;
    use crate::error::BuildError;
    use crate::logger::PaxosLogger;
    use crate::packet::{PValue, PacketBody, PaxosPacket, RequestPacket};
    use crate::recovery::{IdlePaxosState, RecoveryInfo, SlotBallotState};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("replipaxos-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn decision(slot: u64) -> PaxosPacket {
        PaxosPacket::new(
            "g",
            0,
            PacketBody::Decision {
                from: 1,
                pvalue: PValue {
                    slot,
                    ballot: Ballot::new(1, 1),
                    request: RequestPacket::new(slot, format!("v{}", slot)),
                },
            },
        )
    }

    fn info() -> RecoveryInfo {
        RecoveryInfo {
            group: "g".to_string(),
            version: 2,
            members: vec![1, 2, 3],
            state: Some(b"init".to_vec()),
        }
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = temp_dir();

        {
            let logger = JournalLogger::open(&dir).unwrap();
            logger.put_recovery_info(info()).unwrap();
            for slot in 1..=5 {
                logger.append(&decision(slot)).unwrap();
            }
            logger
                .put_checkpoint(
                    &"g".to_string(),
                    SlotBallotState {
                        slot: 3,
                        ballot: Ballot::new(1, 1),
                        state: Some(b"abc".to_vec()),
                    },
                )
                .unwrap();
        }

        let logger = JournalLogger::open(&dir).unwrap();

        assert_eq!(logger.recovery_infos().unwrap(), vec![info()]);
        assert_eq!(
            logger.read_checkpoint(&"g".to_string()).unwrap().unwrap().slot,
            3
        );
        assert_eq!(
            logger.read_since(&"g".to_string(), 4).unwrap(),
            vec![decision(4), decision(5)]
        );

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_rejects_foreign_directory() {
        let dir = temp_dir();
        fs::write(dir.join("unrelated.txt"), b"hello").unwrap();

        let result = JournalLogger::open(&dir);

        assert!(matches!(result, Err(BuildError::InvalidWorkingDir(_, _))));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_torn_tail_is_cut_off() {
        let dir = temp_dir();

        {
            let logger = JournalLogger::open(&dir).unwrap();
            logger.append(&decision(1)).unwrap();
            logger.append(&decision(2)).unwrap();
        }

        {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(dir.join(JOURNAL_FILE))
                .unwrap();
            // frame header announcing more bytes than follow
            file.write_all(&super::RECORD.to_be_bytes()).unwrap();
            file.write_all(&100u32.to_be_bytes()).unwrap();
            file.write_all(b"torn").unwrap();
        }

        {
            let logger = JournalLogger::open(&dir).unwrap();
            assert_eq!(logger.logged_decisions(&"g".to_string(), 0, 10).unwrap().len(), 2);
            logger.append(&decision(3)).unwrap();
        }

        let logger = JournalLogger::open(&dir).unwrap();
        assert_eq!(logger.logged_decisions(&"g".to_string(), 0, 10).unwrap().len(), 3);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_compaction_keeps_live_records() {
        let dir = temp_dir();
        let group = "g".to_string();

        {
            let logger = JournalLogger::open(&dir).unwrap();
            logger.put_recovery_info(info()).unwrap();
            for slot in 1..=20 {
                logger.append(&decision(slot)).unwrap();
            }
            logger.garbage_collect(&group, 15).unwrap();
            logger
                .pause(IdlePaxosState {
                    group: group.clone(),
                    version: 2,
                    members: vec![1, 2, 3],
                    slot: 21,
                    ballot: Ballot::new(1, 1),
                    gc_slot: 15,
                    coordinator: None,
                })
                .unwrap();

            let before = fs::metadata(dir.join(JOURNAL_FILE)).unwrap().len();
            logger.compact().unwrap();
            let after = fs::metadata(dir.join(JOURNAL_FILE)).unwrap().len();
            assert!(after < before);
        }

        let logger = JournalLogger::open(&dir).unwrap();

        let slots: Vec<_> = logger
            .logged_decisions(&group, 0, 100)
            .unwrap()
            .into_iter()
            .map(|p| p.slot)
            .collect();
        assert_eq!(slots, (15..=20).collect::<Vec<_>>());
        assert_eq!(logger.unpause(&group).unwrap().unwrap().slot, 21);
        assert_eq!(logger.unpause(&group).unwrap(), None);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_final_state_survives_removal_and_compaction() {
        let dir = temp_dir();
        let group = "g".to_string();
        let final_state = SlotBallotState {
            slot: 5,
            ballot: Ballot::new(1, 1),
            state: Some(b"done".to_vec()),
        };

        {
            let logger = JournalLogger::open(&dir).unwrap();
            logger.put_recovery_info(info()).unwrap();
            logger.append(&decision(5)).unwrap();
            logger.put_final_state(&group, 2, final_state.clone()).unwrap();
            logger.remove(&group).unwrap();
            logger.compact().unwrap();
        }

        let logger = JournalLogger::open(&dir).unwrap();

        assert!(logger.recovery_infos().unwrap().is_empty());
        assert_eq!(logger.final_state(&group, 2).unwrap(), Some(final_state));

        logger.delete_final_state(&group, 2).unwrap();
        drop(logger);

        let logger = JournalLogger::open(&dir).unwrap();
        assert_eq!(logger.final_state(&group, 2).unwrap(), None);

        fs::remove_dir_all(dir).unwrap();
    }
}
