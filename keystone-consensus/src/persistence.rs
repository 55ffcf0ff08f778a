//! Shutdown snapshots
//!
//! Two files in the configured directory: `pbft_ppcm.dat` holds the quorum
//! records followed by `current_view`, `pbft_checkpoints.dat` holds the
//! checkpoint records. Each is a `uvarint(count)`-prefixed record sequence
//! in the canonical encoding. Files are read at startup and deleted right
//! after a successful read, so a crash mid-run starts clean.

use crate::checkpoint::CheckpointState;
use crate::error::PersistenceError;
use crate::quorum::PpcmState;
use keystone_core::{read_uvarint, write_uvarint, CanonicalDecode, CanonicalEncode, CodecError};
use keystone_core::ViewNum;
use std::fs;
use std::path::Path;

pub const PPCM_DB_FILENAME: &str = "pbft_ppcm.dat";
pub const CHECKPOINTS_DB_FILENAME: &str = "pbft_checkpoints.dat";

/// Write the quorum records and the current view.
pub fn store_quorum(
    dir: &Path,
    records: &[PpcmState],
    current_view: ViewNum,
) -> Result<(), PersistenceError> {
    fs::create_dir_all(dir)?;
    let mut out = Vec::new();
    write_uvarint(records.len() as u64, &mut out);
    for record in records {
        record.encode(&mut out);
    }
    current_view.encode(&mut out);
    fs::write(dir.join(PPCM_DB_FILENAME), out)?;
    Ok(())
}

/// Read the quorum snapshot, deleting the file on success. `None` when no
/// snapshot exists.
pub fn load_quorum(dir: &Path) -> Result<Option<(Vec<PpcmState>, ViewNum)>, PersistenceError> {
    let path = dir.join(PPCM_DB_FILENAME);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read(&path)?;
    let mut input = content.as_slice();

    let count = read_uvarint(&mut input)?;
    let mut records = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        records.push(PpcmState::decode(&mut input)?);
    }
    let current_view = ViewNum::decode(&mut input)?;
    if !input.is_empty() {
        return Err(CodecError::TrailingBytes(input.len()).into());
    }

    fs::remove_file(&path)?;
    Ok(Some((records, current_view)))
}

/// Write the checkpoint records.
pub fn store_checkpoints(dir: &Path, records: &[CheckpointState]) -> Result<(), PersistenceError> {
    fs::create_dir_all(dir)?;
    let mut out = Vec::new();
    write_uvarint(records.len() as u64, &mut out);
    for record in records {
        record.encode(&mut out);
    }
    fs::write(dir.join(CHECKPOINTS_DB_FILENAME), out)?;
    Ok(())
}

/// Read the checkpoint snapshot, deleting the file on success.
pub fn load_checkpoints(dir: &Path) -> Result<Option<Vec<CheckpointState>>, PersistenceError> {
    let path = dir.join(CHECKPOINTS_DB_FILENAME);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read(&path)?;
    let mut input = content.as_slice();

    let count = read_uvarint(&mut input)?;
    let mut records = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        records.push(CheckpointState::decode(&mut input)?);
    }
    if !input.is_empty() {
        return Err(CodecError::TrailingBytes(input.len()).into());
    }

    fs::remove_file(&path)?;
    Ok(Some(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Checkpoint, Commit, Prepare};
    use keystone_core::{BlockId, ChainId, KeyPair};

    fn block(num: u32) -> BlockId {
        let mut raw = [0x42u8; 32];
        raw[..4].copy_from_slice(&num.to_be_bytes());
        BlockId(raw)
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("keystone-persistence-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn sample_records() -> Vec<PpcmState> {
        let kp = KeyPair::from_seed(&[5; 32]);
        let cid = ChainId([1; 32]);
        (1..=3u32)
            .map(|n| PpcmState {
                block_id: block(n),
                block_num: n,
                prepares: vec![Prepare::signed(0, block(n), &cid, &kp)],
                should_prepared: n == 1,
                commits: vec![Commit::signed(0, block(n), &cid, &kp)],
                should_committed: false,
            })
            .collect()
    }

    #[test]
    fn quorum_snapshot_round_trip_deletes_file() {
        let dir = temp_dir("quorum");
        let records = sample_records();
        store_quorum(&dir, &records, 9).unwrap();

        let (loaded, view) = load_quorum(&dir).unwrap().unwrap();
        assert_eq!(loaded, records);
        assert_eq!(view, 9);

        // consumed on read
        assert!(load_quorum(&dir).unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn checkpoint_snapshot_round_trip() {
        let dir = temp_dir("checkpoints");
        let kp = KeyPair::from_seed(&[6; 32]);
        let cid = ChainId([1; 32]);
        let records = vec![CheckpointState {
            block_id: block(7),
            block_num: 7,
            checkpoints: vec![Checkpoint::signed(block(7), &cid, &kp)],
            is_stable: true,
        }];
        store_checkpoints(&dir, &records).unwrap();
        assert_eq!(load_checkpoints(&dir).unwrap().unwrap(), records);
        assert!(load_checkpoints(&dir).unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_snapshot_is_an_error_not_a_panic() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PPCM_DB_FILENAME), [0xff, 0xff, 0xff]).unwrap();
        assert!(load_quorum(&dir).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_loads_empty() {
        let dir = temp_dir("missing");
        assert!(load_quorum(&dir).unwrap().is_none());
        assert!(load_checkpoints(&dir).unwrap().is_none());
    }
}
