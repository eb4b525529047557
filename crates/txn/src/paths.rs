//! Path builders for the transaction directory layout (§6.3):
//! `<trans_dir>/logs/<id>.log` and `<trans_dir>/data/<trans_id>-<md5(key)>.json`.
//!
//! §3.6 names the rollback log `<trans_dir>/logs/<id>.log` while §6.3
//! says `<trans_dir>/logs/<md5(path)>.log`; since a transaction's id is
//! already unique and the commit lock (`C|path`) guarantees at most one
//! commit per path runs at a time either way, this crate follows §3.6's
//! simpler, collision-free naming (recorded in DESIGN.md).

use kvlayer_core::md5_hex;
use std::path::{Path, PathBuf};

pub fn logs_dir(trans_dir: &Path) -> PathBuf {
    trans_dir.join("logs")
}

pub fn data_dir(trans_dir: &Path) -> PathBuf {
    trans_dir.join("data")
}

pub fn log_path(trans_dir: &Path, transaction_id: &str) -> PathBuf {
    logs_dir(trans_dir).join(format!("{transaction_id}.log"))
}

pub fn scratch_path(trans_dir: &Path, transaction_id: &str, key: &str) -> PathBuf {
    data_dir(trans_dir).join(format!("{transaction_id}-{}.json", md5_hex(key)))
}
