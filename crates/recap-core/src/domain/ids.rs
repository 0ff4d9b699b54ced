//! Domain identifiers.
//!
//! # ULID ベースの JobId
//! - **時刻でソート可能**: 生成順序でソートできる
//! - **分散生成可能**: 複数ノード・複数プロセスで調整なしに生成できる
//! - **文字列表現**: `job-<ULID>` の形で表示・パースできる

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

const JOB_PREFIX: &str = "job-";

/// Identifier of a Job, assigned once at enqueue time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Ulid);

impl JobId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for JobId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{JOB_PREFIX}{}", self.0)
    }
}

/// Accepts both `job-<ULID>` and the bare ULID.
impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(JOB_PREFIX).unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}

/// Identity of one worker loop; used as the lease owner / fencing token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// `<pool>-<index>`
    pub fn for_pool(pool_name: &str, index: usize) -> Self {
        Self(format!("{pool_name}-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
