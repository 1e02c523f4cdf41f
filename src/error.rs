//! 错误类型

use crate::db::models::RunState;
use thiserror::Error;

/// 目录存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid value {value:?} in column {column}")]
    InvalidValue { column: &'static str, value: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: i64 },
}

/// 调用顺序错误，属于编程错误，不可恢复
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("run must be RUNNING, found {0}")]
    RunNotRunning(RunState),

    #[error("run has no identity, persist it before starting the engine")]
    RunNotPersisted,

    #[error("engine already has a run in progress")]
    RunInProgress,

    #[error("commit requires a completed classification")]
    NotClassified,

    #[error("engine is sealed, the run was already committed")]
    AlreadyCommitted,

    #[error("transfer set is only readable after commit")]
    NotCommitted,

    #[error("no run to roll back")]
    NothingToRollback,
}

/// 引擎错误
#[derive(Error, Debug)]
pub enum EngineError {
    /// 协作式取消，不是失败，保证未发生提交
    #[error("operation cancelled")]
    Cancelled,

    #[error("precondition violated: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("catalog store failure: {0}")]
    Store(#[from] StoreError),

    #[error("filesystem probe failure: {0}")]
    Probe(#[from] std::io::Error),

    /// 内部一致性被破坏，属于引擎缺陷
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, EngineError>;
