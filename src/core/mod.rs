pub mod cancel;
pub mod changeset;
pub mod engine;
pub mod operation;
pub mod scanner;
pub mod status;
pub mod transfer;

pub use cancel::CancelHandle;
pub use changeset::{Buckets, ChangeSet, ChangeSummary, ScanIssue};
pub use engine::ChangeSetEngine;
pub use operation::{reopen_run, BackupOperation, OperationConfig, OperationReport, TransferBackend};
pub use scanner::{PathSupplier, ScanConfig, SourceScanner};
pub use status::{classify, mtime_changed, RunKind};
pub use transfer::{TransferSet, VersionedFile};
