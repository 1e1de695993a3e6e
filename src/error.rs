/// The six error kinds from the serving error taxonomy.
///
/// `Success` is never constructed as an error; it exists so `ErrorCode` can
/// round-trip through the wire `ErrorMsg.code` field, where `0` means "no
/// error" and is used internally when merging per-instance errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    InvalidInputs = 1,
    Failed = 2,
    SystemError = 3,
    WorkerUnavailable = 4,
    ServableUnavailable = 5,
}

impl ErrorCode {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => ErrorCode::Success,
            1 => ErrorCode::InvalidInputs,
            2 => ErrorCode::Failed,
            3 => ErrorCode::SystemError,
            4 => ErrorCode::WorkerUnavailable,
            5 => ErrorCode::ServableUnavailable,
            _ => ErrorCode::SystemError,
        }
    }
}

/// Errors from shared-memory allocation/attach.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared memory prefix '{0}' has already been inited")]
    AlreadyInited(String),
    #[error("cannot find shared memory prefix '{0}'")]
    UnknownPrefix(String),
    #[error("invalid item size ({item_size}) or item count ({item_count}) for prefix '{prefix}'")]
    InvalidItemSizing {
        prefix: String,
        item_size: u64,
        item_count: u64,
    },
    #[error("shared memory segment '{0}' has already been released (double-free)")]
    DoubleFree(String),
    #[error("invalid attach range: offset {data_offset} + size {data_size} > bytes_size {bytes_size}")]
    InvalidAttachRange {
        bytes_size: u64,
        data_offset: u64,
        data_size: u64,
    },
    #[error("cannot find attached shared memory '{0}'")]
    NotAttached(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from tensor construction/mutation.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("unknown data type")]
    UnknownDataType,
    #[error("string/bytes tensor must have shape [] or [1], got {0:?}")]
    InvalidStringShape(Vec<i64>),
    #[error("buffer length {actual} does not match expected {expected} for shape {shape:?}")]
    SizeMismatch {
        expected: u64,
        actual: u64,
        shape: Vec<i64>,
    },
    #[error("negative dimension in shape {0:?}")]
    NegativeDim(Vec<i64>),
    #[error("more than one dimension is zero in shape {0:?}")]
    MultipleZeroDims(Vec<i64>),
    #[error("tensor is read-only")]
    ReadOnly,
    #[error("string/bytes tensor must carry exactly one bytes_val element, got {0}")]
    InvalidBytesValCount(usize),
}

/// Errors from servable registry declaration/validation.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("servable '{0}' is already declared with a different type")]
    TypeConflict(String),
    #[error("servable '{0}' is not declared")]
    UnknownServable(String),
    #[error("method '{method}' is not declared on servable '{servable}'")]
    UnknownMethod { servable: String, method: String },
    #[error("method '{method}' already registered on servable '{servable}'")]
    DuplicateMethod { servable: String, method: String },
    #[error("method '{method}' on servable '{servable}': source tag ({phase:?}, {index}) out of range (phase has {phase_size} outputs)")]
    DanglingSourceTag {
        servable: String,
        method: String,
        phase: crate::instance::Phase,
        index: usize,
        phase_size: usize,
    },
    #[error("method '{method}' on servable '{servable}': stage cannot cite its own phase ({phase:?}) as a source")]
    SelfCitingPhase {
        servable: String,
        method: String,
        phase: crate::instance::Phase,
    },
    #[error("servable '{servable}' input/output arity mismatch: previously declared ({prev_in}, {prev_out}), now ({new_in}, {new_out})")]
    ArityMismatch {
        servable: String,
        prev_in: usize,
        prev_out: usize,
        new_in: usize,
        new_out: usize,
    },
}

/// Errors from rank table parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum RankTableError {
    #[error("rank table JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rank size ({rank_size}) or stage size ({stage_size}) cannot be 0")]
    ZeroSize { rank_size: u32, stage_size: u32 },
    #[error("rank size {rank_size} is not a multiple of stage size {stage_size}")]
    NotMultiple { rank_size: u32, stage_size: u32 },
    #[error("rank table declares {declared} ranks but rank_size is {rank_size}")]
    CountMismatch { declared: usize, rank_size: u32 },
    #[error("device id repeatedly used by rank {rank_id} on ip {ip}")]
    DuplicateDeviceId { rank_id: u32, ip: String },
    #[error("rank size {rank_size} must be >= 8 when stage size {stage_size} > 1")]
    RankSizeTooSmall { rank_size: u32, stage_size: u32 },
    #[error("parallel count {parallel_count} must be a multiple of 8")]
    ParallelCountNotMultipleOf8 { parallel_count: u32 },
    #[error("rank {rank_id}: expected device_id {expected}, got {actual}")]
    WrongDeviceId {
        rank_id: u32,
        expected: u32,
        actual: u32,
    },
    #[error("rank {rank_id}: expected ip '{expected}' (matching rank {leader_rank}), got '{actual}'")]
    WrongIp {
        rank_id: u32,
        leader_rank: u32,
        expected: String,
        actual: String,
    },
}

/// Errors from the distributed servable coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("rank table error: {0}")]
    RankTable(#[from] RankTableError),
    #[error("agent registration incomplete: got {got}/{rank_size} agents after waiting {waited_secs}s")]
    RegistrationTimedOut {
        got: usize,
        rank_size: u32,
        waited_secs: u64,
    },
    #[error("rank {rank_id} registered out of range (rank_size {rank_size})")]
    RankOutOfRange { rank_id: u32, rank_size: u32 },
    #[error("rank {rank_id} registered twice")]
    DuplicateRank { rank_id: u32 },
    #[error("rank {rank_id} input_infos mismatch leader rank's input_infos")]
    InputInfosMismatch { rank_id: u32 },
    #[error("rank {rank_id} output_infos mismatch stage leader's output_infos")]
    OutputInfosMismatch { rank_id: u32 },
    #[error("rank {rank_id} batch_size {actual} does not match rank 0's batch_size {expected}")]
    BatchSizeMismatch {
        rank_id: u32,
        expected: u32,
        actual: u32,
    },
    #[error("rank {rank_id} timed out waiting for predict reply")]
    RankTimeout { rank_id: u32 },
    #[error("rank {rank_id} returned error {code:?}: {message}")]
    RankFailed {
        rank_id: u32,
        code: ErrorCode,
        message: String,
    },
    #[error("rpc to rank {rank_id} failed: {0}")]
    Rpc { rank_id: u32, source: String },
    #[error("shutdown signal raised during fan-out")]
    Shutdown,
}

/// Errors from the worker pipeline executor and its stages.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("pre-process '{0}' failed: {1}")]
    Preprocess(String, String),
    #[error("post-process '{0}' failed: {1}")]
    Postprocess(String, String),
    #[error("predict failed: {0}")]
    Predict(String),
    #[error("stage panicked: {0}")]
    Panicked(String),
    #[error("channel closed")]
    ChannelClosed,
}

/// Errors from master dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("servable '{servable}' method '{method}' is not registered at any worker")]
    UnknownMethod { servable: String, method: String },
    #[error("no worker registered for servable '{servable}' version {version}")]
    VersionNotFound { servable: String, version: u64 },
    #[error("servable '{0}' has no registered workers")]
    ServableUnavailable(String),
    #[error("rpc to worker '{address}' failed: {reason}")]
    WorkerRpcFailed { address: String, reason: String },
}

/// Top-level error, the union every component error funnels into. Carries
/// an [`ErrorCode`] so gRPC statuses and wire `ErrorMsg`s share one mapping.
#[derive(Debug, thiserror::Error)]
pub enum ServingError {
    #[error("invalid inputs: {0}")]
    InvalidInputs(String),
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    RankTable(#[from] RankTableError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("system error: {0}")]
    System(String),
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("servable unavailable: {0}")]
    ServableUnavailable(String),
    #[error("the serving process has stopped")]
    Shutdown,
}

impl ServingError {
    /// Map to the canonical error-kind taxonomy (§7), used for both the
    /// gRPC `Status` code and the wire `PredictReply` error list.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServingError::InvalidInputs(_) => ErrorCode::InvalidInputs,
            ServingError::Shm(ShmError::DoubleFree(_)) => ErrorCode::SystemError,
            ServingError::Shm(_) => ErrorCode::Failed,
            ServingError::Tensor(_) => ErrorCode::InvalidInputs,
            ServingError::Registry(_) => ErrorCode::InvalidInputs,
            ServingError::RankTable(_) => ErrorCode::InvalidInputs,
            ServingError::Coordinator(CoordinatorError::RankTable(_))
            | ServingError::Coordinator(CoordinatorError::RankOutOfRange { .. })
            | ServingError::Coordinator(CoordinatorError::DuplicateRank { .. })
            | ServingError::Coordinator(CoordinatorError::InputInfosMismatch { .. })
            | ServingError::Coordinator(CoordinatorError::OutputInfosMismatch { .. })
            | ServingError::Coordinator(CoordinatorError::BatchSizeMismatch { .. }) => {
                ErrorCode::InvalidInputs
            }
            ServingError::Coordinator(_) => ErrorCode::Failed,
            ServingError::Stage(_) => ErrorCode::Failed,
            ServingError::Dispatch(DispatchError::WorkerRpcFailed { .. }) => {
                ErrorCode::WorkerUnavailable
            }
            ServingError::Dispatch(DispatchError::ServableUnavailable(_)) => {
                ErrorCode::ServableUnavailable
            }
            ServingError::Dispatch(_) => ErrorCode::InvalidInputs,
            ServingError::System(_) => ErrorCode::SystemError,
            ServingError::WorkerUnavailable(_) => ErrorCode::WorkerUnavailable,
            ServingError::ServableUnavailable(_) => ErrorCode::ServableUnavailable,
            ServingError::Shutdown => ErrorCode::WorkerUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServingError>;
