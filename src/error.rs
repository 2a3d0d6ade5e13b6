use thiserror::Error;

pub type VeldResult<T> = Result<T, VeldError>;

#[derive(Debug, Error)]
pub enum VeldError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    System(#[from] SystemError),
}

impl From<std::io::Error> for VeldError {
    fn from(err: std::io::Error) -> Self {
        VeldError::Io(IoError::Io(err))
    }
}

/// Errors raised while evaluating values, units, scopes, and handlers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Incompatible units: '{left}' vs '{right}'")]
    UnitMismatch { left: String, right: String },

    #[error("No conversion from '{from}' to '{to}'")]
    NoConversion { from: String, to: String },

    #[error("Invalid units expression: {0}")]
    InvalidUnits(String),

    #[error("Units may carry at most one denominator level: '{0}'")]
    DenominatorDepth(String),

    #[error("Attribute '{0}' has no value in this substep")]
    AttributeUnset(String),

    #[error("Cyclic dependency while resolving: {0}")]
    CyclicDependency(String),

    #[error("'{0}' is a reserved name and cannot be declared as an attribute")]
    ReservedName(String),

    #[error("Unknown entity type: '{0}'")]
    UnknownEntity(String),

    #[error("Name '{0}' is not visible in this scope")]
    UnknownName(String),

    #[error("Expected a {expected} value, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Arithmetic failure: {0}")]
    Arithmetic(String),

    #[error("Constant '{0}' is already defined and cannot be redefined")]
    ImmutableConstant(String),
}

/// Errors raised while building a program from the compiler's intermediate.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("Parse failure at line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("Entity type '{0}' is declared more than once")]
    DuplicateType(String),

    #[error("Simulation '{0}' is not defined in this program")]
    MissingSimulation(String),

    #[error("Invalid patch grid: {0}")]
    InvalidGrid(String),
}

/// Errors raised by the external geospatial data layer.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("External source not found: '{0}'")]
    SourceNotFound(String),

    #[error("Variable '{variable}' not present in source '{source_name}'")]
    VariableNotFound { source_name: String, variable: String },

    #[error("Grid coordinate out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Malformed data grid: {0}")]
    Grid(String),

    #[error("Failed to read point data: {0}")]
    Points(String),
}

/// Errors raised by the output pipeline.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Output path template references undefined variable '{0}'")]
    UnknownTemplateVar(String),

    #[error("Invalid output target: {0}")]
    InvalidTarget(String),

    #[error("Unsupported output protocol: '{0}'")]
    UnsupportedProtocol(String),

    #[error("Write issued without an entity kind in context")]
    KindNotSet,

    #[error("Output queue closed before write: {0}")]
    QueueClosed(String),

    #[error("Stream failure: {0}")]
    Stream(String),

    #[error("Writer used before start() or after join(): {0}")]
    Lifecycle(String),
}

/// Errors raised by the leader/worker wire protocol.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Unparseable wire line: '{0}'")]
    InvalidWire(String),

    #[error("Malformed datum payload: {0}")]
    InvalidDatum(String),
}

/// Errors raised while loading `.jshc` job configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed config at line {line}, column {column}: {message}")]
    Malformed {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("Config variable '{0}' is not defined")]
    UnknownVariable(String),
}

/// Errors related to File I/O, serialization, and object storage.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Failed to build object store: {0}")]
    ObjectStoreBuild(String),

    #[error("Object store operation failed: {0}")]
    ObjectStore(String),

    #[error("Failed to encode binary grid: {0}")]
    Encode(String),

    #[error("Failed to decode binary grid: {0}")]
    Decode(String),
}

/// Errors related to internal system invariants and lifecycle misuse.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Compatibility layer is already installed")]
    CompatInstalled,

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Worker join failure: {0}")]
    Join(String),
}
