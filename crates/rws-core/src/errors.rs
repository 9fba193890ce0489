//! Error codes and error types.
//!
//! The wire contract only says *whether* a call failed (`exception`), but the
//! variants are kept distinct so logs and metrics can tell configuration
//! mistakes apart from failures raised by the target operation itself.

// ── Error code constants ────────────────────────────────────────────

/// Object name not registered.
pub const UNKNOWN_OBJECT: &str = "UNKNOWN_OBJECT";
/// Operation not exposed by the object.
pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
/// Event not exposed by the object.
pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
/// Action not part of the event.
pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
/// Operation name is overloaded on the target type.
pub const OVERLOADED_OPERATION: &str = "OVERLOADED_OPERATION";
/// Arguments do not fit the operation.
pub const INVALID_ARGUMENTS: &str = "INVALID_ARGUMENTS";
/// Handler id already in use on the session.
pub const DUPLICATE_HANDLER: &str = "DUPLICATE_HANDLER";
/// Malformed inbound envelope.
pub const INVALID_ENVELOPE: &str = "INVALID_ENVELOPE";
/// Value could not be converted to or from the wire format.
pub const CONVERSION_ERROR: &str = "CONVERSION_ERROR";
/// Target instance could not be created.
pub const INSTANTIATION_ERROR: &str = "INSTANTIATION_ERROR";
/// The target operation itself failed.
pub const INVOCATION_ERROR: &str = "INVOCATION_ERROR";
/// Sending on the transport failed.
pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
/// The owning context is gone.
pub const CONTEXT_CLOSED: &str = "CONTEXT_CLOSED";

/// Failure of the underlying connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// Any other I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Error reported by a [`CapabilityResolver`](crate::capability::CapabilityResolver).
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// Operation, event or action does not exist on the target.
    #[error("{0} not found")]
    NotFound(String),
    /// An argument could not be used by the operation.
    #[error("bad argument: {0}")]
    BadArgument(String),
    /// The instance handed to the resolver is not of its type.
    #[error("instance is not a {0}")]
    WrongInstance(String),
    /// The resolver cannot construct instances.
    #[error("cannot instantiate {0}")]
    NotInstantiable(String),
    /// The operation ran and failed.
    #[error("{0}")]
    Failed(String),
    /// A core operation failed; the error is surfaced unchanged.
    #[error(transparent)]
    Rws(#[from] Box<RwsError>),
}

impl From<RwsError> for CapabilityError {
    fn from(err: RwsError) -> Self {
        Self::Rws(Box::new(err))
    }
}

/// Error type for every core operation.
#[derive(Debug, thiserror::Error)]
pub enum RwsError {
    /// No object registered under this name.
    #[error("Unknown object '{name}'")]
    UnknownObject {
        /// Requested object name.
        name: String,
    },

    /// The object does not expose this operation.
    #[error("Method '{method}' does not exist for object '{object}'")]
    UnknownMethod {
        /// Object name.
        object: String,
        /// Requested operation.
        method: String,
    },

    /// The object does not expose this event.
    #[error("Event '{event}' does not exist for object '{object}'")]
    UnknownEvent {
        /// Object name.
        object: String,
        /// Requested event.
        event: String,
    },

    /// The event does not have this action.
    #[error("Action '{action}' does not exist for event '{event}' on object '{object}'")]
    UnknownAction {
        /// Object name.
        object: String,
        /// Event name.
        event: String,
        /// Requested action.
        action: String,
    },

    /// More than one operation shares this name.
    #[error("Method '{method}' on object '{object}' is overloaded, which is not supported")]
    OverloadedOperation {
        /// Object name.
        object: String,
        /// Overloaded operation.
        method: String,
    },

    /// Arguments do not match the operation.
    #[error("{message}")]
    InvalidArguments {
        /// What is wrong.
        message: String,
    },

    /// A subscription with this handler id exists already.
    #[error("An event handler with the id '{handler_id}' already exists")]
    DuplicateHandler {
        /// The clashing handler id.
        handler_id: String,
    },

    /// The inbound envelope is malformed.
    #[error("Invalid envelope: {message}")]
    InvalidEnvelope {
        /// What is wrong.
        message: String,
    },

    /// A value could not be converted.
    #[error("Could not convert value: {message}")]
    Conversion {
        /// What is wrong.
        message: String,
    },

    /// The instance for an object could not be created.
    #[error("Could not create instance for object '{object}': {message}")]
    Instantiation {
        /// Object name.
        object: String,
        /// Cause.
        message: String,
    },

    /// The target operation raised an error.
    #[error("Call to '{method}' on object '{object}' failed: {message}")]
    Invocation {
        /// Object name.
        object: String,
        /// Operation name.
        method: String,
        /// Cause as reported by the operation.
        message: String,
    },

    /// Sending to a session failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session outlived the context that owned it.
    #[error("Session context is closed")]
    ContextClosed,
}

impl RwsError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownObject { .. } => UNKNOWN_OBJECT,
            Self::UnknownMethod { .. } => UNKNOWN_METHOD,
            Self::UnknownEvent { .. } => UNKNOWN_EVENT,
            Self::UnknownAction { .. } => UNKNOWN_ACTION,
            Self::OverloadedOperation { .. } => OVERLOADED_OPERATION,
            Self::InvalidArguments { .. } => INVALID_ARGUMENTS,
            Self::DuplicateHandler { .. } => DUPLICATE_HANDLER,
            Self::InvalidEnvelope { .. } => INVALID_ENVELOPE,
            Self::Conversion { .. } => CONVERSION_ERROR,
            Self::Instantiation { .. } => INSTANTIATION_ERROR,
            Self::Invocation { .. } => INVOCATION_ERROR,
            Self::Transport(_) => TRANSPORT_ERROR,
            Self::ContextClosed => CONTEXT_CLOSED,
        }
    }

    /// Whether the target operation itself failed (as opposed to dispatch).
    pub fn is_invocation(&self) -> bool {
        matches!(self, Self::Invocation { .. })
    }

    /// Whether this is a transport failure, which is fatal to the session.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub(crate) fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, RwsError>;

/// Error returned by lifecycle, multicast and event listeners.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by lifecycle, multicast and event listeners.
pub type ListenerResult = std::result::Result<(), ListenerError>;
