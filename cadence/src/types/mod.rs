pub mod config;
pub mod diagnostics;
pub mod enums;
pub mod record;
pub mod session;

// Re-export commonly used types for convenience
pub use config::{
    CadenceConfig, CycleConfig, DiagnosticsConfig, LeisureConfig, PomodoroConfig, SyncConfig,
};
pub use diagnostics::{DiagnosticEvent, DiagnosticsSettings};
pub use enums::{
    DiagnosticEventType, DiagnosticSource, DiagnosticVerbosity, KindGroup, MutationState,
    SessionKind, SessionStatus, SyncStatus,
};
pub use record::{CollectionRef, EntityRecord};
pub use session::{CycleProgress, Session, SessionView};
