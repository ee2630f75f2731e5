//! Control signals: the registry of known tokens, the matcher that finds them
//! in free-form model output, and the validator that checks configuration and
//! runtime emissions.

pub mod matcher;
pub mod registry;
pub mod validator;

pub use matcher::{match_signal, normalize_signal, MatchMethod};
pub use registry::SignalRegistry;
pub use validator::{SignalMatch, SignalValidator, ValidationReport};
