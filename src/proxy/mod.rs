//! Stateless request/response forwarders to third-party services.
//!
//! Both proxies are thin: they hold a reqwest client plus configuration
//! read from the environment, and surface upstream failures as typed
//! errors with human-readable messages. Neither keeps any state between
//! calls.

pub mod ai;
pub mod exec;

pub use ai::{AiError, AiResponder, HttpAiClient};
pub use exec::{ExecError, ExecOutcome, ExecProxy};
