//! The agent loop, the heart of turnloop.
//!
//! The loop follows a **stream → act → observe** cycle:
//!
//! 1. **Validate** the session and tool definitions
//! 2. **Stream** one assistant turn from the configured provider
//! 3. **Record** the assembled message, complete or partial
//! 4. **If tool calls**: execute them, append results, loop back to step 2
//! 5. **Otherwise**: return the stop reason to the caller
//!
//! Cancellation is observed while streaming and while tools run.

pub mod loop_runner;

pub use loop_runner::{AgentLoop, DEFAULT_MAX_TURNS, LoopOptions, LoopOutcome, validate_tools};
