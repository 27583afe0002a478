//! Cooperative cancellation.
//!
//! Every task owns exactly one [`CancellationToken`]; it is shared by
//! reference with each stage the task runs and is never reused.

mod token;

pub use token::CancellationToken;
