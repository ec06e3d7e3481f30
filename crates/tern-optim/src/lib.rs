//! # tern-optim
//!
//! Optimizers for tern. An optimizer is a set of capability hooks operating
//! generically over any trainable tensor: it declares how many bytes of
//! per-parameter state it needs, the training-memory planner reserves them,
//! and the engine hands the state region back on every update.
//!
//! Provided: [`Sgd`] (plain and momentum) and [`Adam`] (bias-corrected).

pub mod adam;
pub mod optimizer;
pub mod sgd;

pub use adam::Adam;
pub use optimizer::Optimizer;
pub use sgd::Sgd;
