//! Lock-free building blocks used by the tile engine.
//!
//! - [`ConcurrentMap`]: leapfrog-probed hash map from non-zero `u64` keys to
//!   `Arc<V>` values with cooperative, in-place table migration.
//! - [`Qsbr`]: epoch based quiescent-state reclamation shared by the other
//!   structures in this crate.
//! - [`LocklessStack`]: Treiber stack whose nodes are reclaimed through
//!   [`Qsbr`], which also rules out ABA on the head pointer.

pub mod hash;
pub mod leapfrog;
pub mod qsbr;
pub mod stack;

pub use leapfrog::{ConcurrentMap, Mutator};
pub use qsbr::{Qsbr, QsbrGuard};
pub use stack::LocklessStack;
