//! A fine-grained reactive state-management runtime: signals, computeds, effects, an
//! auto-tracking dependency graph, a micro-batching scheduler, and `zenAsync`, a keyed
//! async-result cache layered on top.
//!
//! ```
//! use zen_reactive::*;
//!
//! let root = create_root(|| {
//!     let count = create_signal(0);
//!     let doubled = create_computed(move || count.get() * 2);
//!     create_effect(move || println!("doubled is now {}", doubled.get()));
//!     count.set(21);
//! });
//! root.dispose();
//! ```

#![warn(missing_docs)]

mod computed;
mod effect;
mod error;
mod node;
mod resolve;
mod root;
mod signal;
mod zen_async;

pub use computed::*;
pub use effect::*;
pub use error::*;
pub use node::NodeHandle;
pub use resolve::*;
pub use root::*;
pub use signal::*;
pub use zen_async::*;

use node::{NodeId, ReactiveNode};
use root::Root;
