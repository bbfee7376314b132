//! Variable state and the merge engine that evolves it.
//!
//! [`apply`] is a pure function over two JSON trees. Every variable write
//! in Loomweave (request seeds, persistence, the standalone merge API) goes
//! through it, so its array and removal semantics are spelled out in
//! detail on [`MergeOperation`] and [`ArrayStrategy`].
//!
//! ```text
//! base      {a:1, arr:[1,2], nested:{k:"v", rm:0}}
//! overrides {b:2, arr:[2,3], nested:{k:"v2"}}
//! merge + union + remove_paths=["nested.rm"]
//!        => {a:1, b:2, arr:[1,2,3], nested:{k:"v2"}}
//! ```

mod merge;
mod path;
mod state;

pub use merge::{ArrayStrategy, MergeOperation, MergeOptions, MergeRequest, MergeResponse, apply, rebase};
pub use path::{PathSegment, get_path, parse_path, remove_path, set_path};
pub use state::{VariableScope, VariableSeed, VariableState};

/// Errors from the variable subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("cannot write through a non-container at '{0}'")]
    NotAContainer(String),
}
