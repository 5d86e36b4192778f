//! Errors raised while building or validating scene data.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Mesh or scene data is malformed, e.g. a primitive with a partial
    /// triangle.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// An index refers past the end of its table.
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Following parent links from this node never reaches a root.
    #[error("Node hierarchy contains a cycle through node {0}")]
    HierarchyCycle(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
