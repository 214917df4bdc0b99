pub mod registry;

pub use registry::{ClosedPosition, Position, PositionMetadata, PositionRegistry, PositionSource};
