pub mod feature_transformer;
pub mod model;
pub mod move_projection;
pub mod ops;

pub use feature_transformer::FeatureTransformer;
pub use model::{Network, NetworkInputs};
pub use move_projection::MoveProjection;

/// Parameters are initialized uniformly in `[-INIT_RANGE, INIT_RANGE]`.
pub const INIT_RANGE: f64 = 0.1;
