pub mod extract;
pub mod normalize;
pub mod strip;

pub use extract::extract;
pub use normalize::{NormalizeError, Normalizer};
pub use strip::clean;
