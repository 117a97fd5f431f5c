pub mod ids;
pub mod kinds;

pub use ids::*;
pub use kinds::*;
