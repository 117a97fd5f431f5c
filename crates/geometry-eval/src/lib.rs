pub mod mock_evaluator;
pub mod traits;
pub mod types;

pub use mock_evaluator::MockEvaluator;
pub use traits::*;
pub use types::*;
