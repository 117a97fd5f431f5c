use crate::types::*;

/// Geometry capability invoked by the feature engine during updates.
///
/// The engine owns ordering, status and failure bookkeeping; implementors
/// only turn resolved inputs into geometry. Calls may block for a long time.
/// Implemented by real geometry back ends and by `MockEvaluator`.
pub trait GeometryEvaluator {
    /// Extrude a sketch profile into a solid.
    fn extrude(&mut self, request: &ExtrudeRequest) -> Result<SolidHandle, EvalError>;
}

impl<T: GeometryEvaluator + ?Sized> GeometryEvaluator for Box<T> {
    fn extrude(&mut self, request: &ExtrudeRequest) -> Result<SolidHandle, EvalError> {
        (**self).extrude(request)
    }
}

impl<T: GeometryEvaluator + ?Sized> GeometryEvaluator for &mut T {
    fn extrude(&mut self, request: &ExtrudeRequest) -> Result<SolidHandle, EvalError> {
        (**self).extrude(request)
    }
}
