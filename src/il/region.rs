use super::{InsnId, Type};

#[derive(Clone, Debug, PartialEq)]
pub enum RegionKind {
    /// Catch handler, filtered by exception type (`None` catches everything)
    Catch(Option<Type>),
    Finally,
}

/// Protected range along with its handler
///
/// Ends are exclusive: `try_end` is the first instruction after the protected range and
/// `handler_end` the first instruction after the handler (`None` meaning the end of the body).
/// Regions are listed innermost first, and a catch sharing its protected range with a finally is
/// listed before it.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionRegion {
    pub try_start: InsnId,
    pub try_end: InsnId,
    pub handler_start: InsnId,
    pub handler_end: Option<InsnId>,
    pub kind: RegionKind,
}

impl ExceptionRegion {
    pub fn catch_all(
        try_start: InsnId,
        try_end: InsnId,
        handler_start: InsnId,
        handler_end: Option<InsnId>,
    ) -> ExceptionRegion {
        ExceptionRegion {
            try_start,
            try_end,
            handler_start,
            handler_end,
            kind: RegionKind::Catch(None),
        }
    }

    pub fn finally(
        try_start: InsnId,
        try_end: InsnId,
        handler_start: InsnId,
        handler_end: Option<InsnId>,
    ) -> ExceptionRegion {
        ExceptionRegion {
            try_start,
            try_end,
            handler_start,
            handler_end,
            kind: RegionKind::Finally,
        }
    }

    pub fn is_finally(&self) -> bool {
        matches!(self.kind, RegionKind::Finally)
    }

    /// Catch handler that accepts any exception
    pub fn is_catch_all(&self) -> bool {
        matches!(
            self.kind,
            RegionKind::Catch(None) | RegionKind::Catch(Some(Type::Object))
        )
    }

    /// Apply a function to every boundary
    pub fn map_boundaries(&mut self, mut f: impl FnMut(InsnId) -> Option<InsnId>) {
        let mut apply = |id: &mut InsnId| {
            if let Some(new_id) = f(*id) {
                *id = new_id;
            }
        };
        apply(&mut self.try_start);
        apply(&mut self.try_end);
        apply(&mut self.handler_start);
        if let Some(handler_end) = &mut self.handler_end {
            apply(handler_end);
        }
    }
}
