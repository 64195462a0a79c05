use chronicle_core::ExpectedRevision;

/// Hydrated state of one aggregate instance.
///
/// `revision` is what the next append must find (`New` before the first event,
/// `Exact(stream revision of the last folded event)` afterwards). `aggregate_version`
/// counts folded events and only grows while hydrating.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateStatus<S> {
    pub aggregate_id: String,
    pub state: S,
    pub revision: ExpectedRevision,
    pub aggregate_version: u64,
    pub projector_version: u32,
}

impl<S> AggregateStatus<S> {
    pub fn initial(aggregate_id: impl Into<String>, state: S, projector_version: u32) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            state,
            revision: ExpectedRevision::New,
            aggregate_version: 0,
            projector_version,
        }
    }

    /// Account for one more folded event.
    pub(crate) fn advance(&mut self) {
        self.revision = ExpectedRevision::Exact(self.aggregate_version);
        self.aggregate_version += 1;
    }
}
