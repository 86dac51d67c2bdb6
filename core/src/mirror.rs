//! Local mirror of the pool collection.
//!
//! The mirror is rebuilt purely from the change feed: local mutation logic never writes
//! to it, so what a client renders is always something the store has confirmed.
//! Reconciliation is a pure [`Reducer`]; it reports what the shell should do next as
//! [`Effect`] values instead of logging or rendering itself.
//!
//! # Rules
//!
//! | Change    | Id known            | Id unknown                       |
//! |-----------|---------------------|----------------------------------|
//! | `Added`   | ignored (replay)    | appended                         |
//! | `Changed` | replaced in place   | ignored, anomaly reported        |
//! | `Removed` | deleted             | ignored, anomaly reported        |
//!
//! Every applied change, including ignored ones, asks for a refresh. The scheduler
//! coalesces those requests, so the reducer never has to.

use crate::effect::Effect;
use crate::ids::{PoolItemId, ProductId};
use crate::pool_store::{PoolChange, PoolItem};
use crate::reducer::Reducer;
use smallvec::{SmallVec, smallvec};
use std::fmt;

/// Client-local copy of the pool, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorState {
    items: Vec<PoolItem>,
    initial_sync_settled: bool,
}

impl MirrorState {
    /// Empty mirror.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            items: Vec::new(),
            initial_sync_settled: false,
        }
    }

    /// All entries in arrival order.
    #[must_use]
    pub fn items(&self) -> &[PoolItem] {
        &self.items
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// No entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Entry with the given id.
    #[must_use]
    pub fn get(&self, id: &PoolItemId) -> Option<&PoolItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// Entries for a product. Normally at most one, but two clients adding the same
    /// product at the same moment can briefly produce two.
    pub fn for_product<'a>(
        &'a self,
        product_id: &'a ProductId,
    ) -> impl Iterator<Item = &'a PoolItem> + 'a {
        self.items
            .iter()
            .filter(move |item| &item.product_id == product_id)
    }

    /// Whether the bulk initial load is considered over.
    #[must_use]
    pub const fn is_initial_sync_settled(&self) -> bool {
        self.initial_sync_settled
    }

    fn position(&self, id: &PoolItemId) -> Option<usize> {
        self.items.iter().position(|item| &item.id == id)
    }
}

/// Inputs to the mirror reducer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorAction {
    /// A change delivered by the subscription.
    Apply(PoolChange),
    /// The initial-load grace period elapsed.
    InitialSyncSettled,
    /// Drop everything (teardown).
    Reset,
    /// Drop all entries ahead of a fresh subscription replay. The settle flag stays.
    Resync,
}

/// A change the mirror could not apply as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorAnomaly {
    /// `Added` for an id already present; expected on subscription replay.
    DuplicateAdd(PoolItemId),
    /// `Changed` arrived before the matching `Added`.
    ChangedUnknown(PoolItemId),
    /// `Removed` for an id the mirror never saw (or already dropped).
    RemovedUnknown(PoolItemId),
}

impl MirrorAnomaly {
    /// Whether the shell should log this at `warn`. Duplicate adds are routine.
    #[must_use]
    pub const fn is_warning(&self) -> bool {
        !matches!(self, Self::DuplicateAdd(_))
    }

    /// Record the anomaly concerns.
    #[must_use]
    pub const fn id(&self) -> &PoolItemId {
        match self {
            Self::DuplicateAdd(id) | Self::ChangedUnknown(id) | Self::RemovedUnknown(id) => id,
        }
    }
}

impl fmt::Display for MirrorAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateAdd(id) => write!(f, "duplicate add for {id} ignored"),
            Self::ChangedUnknown(id) => write!(f, "change for unknown item {id} ignored"),
            Self::RemovedUnknown(id) => write!(f, "removal of unknown item {id} ignored"),
        }
    }
}

/// Pure reconciliation of change events into [`MirrorState`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MirrorReducer;

impl MirrorReducer {
    /// Create the reducer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply(state: &mut MirrorState, change: PoolChange) -> SmallVec<[Effect; 4]> {
        match change {
            PoolChange::Added(item) => {
                if state.position(&item.id).is_some() {
                    return smallvec![
                        Effect::Anomaly(MirrorAnomaly::DuplicateAdd(item.id)),
                        Effect::ScheduleRefresh,
                    ];
                }
                state.items.push(item);
                smallvec![Effect::ScheduleRefresh]
            },
            PoolChange::Changed(item) => match state.position(&item.id) {
                Some(index) => {
                    state.items[index] = item;
                    smallvec![Effect::ScheduleRefresh]
                },
                None => smallvec![
                    Effect::Anomaly(MirrorAnomaly::ChangedUnknown(item.id)),
                    Effect::ScheduleRefresh,
                ],
            },
            PoolChange::Removed(id) => match state.position(&id) {
                Some(index) => {
                    state.items.remove(index);
                    smallvec![Effect::ScheduleRefresh]
                },
                None => smallvec![
                    Effect::Anomaly(MirrorAnomaly::RemovedUnknown(id)),
                    Effect::ScheduleRefresh,
                ],
            },
        }
    }
}

impl Reducer for MirrorReducer {
    type State = MirrorState;
    type Action = MirrorAction;
    type Environment = ();

    fn reduce(
        &self,
        state: &mut MirrorState,
        action: MirrorAction,
        _env: &(),
    ) -> SmallVec<[Effect; 4]> {
        match action {
            MirrorAction::Apply(change) => Self::apply(state, change),
            MirrorAction::InitialSyncSettled => {
                state.initial_sync_settled = true;
                smallvec![Effect::None]
            },
            MirrorAction::Reset => {
                state.items.clear();
                state.initial_sync_settled = false;
                smallvec![Effect::None]
            },
            MirrorAction::Resync => {
                state.items.clear();
                smallvec![Effect::ScheduleRefresh]
            },
        }
    }
}
