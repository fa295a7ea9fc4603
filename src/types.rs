use derive_more::Display;
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashSet as _HashSet;

/// Identifier of a task inside the graph that created it.
///
/// Ids are dense: the `n`-th task added to a graph gets id `n`.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index.try_into().expect("NodeId::from_index"))
    }

    /// Position of the task in its graph.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a task does when it runs.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// No work; only orders its neighbours.
    #[display("placeholder")]
    Placeholder,
    /// A closure run once per execution.
    #[display("static")]
    Static,
    /// A closure that builds a nested graph joined before the successors run.
    #[display("subflow")]
    Subflow,
    /// Another taskflow's graph composed into this one.
    #[display("module")]
    Module,
    /// A nested graph of device operations offloaded to a device.
    #[display("device")]
    Device,
}

pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
