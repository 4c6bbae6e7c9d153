//! Value types shared by the term tree and its collaborators.

use serde::{Deserialize, Serialize};

/// Process-unique identifier of a tree node.
pub type NodeId = u64;

/// Number of permutations a term can be stored under.
pub const N_PERMUTATIONS: usize = 6;

/// One of the fixed triple orderings under which postings are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Permutation {
    #[default]
    Spo = 0,
    Ops = 1,
    Pos = 2,
    Sop = 3,
    Osp = 4,
    Pso = 5,
}

impl Permutation {
    /// All permutations in ascending id order.
    pub const ALL: [Permutation; N_PERMUTATIONS] = [
        Permutation::Spo,
        Permutation::Ops,
        Permutation::Pos,
        Permutation::Sop,
        Permutation::Osp,
        Permutation::Pso,
    ];

    /// Returns the permutation with the given id.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Returns the id of this permutation.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Encoding scheme chosen by the table writer for one block of postings.
///
/// Opaque to the index: it is stored and returned unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Strategy(pub u8);

/// Location of the postings of one term under one permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub permutation: Permutation,
    pub file: u16,
    pub pos_in_file: u64,
    pub n_elements: u64,
    pub strategy: Strategy,
}

impl Coordinate {
    pub fn new(
        permutation: Permutation,
        file: u16,
        pos_in_file: u64,
        n_elements: u64,
        strategy: Strategy,
    ) -> Self {
        Self {
            permutation,
            file,
            pos_in_file,
            n_elements,
            strategy,
        }
    }
}

/// Sparse set of coordinates indexed by permutation.
///
/// A term need not have an entry for every permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoordinateSet {
    entries: [Option<Coordinate>; N_PERMUTATIONS],
}

impl CoordinateSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a coordinate, replacing any entry for the same permutation.
    pub fn set(&mut self, coordinate: Coordinate) {
        self.entries[coordinate.permutation.index()] = Some(coordinate);
    }

    /// Returns the entry for a permutation.
    #[inline]
    pub fn get(&self, permutation: Permutation) -> Option<&Coordinate> {
        self.entries[permutation.index()].as_ref()
    }

    #[inline]
    pub fn exists(&self, permutation: Permutation) -> bool {
        self.entries[permutation.index()].is_some()
    }

    /// Iterates present entries in ascending permutation order.
    pub fn iter(&self) -> impl Iterator<Item = &Coordinate> {
        self.entries.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }
}

impl FromIterator<Coordinate> for CoordinateSet {
    fn from_iter<I: IntoIterator<Item = Coordinate>>(iter: I) -> Self {
        let mut set = CoordinateSet::new();
        for coordinate in iter {
            set.set(coordinate);
        }
        set
    }
}

/// Owned key of a tree entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TermKey {
    Numeric(u64),
    Text(Box<[u8]>),
}

/// Owned value of a tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermValue {
    Number(u64),
    Coordinates(CoordinateSet),
}
