//! Pooled coordinate lists, one per entry of a coordinate leaf.

use std::sync::OnceLock;
use trellis_buffer::ObjectPool;
use trellis_common::{Coordinate, CoordinateSet, Permutation, N_PERMUTATIONS};

/// Value slot of a coordinate leaf. Empty until parsed from the encoded
/// node when the leaf was loaded lazily.
pub(crate) type Line = OnceLock<CoordinateList>;

/// One pooled list cell.
#[derive(Debug, Default)]
pub(crate) struct CoordinateCell {
    pub(crate) coordinate: Coordinate,
    next: Option<Box<CoordinateCell>>,
}

/// Coordinates of one term, kept in ascending permutation order.
#[derive(Debug, Default)]
pub(crate) struct CoordinateList {
    head: Option<Box<CoordinateCell>>,
}

impl CoordinateList {
    /// Builds a list from coordinates already in ascending permutation order.
    pub(crate) fn from_sorted(
        coordinates: Vec<Coordinate>,
        pool: &ObjectPool<CoordinateCell>,
    ) -> Self {
        let mut head = None;
        for coordinate in coordinates.into_iter().rev() {
            let mut cell = pool.get();
            cell.coordinate = coordinate;
            cell.next = head;
            head = Some(cell);
        }
        Self { head }
    }

    pub(crate) fn from_set(set: &CoordinateSet, pool: &ObjectPool<CoordinateCell>) -> Self {
        Self::from_sorted(set.iter().copied().collect(), pool)
    }

    /// Makes the list hold exactly the entries of `set`.
    ///
    /// Cells of permutations still present are updated in place, cells of
    /// dropped permutations go back to the pool.
    pub(crate) fn add_coordinates(&mut self, set: &CoordinateSet, pool: &ObjectPool<CoordinateCell>) {
        let mut slots: [Option<Box<CoordinateCell>>; N_PERMUTATIONS] = Default::default();
        let mut cursor = self.head.take();
        while let Some(mut cell) = cursor {
            cursor = cell.next.take();
            let index = cell.coordinate.permutation.index();
            if let Some(duplicate) = slots[index].replace(cell) {
                pool.release(duplicate);
            }
        }

        for (permutation, slot) in Permutation::ALL.iter().zip(slots.iter_mut()) {
            match set.get(*permutation) {
                Some(coordinate) => match slot {
                    Some(cell) => cell.coordinate = *coordinate,
                    None => {
                        let mut cell = pool.get();
                        cell.coordinate = *coordinate;
                        *slot = Some(cell);
                    }
                },
                None => {
                    if let Some(cell) = slot.take() {
                        pool.release(cell);
                    }
                }
            }
        }

        let mut head = None;
        for slot in slots.iter_mut().rev() {
            if let Some(mut cell) = slot.take() {
                cell.next = head;
                head = Some(cell);
            }
        }
        self.head = head;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Coordinate> {
        std::iter::successors(self.head.as_deref(), |cell| cell.next.as_deref())
            .map(|cell| &cell.coordinate)
    }

    pub(crate) fn to_set(&self) -> CoordinateSet {
        self.iter().copied().collect()
    }

    /// Returns every cell to the pool.
    pub(crate) fn release(mut self, pool: &ObjectPool<CoordinateCell>) {
        let mut cursor = self.head.take();
        while let Some(mut cell) = cursor {
            cursor = cell.next.take();
            pool.release(cell);
        }
    }
}
