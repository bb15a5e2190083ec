//! # Records and Cells
//!
//! A record is an ordered list of cells matching the view's header. A cell
//! normally holds one value; after GROUP BY each cell holds the group of
//! values collected from the grouped records, and `value()` exposes the
//! first entry for contexts that read a grouped record as a scalar row.

use crate::value::Primary;
use smallvec::{smallvec, SmallVec};

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    values: SmallVec<[Primary; 1]>,
}

impl Cell {
    pub fn new(value: Primary) -> Cell {
        Cell {
            values: smallvec![value],
        }
    }

    pub fn group(values: Vec<Primary>) -> Cell {
        Cell {
            values: SmallVec::from_vec(values),
        }
    }

    pub fn value(&self) -> &Primary {
        self.values.first().unwrap_or(&Primary::Null)
    }

    pub fn into_value(mut self) -> Primary {
        if self.values.is_empty() {
            Primary::Null
        } else {
            self.values.swap_remove(0)
        }
    }

    pub fn group_len(&self) -> usize {
        self.values.len()
    }

    pub fn group_values(&self) -> &[Primary] {
        &self.values
    }

    pub fn replace(&mut self, value: Primary) {
        self.values = smallvec![value];
    }
}

pub type Record = Vec<Cell>;
pub type RecordSet = Vec<Record>;

pub fn record_from_values(values: Vec<Primary>) -> Record {
    values.into_iter().map(Cell::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_value_cell() {
        let cell = Cell::new(Primary::Integer(5));
        assert_eq!(cell.value(), &Primary::Integer(5));
        assert_eq!(cell.group_len(), 1);
    }

    #[test]
    fn grouped_cell_exposes_first_value_and_group() {
        let cell = Cell::group(vec![
            Primary::Integer(1),
            Primary::Integer(2),
            Primary::Null,
        ]);
        assert_eq!(cell.value(), &Primary::Integer(1));
        assert_eq!(cell.group_len(), 3);
    }

    #[test]
    fn empty_group_reads_as_null() {
        let cell = Cell::group(Vec::new());
        assert_eq!(cell.value(), &Primary::Null);
    }
}
