//! Copy-on-write column access.
//!
//! A [`ColumnView`] starts out reading a shared "rest" column. The first
//! [`read_write`](ColumnView::read_write) call copies the rest column into a
//! private buffer, and every later access (read or write) sees the private
//! copy until [`reset`](ColumnView::reset).

use std::sync::Arc;

/// A column shared until first written.
#[derive(Debug, Clone)]
pub struct ColumnView<T: Clone> {
    rest: Arc<[T]>,
    local: Vec<T>,
    duplicated: bool,
}

impl<T: Clone> ColumnView<T> {
    pub fn new(rest: Arc<[T]>) -> Self {
        Self {
            rest,
            local: Vec::new(),
            duplicated: false,
        }
    }

    /// The private copy if one exists, otherwise the rest column.
    pub fn read_only(&self) -> &[T] {
        if self.duplicated {
            &self.local
        } else {
            &self.rest
        }
    }

    /// Mutable access, duplicating the rest column on first use.
    pub fn read_write(&mut self) -> &mut [T] {
        if !self.duplicated {
            self.local = self.rest.to_vec();
            self.duplicated = true;
        }
        &mut self.local
    }

    /// Whether a private copy has been made.
    pub fn is_duplicated(&self) -> bool {
        self.duplicated
    }

    /// Drop the private copy and go back to reading the rest column.
    pub fn reset(&mut self) {
        self.local = Vec::new();
        self.duplicated = false;
    }

    /// The shared rest column.
    pub fn rest(&self) -> &Arc<[T]> {
        &self.rest
    }

    pub fn len(&self) -> usize {
        self.read_only().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_only().is_empty()
    }
}
