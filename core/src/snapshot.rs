//! Versioned reference-data snapshots.
//!
//! RULE: Readers never observe a half-updated registry.
//! Every refresh or mutation builds a complete new snapshot and swaps
//! the pointer; evaluators holding the previous `Arc` keep reading
//! their generation until they drop it.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub generation: u64,
    pub taken_at: DateTime<Utc>,
    pub data: T,
}

pub struct Registry<T> {
    current: ArcSwap<Snapshot<T>>,
}

impl<T: Clone> Registry<T> {
    pub fn new(data: T, taken_at: DateTime<Utc>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot {
                generation: 0,
                taken_at,
                data,
            }),
        }
    }

    /// Lock-free read of the current generation.
    pub fn load(&self) -> Arc<Snapshot<T>> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Replace the whole data set. Returns the new generation.
    pub fn replace(&self, data: T, taken_at: DateTime<Utc>) -> u64 {
        let mut generation = 0;
        self.current.rcu(|cur| {
            generation = cur.generation + 1;
            Snapshot {
                generation,
                taken_at,
                data: data.clone(),
            }
        });
        generation
    }

    /// Copy-on-write edit of the current data. Returns the new generation.
    pub fn update<F>(&self, taken_at: DateTime<Utc>, mut edit: F) -> u64
    where
        F: FnMut(&mut T),
    {
        let mut generation = 0;
        self.current.rcu(|cur| {
            let mut data = cur.data.clone();
            edit(&mut data);
            generation = cur.generation + 1;
            Snapshot {
                generation,
                taken_at,
                data,
            }
        });
        generation
    }
}
