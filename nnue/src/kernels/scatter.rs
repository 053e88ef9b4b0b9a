use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

use super::add_scaled;

/// A row-major `f32` matrix whose cells can be added to from many threads.
///
/// Floats are stored as their bit patterns and updated with a CAS loop.
pub struct AtomicRows {
    cells: Box<[AtomicU32]>,
    width: usize,
}

impl AtomicRows {
    pub fn zeros(rows: usize, width: usize) -> Self {
        // 0u32 is the bit pattern of 0.0f32
        let cells = (0..rows * width).map(|_| AtomicU32::new(0)).collect();
        Self { cells, width }
    }

    #[inline(always)]
    pub fn add(&self, cell: usize, value: f32) {
        let cell = &self.cells[cell];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let updated = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// `self[row] += coeff * src`, one atomic add per lane.
    #[inline(always)]
    pub fn add_scaled_row(&self, row: usize, coeff: f32, src: &[f32]) {
        let offset = row * self.width;
        for (lane, &value) in src.iter().enumerate() {
            self.add(offset + lane, coeff * value);
        }
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.cells
            .into_vec()
            .into_iter()
            .map(|cell| f32::from_bits(cell.into_inner()))
            .collect()
    }
}

/// `target[row] += coeff * source(example)`
#[derive(Debug, Clone, Copy)]
pub struct Contribution {
    pub row: u32,
    pub example: u32,
    pub coeff: f32,
}

/// Row accessor over a `[n × width]` matrix, for use as a [`group_reduce`] source.
pub fn row_source<'a>(data: &'a [f32], width: usize) -> impl Fn(usize) -> &'a [f32] + Sync + Copy + 'a {
    move |row| &data[row * width..(row + 1) * width]
}

/// Reduces contributions into a zeroed `[rows × width]` matrix without atomics.
///
/// Contributions are bucketed by target row (a counting sort, so examples keep
/// their original order inside a bucket) and every row is summed by exactly one
/// task. The result does not depend on thread scheduling.
pub fn group_reduce<'a, F>(
    rows: usize,
    width: usize,
    contributions: &[Contribution],
    source: F,
) -> Vec<f32>
where
    F: Fn(usize) -> &'a [f32] + Sync,
{
    let mut offsets = vec![0usize; rows + 1];
    for c in contributions {
        offsets[c.row as usize + 1] += 1;
    }
    for row in 0..rows {
        offsets[row + 1] += offsets[row];
    }

    let mut cursor = offsets.clone();
    let mut grouped = vec![
        Contribution {
            row: 0,
            example: 0,
            coeff: 0.0,
        };
        contributions.len()
    ];
    for &c in contributions {
        let slot = &mut cursor[c.row as usize];
        grouped[*slot] = c;
        *slot += 1;
    }

    let mut output = vec![0f32; rows * width];
    output
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, dest)| {
            for c in &grouped[offsets[row]..offsets[row + 1]] {
                add_scaled(dest, source(c.example as usize), c.coeff);
            }
        });

    output
}
