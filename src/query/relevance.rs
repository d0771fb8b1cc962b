//! Full-text relevance
//!
//! Input is an FTS `matchinfo(.., 'pcx')` array: phrase count `p`, column
//! count `c`, then for every (phrase, column) pair three counters: hits in
//! this row, hits in all rows, rows with at least one hit.

/// Weight of every full-text column
pub const COLUMN_WEIGHT: f64 = 1.0;

/// Sum over phrases and columns of local hits / global hits, weighted
pub fn rank_from_matchinfo(info: &[u32]) -> f64 {
    let [phrases, columns, counters @ ..] = info else {
        return 0.0;
    };
    let (phrases, columns) = (*phrases as usize, *columns as usize);
    if counters.len() < 3 * phrases * columns {
        return 0.0;
    }

    let mut rank = 0.0;
    for phrase in 0..phrases {
        for column in 0..columns {
            let at = 3 * (phrase * columns + column);
            let (local, global) = (counters[at], counters[at + 1]);
            if global > 0 {
                rank += f64::from(local) / f64::from(global) * COLUMN_WEIGHT;
            }
        }
    }
    rank
}
