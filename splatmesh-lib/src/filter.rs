use crate::common::sqr_magnitude;
use crate::structures::PointSet;

/// A point is exported only when it is not deleted and not a cutout.
/// Cutouts are flagged upstream by writing a non-zero normal.
#[inline]
pub fn is_alive(set: &PointSet, index: usize) -> bool {
    let deleted = set.deleted.is_deleted(index);
    // Only an exact zero counts as uncut; a NaN normal is treated as a cutout.
    let cutout = sqr_magnitude(set.records[index].normal) != 0.0;
    !deleted && !cutout
}

/// Surviving indices in their original order.
pub fn select(set: &PointSet) -> Vec<usize> {
    (0..set.records.len())
        .filter(|&i| is_alive(set, i))
        .collect()
}

pub fn alive_count(set: &PointSet) -> usize {
    (0..set.records.len()).filter(|&i| is_alive(set, i)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::{DeletionMask, PointRecord};

    fn record(tag: f32) -> PointRecord {
        PointRecord {
            position: [tag, 0.0, 0.0],
            ..Default::default()
        }
    }

    #[test]
    fn deleted_and_cutout_points_are_dropped() {
        let mut records: Vec<_> = (0..5).map(|i| record(i as f32)).collect();
        records[4].normal = [0.0, 1.0, 0.0];
        let mut mask = DeletionMask::new(5);
        mask.set_deleted(1, true);
        mask.set_deleted(3, true);
        let set = PointSet::with_mask(records, mask);

        assert_eq!(select(&set), vec![0, 2]);
        assert_eq!(alive_count(&set), 2);
    }

    #[test]
    fn order_is_preserved_across_words() {
        let records: Vec<_> = (0..100).map(|i| record(i as f32)).collect();
        let mut mask = DeletionMask::new(100);
        for i in (0..100).filter(|i| i % 3 == 0) {
            mask.set_deleted(i, true);
        }
        let set = PointSet::with_mask(records, mask);
        let expected: Vec<usize> = (0..100).filter(|i| i % 3 != 0).collect();
        assert_eq!(select(&set), expected);
    }

    #[test]
    fn cutout_test_uses_squared_magnitude() {
        let mut r = record(0.0);
        r.normal = [0.0, 0.0, 1e-23];
        let set = PointSet::new(vec![r]);
        // 1e-23 squared underflows to zero in f32.
        assert_eq!(alive_count(&set), 1);

        let mut r = record(0.0);
        r.normal = [0.0, 0.0, 1e-3];
        let set = PointSet::new(vec![r]);
        assert_eq!(alive_count(&set), 0);
    }

    #[test]
    fn nan_normal_is_a_cutout() {
        let mut r = record(0.0);
        r.normal = [f32::NAN, 0.0, 0.0];
        let set = PointSet::new(vec![r, record(1.0)]);
        assert_eq!(select(&set), vec![1]);
    }

    #[test]
    fn short_mask_reads_as_not_deleted() {
        let set = PointSet::with_mask(vec![record(0.0), record(1.0)], DeletionMask::default());
        assert_eq!(select(&set), vec![0, 1]);
    }
}
