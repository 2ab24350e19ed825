use crate::{storage::PartitionRecord, util::fnv1a_32};

/// Pick the target partition for a message.
///
/// Unkeyed messages always go to the lowest-numbered partition. Keyed
/// messages go to `fnv1a_32(key) % len`, indexing into `partitions` sorted by
/// number. The mapping is stable across restarts for a fixed partition count;
/// changing the count remaps keys.
///
/// Returns `None` only for an empty partition set.
pub fn select_partition<'a>(
    partitions: &'a [PartitionRecord],
    routing_key: Option<&str>,
) -> Option<&'a PartitionRecord> {
    if partitions.is_empty() {
        return None;
    }

    match routing_key {
        Some(key) if !key.is_empty() => {
            let idx = fnv1a_32(key.as_bytes()) as usize % partitions.len();
            partitions.get(idx)
        }
        _ => partitions.iter().min_by_key(|p| p.number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn partitions(n: u32) -> Vec<PartitionRecord> {
        let topic_id = Uuid::new_v4();
        (0..n)
            .map(|number| PartitionRecord {
                id: Uuid::new_v4(),
                topic_id,
                number,
            })
            .collect()
    }

    #[test]
    fn unkeyed_goes_to_lowest_partition() {
        let ps = partitions(4);
        assert_eq!(select_partition(&ps, None).unwrap().number, 0);
        assert_eq!(select_partition(&ps, Some("")).unwrap().number, 0);
    }

    #[test]
    fn keyed_selection_is_deterministic() {
        let ps = partitions(3);
        for key in ["user-42", "user-7", "a", "some longer routing key"] {
            let first = select_partition(&ps, Some(key)).unwrap().number;
            for _ in 0..10 {
                assert_eq!(select_partition(&ps, Some(key)).unwrap().number, first);
            }
            assert_eq!(first, fnv1a_32(key.as_bytes()) % 3);
        }
    }

    #[test]
    fn keys_spread_over_partitions() {
        let ps = partitions(4);
        let mut seen = [false; 4];
        for i in 0..200 {
            let p = select_partition(&ps, Some(&format!("key-{i}"))).unwrap();
            seen[p.number as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn empty_set_has_no_target() {
        assert!(select_partition(&[], Some("k")).is_none());
    }
}
