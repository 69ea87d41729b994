/// Map a global sample index to its (shard index, in-shard offset) given
/// the per-shard sample counts of the main shardset. Returns None when
/// `index` is past the end of the shardset.
pub fn span(index: usize, shard_samples: &[usize]) -> Option<(usize, usize)> {
    let mut offset = index;
    for (shard_index, &samples) in shard_samples.iter().enumerate() {
        if offset < samples {
            return Some((shard_index, offset));
        }
        offset -= samples;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::span;

    #[test]
    fn test_span_basic() {
        let samples = [10, 10, 10];
        assert_eq!(span(0, &samples), Some((0, 0)));
        assert_eq!(span(9, &samples), Some((0, 9)));
        assert_eq!(span(10, &samples), Some((1, 0)));
        assert_eq!(span(29, &samples), Some((2, 9)));
        assert_eq!(span(30, &samples), None);
    }

    #[test]
    fn test_span_ragged_shards() {
        let samples = [3, 0, 5, 1];
        assert_eq!(span(2, &samples), Some((0, 2)));
        // Empty shards are skipped over.
        assert_eq!(span(3, &samples), Some((2, 0)));
        assert_eq!(span(7, &samples), Some((2, 4)));
        assert_eq!(span(8, &samples), Some((3, 0)));
        assert_eq!(span(9, &samples), None);
    }

    #[test]
    fn test_span_covers_every_index() {
        let samples = [7, 13, 1, 29];
        let total: usize = samples.iter().sum();
        let mut seen = Vec::new();
        for index in 0..total {
            let (shard, offset) = span(index, &samples).unwrap();
            seen.push((shard, offset));
        }
        // Offsets within each shard are dense and in order.
        for shard in 0..samples.len() {
            let offsets: Vec<usize> = seen
                .iter()
                .filter(|(s, _)| *s == shard)
                .map(|(_, o)| *o)
                .collect();
            assert_eq!(offsets, (0..samples[shard]).collect::<Vec<_>>());
        }
    }
}
