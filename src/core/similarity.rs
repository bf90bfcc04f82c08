use std::collections::BTreeSet;

/// Jaccard similarity of two sets: |A ∩ B| / |A ∪ B|
///
/// Two empty sets carry no shared-interest signal and score 0, not 1.
#[inline]
pub fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    if union == 0 {
        return 0.0;
    }
    shared as f64 / union as f64
}

/// Items present in every one of the given sets, in sorted order
pub fn common_items<'a, T, I>(sets: I) -> Vec<T>
where
    T: Ord + Clone + 'a,
    I: IntoIterator<Item = &'a BTreeSet<T>>,
{
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let mut common: BTreeSet<T> = first.clone();
    for set in iter {
        common.retain(|item| set.contains(item));
        if common.is_empty() {
            break;
        }
    }
    common.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_jaccard_of_empty_sets_is_zero() {
        assert_eq!(jaccard(&set(&[]), &set(&[])), 0.0);
        assert_eq!(jaccard(&set(&["rust"]), &set(&[])), 0.0);
    }

    #[test]
    fn test_jaccard_partial_overlap() {
        let score = jaccard(&set(&["rust", "coffee"]), &set(&["coffee", "books", "rust"]));
        assert!((score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_jaccard_identical_sets() {
        let topics = set(&["chess", "hiking"]);
        assert_eq!(jaccard(&topics, &topics), 1.0);
    }

    #[test]
    fn test_common_items() {
        let a = set(&["books", "coffee", "rust"]);
        let b = set(&["coffee", "rust"]);
        let c = set(&["rust", "tea"]);
        assert_eq!(common_items([&a, &b, &c]), vec!["rust".to_string()]);
        assert!(common_items::<String, _>(std::iter::empty()).is_empty());
    }
}
