use dupcheck_core::cosine_similarity;
use proptest::prelude::*;

fn vector() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-100.0f32..100.0, 1..32)
}

proptest! {
    #[test]
    fn self_similarity_is_one(v in vector()) {
        prop_assume!(v.iter().any(|x| x.abs() > 1e-3));
        let score = cosine_similarity(&v, &v);
        prop_assert!((score - 1.0).abs() < 1e-4, "score {}", score);
    }

    #[test]
    fn similarity_is_symmetric(pair in (1usize..32).prop_flat_map(|len| {
        (
            prop::collection::vec(-100.0f32..100.0, len),
            prop::collection::vec(-100.0f32..100.0, len),
        )
    })) {
        let (a, b) = pair;
        prop_assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
    }

    #[test]
    fn zero_vector_scores_zero(v in vector()) {
        let zeros = vec![0.0f32; v.len()];
        prop_assert_eq!(cosine_similarity(&zeros, &v), 0.0);
        prop_assert_eq!(cosine_similarity(&v, &zeros), 0.0);
    }

    #[test]
    fn score_stays_in_range(pair in (1usize..16).prop_flat_map(|len| {
        (
            prop::collection::vec(-10.0f32..10.0, len),
            prop::collection::vec(-10.0f32..10.0, len),
        )
    })) {
        let score = cosine_similarity(&pair.0, &pair.1);
        prop_assert!((-1.0001..=1.0001).contains(&score));
    }
}
