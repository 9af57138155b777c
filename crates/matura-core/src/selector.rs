use crate::types::Speaker;

/// Map a pair's turn counter to the member who speaks next.
///
/// Even counters belong to member A, odd counters to member B. This is the
/// only definition of alternation; every driver goes through it.
pub fn select_speaker(turn_counter: u64) -> Speaker {
    if turn_counter % 2 == 0 {
        Speaker::A
    } else {
        Speaker::B
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_counters_select_a() {
        assert_eq!(select_speaker(0), Speaker::A);
        assert_eq!(select_speaker(2), Speaker::A);
        assert_eq!(select_speaker(u64::MAX - 1), Speaker::A);
    }

    #[test]
    fn odd_counters_select_b() {
        assert_eq!(select_speaker(1), Speaker::B);
        assert_eq!(select_speaker(7), Speaker::B);
        assert_eq!(select_speaker(u64::MAX), Speaker::B);
    }

    #[test]
    fn consecutive_turns_alternate() {
        for n in 0..1_000u64 {
            assert_ne!(select_speaker(n), select_speaker(n + 1), "turn {n}");
            assert_eq!(select_speaker(n).other(), select_speaker(n + 1));
        }
    }
}
