//! Shared prompt prefix detection

use crate::backend::TokenId;

/// Length of the token prefix shared by every sequence, compared against the
/// first one.
///
/// A single sequence shares its whole length with itself; an empty slice
/// shares nothing.
pub fn shared_prefix_len<T: AsRef<[TokenId]>>(sequences: &[T]) -> usize {
    let Some((first, rest)) = sequences.split_first() else {
        return 0;
    };
    let first = first.as_ref();

    rest.iter().fold(first.len(), |len, seq| {
        first[..len]
            .iter()
            .zip(seq.as_ref())
            .take_while(|(a, b)| a == b)
            .count()
    })
}
