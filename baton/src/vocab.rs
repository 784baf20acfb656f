//! Word-list payload source for the demo binaries.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::pump::PayloadSource;
use crate::record::{DEFAULT_WIDTH, Record};

/// The payload vocabulary: the phonetic alphabet plus a separator word.
/// Every entry fits a default-width record with its NUL terminator.
pub const WORDS: [&str; 27] = [
    "Alpha",
    "Bravo",
    "Charlie",
    "Delta",
    "Echo",
    "Foxtrot",
    "Golf",
    "Hotel",
    "India",
    "Juliet",
    "Kilo",
    "Lima",
    "Mike",
    "November",
    "Oscar",
    "Papa",
    "Quebec",
    "Romeo",
    "Sierra",
    "Tango",
    "Uniform",
    "Victor",
    "Whiskey",
    "X-ray",
    "Yankee",
    "Zulu",
    "Dash",
];

/// Picks uniformly from [`WORDS`].
pub struct WordPicker {
    rng: SmallRng,
}

impl WordPicker {
    /// Picker seeded from the OS; every run produces a fresh sequence.
    pub fn from_entropy() -> Self {
        Self {
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Deterministic picker for repeatable sequences.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// The next word.
    pub fn pick(&mut self) -> &'static str {
        WORDS[self.rng.random_range(0..WORDS.len())]
    }
}

impl Default for WordPicker {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl PayloadSource<DEFAULT_WIDTH> for WordPicker {
    fn next_record(&mut self) -> Record<DEFAULT_WIDTH> {
        Record::from_str(self.pick()).expect("every vocabulary word fits the default width")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_word_fits_the_default_width() {
        for word in WORDS {
            assert!(word.len() < DEFAULT_WIDTH, "{word} does not fit");
        }
    }

    #[test]
    fn test_seeded_pickers_agree() {
        let mut a = WordPicker::seeded(42);
        let mut b = WordPicker::seeded(42);
        for _ in 0..50 {
            assert_eq!(a.pick(), b.pick());
        }
    }

    #[test]
    fn test_picker_covers_more_than_one_word() {
        let mut picker = WordPicker::seeded(7);
        let first = picker.pick();
        assert!((0..100).any(|_| picker.pick() != first));
    }

    #[test]
    fn test_payload_source_yields_vocabulary_text() {
        let mut picker = WordPicker::seeded(9);
        for _ in 0..10 {
            let record = picker.next_record();
            assert!(WORDS.contains(&record.text().unwrap()));
        }
    }
}
