//! Synthetic account event generation

use crate::model::{AccountAction, AccountEvent};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

const FIRST_NAMES: [&str; 32] = [
    "James", "Mary", "John", "Patricia", "Robert", "Jennifer", "Michael", "Linda", "William",
    "Elizabeth", "David", "Barbara", "Richard", "Susan", "Joseph", "Jessica", "Thomas", "Sarah",
    "Charles", "Karen", "Christopher", "Lisa", "Daniel", "Nancy", "Matthew", "Betty", "Anthony",
    "Margaret", "Mark", "Sandra", "Donald", "Ashley",
];

const LAST_NAMES: [&str; 31] = [
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez", "Hernandez", "Lopez", "Gonzalez", "Wilson", "Anderson", "Thomas", "Taylor",
    "Moore", "Jackson", "Martin", "Lee", "Perez", "Thompson", "White", "Harris", "Sanchez",
    "Clark", "Ramirez", "Lewis", "Robinson", "Walker",
];

/// Prefix of every generated account number
pub const ACCOUNT_PREFIX: &str = "ACC-";

/// Builds random account events for the load producer
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageGenerator;

impl MessageGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generates an event from the thread-local random source, stamped with the current time
    pub fn generate(&self) -> AccountEvent {
        self.generate_with(&mut thread_rng())
    }

    /// Generates an event from a caller-supplied random source
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> AccountEvent {
        // Every choose() below is over a non-empty const array
        let first_name = FIRST_NAMES.choose(rng).copied().unwrap_or(FIRST_NAMES[0]);
        let last_name = LAST_NAMES.choose(rng).copied().unwrap_or(LAST_NAMES[0]);
        let account_action = AccountAction::ALL
            .choose(rng)
            .copied()
            .unwrap_or(AccountAction::Create);

        AccountEvent {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            account_number: format!("{}{:08X}", ACCOUNT_PREFIX, rng.gen::<u32>()),
            account_action,
            producer_ts: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_account_number_format() {
        let generator = MessageGenerator::new();
        for _ in 0..500 {
            let event = generator.generate();
            let number = &event.account_number;
            assert_eq!(number.len(), 12);
            assert!(number.starts_with(ACCOUNT_PREFIX));
            assert!(number[4..]
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }

    #[test]
    fn test_fields_come_from_fixed_lists() {
        let generator = MessageGenerator::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let event = generator.generate_with(&mut rng);
            assert!(FIRST_NAMES.contains(&event.first_name.as_str()));
            assert!(LAST_NAMES.contains(&event.last_name.as_str()));
            assert!(AccountAction::ALL.contains(&event.account_action));
            assert!(event.producer_ts.is_some());
        }
    }

    #[test]
    fn test_actions_are_spread_across_the_enumeration() {
        let generator = MessageGenerator::new();
        let mut rng = StdRng::seed_from_u64(42);
        let seen: HashSet<_> = (0..2000)
            .map(|_| generator.generate_with(&mut rng).account_action)
            .collect();
        assert_eq!(seen.len(), AccountAction::ALL.len());
    }

    #[test]
    fn test_producer_ts_is_current() {
        let before = Utc::now();
        let event = MessageGenerator::new().generate();
        let after = Utc::now();
        let ts = event.producer_ts.unwrap();
        assert!(ts >= before && ts <= after);
    }
}
