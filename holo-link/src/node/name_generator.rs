/// Name generation for users that did not configure one
use markov_namegen::{CharacterChainGenerator, RandomTextGenerator};

/// Training names: chefs, cooks and kitchen words
const TRAINING_NAMES: &[&str] = &[
    "Auguste", "Marie", "Julia", "Paul", "Alice", "Jacques", "Elena", "Hugo",
    "Claire", "Massimo", "Rene", "Anne", "Pierre", "Nadia", "Yotam", "Emeril",
    "Basil", "Sage", "Rosemary", "Thyme", "Ginger", "Saffron", "Pepper", "Fennel",
    "Brioche", "Crepe", "Sorbet", "Mousse", "Gratin", "Tarte", "Souffle", "Praline",
];

/// Create a new name generator
fn create_name_generator() -> CharacterChainGenerator {
    CharacterChainGenerator::builder()
        .with_order(2)
        .with_prior(0.01)
        .train(TRAINING_NAMES.iter().copied())
        .build()
}

/// Generate a short pronounceable user name
///
/// Names are alphanumeric and at most 12 characters long, so they fit the
/// wire string and log lines comfortably.
pub fn generate_random_name() -> String {
    let mut generator = create_name_generator();

    loop {
        let name = generator.generate_one();
        if !name.is_empty() && name.len() <= 12 && name.chars().all(char::is_alphanumeric) {
            return name;
        }
    }
}
