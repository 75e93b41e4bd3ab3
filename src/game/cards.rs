use std::collections::VecDeque;
use std::fmt;

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{Money, SquareId};

/// The two independent event-card partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckKind {
    Chance,
    Fate,
}

impl fmt::Display for DeckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeckKind::Chance => write!(f, "chance"),
            DeckKind::Fate => write!(f, "fate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "effect")]
pub enum EventEffect {
    /// Bank pays the drawer.
    Receive { amount: Money },
    /// Drawer pays the bank; a shortfall enters debt resolution.
    Pay { amount: Money },
    /// Token travels forward to the square, collecting the lap bonus if it
    /// passes start, then the landing resolver runs again.
    MoveTo { square: SquareId },
    GoToJail,
    /// Grants a get-out-of-jail token.
    JailPass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCard {
    pub text: Box<str>,
    #[serde(flatten)]
    pub effect: EventEffect,
}

/// A circular event deck. Draws pop the top card and requeue the same card
/// at the bottom, so the deck never empties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deck {
    cards: VecDeque<EventCard>,
}

impl Deck {
    fn new(mut cards: Vec<EventCard>, rng: &mut ChaCha8Rng) -> Self {
        cards.shuffle(rng);
        Self {
            cards: cards.into(),
        }
    }

    pub fn chance(rng: &mut ChaCha8Rng) -> Self {
        let card = |text: &str, effect| EventCard {
            text: text.into(),
            effect,
        };
        Self::new(
            vec![
                card("Street fair windfall", EventEffect::Receive { amount: 150 }),
                card("Bank error in your favour", EventEffect::Receive { amount: 250 }),
                card("Won the district lottery", EventEffect::Receive { amount: 400 }),
                card("Fined for littering", EventEffect::Pay { amount: 100 }),
                card("Carriage repairs", EventEffect::Pay { amount: 200 }),
                card("Express to Market Row", EventEffect::MoveTo { square: 7 }),
                card("Sail to the South Ferry", EventEffect::MoveTo { square: 20 }),
                card("Return to Start", EventEffect::MoveTo { square: 0 }),
                card("Caught fare dodging", EventEffect::GoToJail),
                card("A friend at the courthouse", EventEffect::JailPass),
            ],
            rng,
        )
    }

    pub fn fate(rng: &mut ChaCha8Rng) -> Self {
        let card = |text: &str, effect| EventCard {
            text: text.into(),
            effect,
        };
        Self::new(
            vec![
                card("Inheritance arrives", EventEffect::Receive { amount: 300 }),
                card("Tax rebate", EventEffect::Receive { amount: 120 }),
                card("Harvest dividend", EventEffect::Receive { amount: 200 }),
                card("Storm damage to your roof", EventEffect::Pay { amount: 150 }),
                card("Doctor's bill", EventEffect::Pay { amount: 80 }),
                card("Summoned to the Guild Hall", EventEffect::MoveTo { square: 14 }),
                card("Pilgrimage to the Fountain", EventEffect::MoveTo { square: 19 }),
                card("Smuggling charge", EventEffect::GoToJail),
                card("Royal pardon", EventEffect::JailPass),
                card("Festival takings", EventEffect::Receive { amount: 100 }),
            ],
            rng,
        )
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Draws the top card and requeues it at the bottom.
    pub fn draw(&mut self) -> EventCard {
        // Decks are built non-empty and draws never remove cards.
        let card = self.cards.pop_front().expect("deck is never empty");
        self.cards.push_back(card.clone());
        card
    }
}

/// When a character card may be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationWindow {
    /// On the holder's turn, before the first roll.
    BeforeRoll,
    WhileJailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterEffect {
    /// The next lap bonus collected is doubled.
    DoubleLapBonus,
    /// The next toll owed is waived entirely.
    TollWaiver,
    /// Grants an extra roll this turn.
    BonusRoll,
    /// Immediate release from jail.
    JailBreak,
}

/// A one-shot character power, dealt one per player at room setup and
/// detached from the holder on use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterCard {
    pub name: Box<str>,
    pub effect: CharacterEffect,
    pub window: ActivationWindow,
}

impl CharacterCard {
    /// The standard character set, dealt round-robin at game start.
    pub fn standard_set() -> Vec<CharacterCard> {
        let card = |name: &str, effect, window| CharacterCard {
            name: name.into(),
            effect,
            window,
        };
        vec![
            card(
                "Navigator",
                CharacterEffect::DoubleLapBonus,
                ActivationWindow::BeforeRoll,
            ),
            card(
                "Diplomat",
                CharacterEffect::TollWaiver,
                ActivationWindow::BeforeRoll,
            ),
            card(
                "Courier",
                CharacterEffect::BonusRoll,
                ActivationWindow::BeforeRoll,
            ),
            card(
                "Locksmith",
                CharacterEffect::JailBreak,
                ActivationWindow::WhileJailed,
            ),
            card(
                "Magnate",
                CharacterEffect::DoubleLapBonus,
                ActivationWindow::BeforeRoll,
            ),
            card(
                "Smuggler",
                CharacterEffect::TollWaiver,
                ActivationWindow::BeforeRoll,
            ),
        ]
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn draws_never_deplete_the_deck() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut deck = Deck::chance(&mut rng);
        let size = deck.len();
        for _ in 0..size * 3 {
            deck.draw();
        }
        assert_eq!(deck.len(), size);
    }

    #[test]
    fn draw_cycles_in_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut deck = Deck::fate(&mut rng);
        let first_pass: Vec<_> = (0..deck.len()).map(|_| deck.draw().text).collect();
        let second_pass: Vec<_> = (0..deck.len()).map(|_| deck.draw().text).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn character_set_covers_every_effect() {
        let set = CharacterCard::standard_set();
        for effect in [
            CharacterEffect::DoubleLapBonus,
            CharacterEffect::TollWaiver,
            CharacterEffect::BonusRoll,
            CharacterEffect::JailBreak,
        ] {
            assert!(set.iter().any(|c| c.effect == effect));
        }
    }
}
