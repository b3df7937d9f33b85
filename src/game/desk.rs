//! Desk
//!
//! The shared table: resource and gold decks, the two face-up cards shown for
//! each deck, the starter and objective decks, and the common objectives.

use serde::{Deserialize, Serialize};

use super::card::{Card, CardSet, ObjectiveCard};
use crate::core::rng::DeterministicRng;

/// Face-up cards shown next to each deck.
pub const DISPLAYED_PER_DECK: usize = 2;

/// Number of common objectives on the table.
pub const COMMON_OBJECTIVES: usize = 2;

/// The two decks a player can draw from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeckType {
    Resource,
    Gold,
}

impl DeckType {
    fn other(self) -> DeckType {
        match self {
            DeckType::Resource => DeckType::Gold,
            DeckType::Gold => DeckType::Resource,
        }
    }
}

/// The shared desk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Desk {
    pub resource_deck: Vec<Card>,
    pub gold_deck: Vec<Card>,
    pub displayed_resource: Vec<Card>,
    pub displayed_gold: Vec<Card>,
    pub starter_deck: Vec<Card>,
    pub objective_deck: Vec<ObjectiveCard>,
    pub common_objectives: Vec<ObjectiveCard>,
}

impl Desk {
    /// Shuffle every deck, reveal the displayed cards and the common
    /// objectives. The top of a deck is the end of its vector.
    pub fn shuffled(cards: &CardSet, rng: &mut DeterministicRng) -> Self {
        let mut desk = Desk {
            resource_deck: cards.resource.clone(),
            gold_deck: cards.gold.clone(),
            starter_deck: cards.starter.clone(),
            objective_deck: cards.objective.clone(),
            ..Desk::default()
        };

        rng.shuffle(&mut desk.resource_deck);
        rng.shuffle(&mut desk.gold_deck);
        rng.shuffle(&mut desk.starter_deck);
        rng.shuffle(&mut desk.objective_deck);

        for _ in 0..DISPLAYED_PER_DECK {
            if let Some(card) = desk.resource_deck.pop() {
                desk.displayed_resource.push(card);
            }
            if let Some(card) = desk.gold_deck.pop() {
                desk.displayed_gold.push(card);
            }
        }
        for _ in 0..COMMON_OBJECTIVES {
            if let Some(objective) = desk.objective_deck.pop() {
                desk.common_objectives.push(objective);
            }
        }

        desk
    }

    fn deck_mut(&mut self, deck: DeckType) -> &mut Vec<Card> {
        match deck {
            DeckType::Resource => &mut self.resource_deck,
            DeckType::Gold => &mut self.gold_deck,
        }
    }

    /// Cards currently shown for a deck.
    pub fn displayed(&self, deck: DeckType) -> &[Card] {
        match deck {
            DeckType::Resource => &self.displayed_resource,
            DeckType::Gold => &self.displayed_gold,
        }
    }

    fn displayed_mut(&mut self, deck: DeckType) -> &mut Vec<Card> {
        match deck {
            DeckType::Resource => &mut self.displayed_resource,
            DeckType::Gold => &mut self.displayed_gold,
        }
    }

    pub fn deck_len(&self, deck: DeckType) -> usize {
        match deck {
            DeckType::Resource => self.resource_deck.len(),
            DeckType::Gold => self.gold_deck.len(),
        }
    }

    /// Draw the top card of a deck.
    pub fn draw_from_deck(&mut self, deck: DeckType) -> Option<Card> {
        self.deck_mut(deck).pop()
    }

    /// Take a displayed card. The gap is refilled from the same deck, or from
    /// the other deck once the same deck is empty.
    pub fn draw_displayed(&mut self, deck: DeckType, index: usize) -> Option<Card> {
        if index >= self.displayed(deck).len() {
            return None;
        }
        let card = self.displayed_mut(deck).remove(index);

        let refill = self
            .draw_from_deck(deck)
            .or_else(|| self.draw_from_deck(deck.other()));
        if let Some(refill) = refill {
            self.displayed_mut(deck).insert(index, refill);
        }

        Some(card)
    }

    /// Draw from the first source that still has a card: resource deck, gold
    /// deck, displayed resource, displayed gold.
    pub fn draw_any(&mut self) -> Option<Card> {
        self.draw_from_deck(DeckType::Resource)
            .or_else(|| self.draw_from_deck(DeckType::Gold))
            .or_else(|| self.draw_displayed(DeckType::Resource, 0))
            .or_else(|| self.draw_displayed(DeckType::Gold, 0))
    }

    pub fn draw_starter(&mut self) -> Option<Card> {
        self.starter_deck.pop()
    }

    pub fn draw_objective(&mut self) -> Option<ObjectiveCard> {
        self.objective_deck.pop()
    }

    /// Both decks and both displays are empty.
    pub fn is_exhausted(&self) -> bool {
        self.resource_deck.is_empty()
            && self.gold_deck.is_empty()
            && self.displayed_resource.is_empty()
            && self.displayed_gold.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
