//! Codex
//!
//! A player's private board. Cards sit on a diagonal grid: every new card
//! overlaps one or more corners of cards placed earlier, so a corner is
//! covered exactly when the neighbouring cell in its direction holds a card
//! placed later.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::card::{Card, Corner, CornerPosition, Symbol};

/// A cell on the codex grid. The starter card sits at the origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: i32,
    pub col: i32,
}

impl Position {
    pub const ORIGIN: Position = Position { row: 0, col: 0 };

    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    /// The cell touched by one of this cell's corners.
    pub fn neighbour(self, corner: CornerPosition) -> Position {
        let (dr, dc) = corner.offset();
        Position::new(self.row + dr, self.col + dc)
    }

    /// The four diagonal neighbours.
    pub fn diagonals(self) -> impl Iterator<Item = (CornerPosition, Position)> {
        CornerPosition::ALL.into_iter().map(move |c| (c, self.neighbour(c)))
    }
}

/// A card on the board.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedCard {
    pub card: Card,
    pub face_up: bool,
    pub position: Position,
    /// Placement order, starting at 0 for the starter.
    pub order: u32,
}

impl PlacedCard {
    /// Corner as printed on the visible side.
    pub fn corner(&self, corner: CornerPosition) -> Corner {
        self.card.side(self.face_up).corner(corner)
    }
}

/// A player's board.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codex {
    cards: Vec<PlacedCard>,
}

impl Codex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Placed cards in placement order.
    pub fn cards(&self) -> &[PlacedCard] {
        &self.cards
    }

    pub fn get(&self, position: Position) -> Option<&PlacedCard> {
        self.cards.iter().find(|c| c.position == position)
    }

    pub fn is_occupied(&self, position: Position) -> bool {
        self.get(position).is_some()
    }

    /// Put a card on the board. Legality is the rule evaluator's concern.
    pub fn place(&mut self, card: Card, face_up: bool, position: Position) {
        let order = self.cards.len() as u32;
        self.cards.push(PlacedCard { card, face_up, position, order });
    }

    /// Whether the corner of the card at `position` lies under a later card.
    pub fn is_corner_covered(&self, position: Position, corner: CornerPosition) -> bool {
        let Some(base) = self.get(position) else {
            return false;
        };
        self.get(position.neighbour(corner))
            .map(|other| other.order > base.order)
            .unwrap_or(false)
    }

    /// Count every visible symbol: uncovered corner symbols plus center
    /// resources of the visible sides.
    pub fn symbol_counts(&self) -> BTreeMap<Symbol, u32> {
        let mut counts = BTreeMap::new();
        for placed in &self.cards {
            let side = placed.card.side(placed.face_up);
            for kingdom in &side.center {
                *counts.entry(Symbol::Kingdom(*kingdom)).or_insert(0) += 1;
            }
            for corner in CornerPosition::ALL {
                if let Corner::Symbol(symbol) = side.corner(corner) {
                    if !self.is_corner_covered(placed.position, corner) {
                        *counts.entry(symbol).or_insert(0) += 1;
                    }
                }
            }
        }
        counts
    }

    /// Visible count of one symbol.
    pub fn count(&self, symbol: Symbol) -> u32 {
        self.symbol_counts().get(&symbol).copied().unwrap_or(0)
    }

    /// Empty cells diagonally adjacent to at least one placed card.
    pub fn frontier(&self) -> Vec<Position> {
        let mut cells: Vec<Position> = self
            .cards
            .iter()
            .flat_map(|c| c.position.diagonals().map(|(_, p)| p))
            .filter(|p| !self.is_occupied(*p))
            .collect();
        cells.sort();
        cells.dedup();
        cells
    }
}

// =============================================================================
// TESTS
// =============================================================================
