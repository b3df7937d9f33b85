//! Placement rules
//!
//! The session asks a [`RuleEvaluator`] whether a placement is legal and what
//! it is worth. The evaluator runs synchronously inside the session's
//! critical section; [`evaluate_guarded`] turns a panicking evaluator into an
//! ordinary rejection so a faulty rule set can never take a session down.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use super::card::{Card, Corner, Symbol};
use super::codex::{Codex, Position};

/// Why a placement is illegal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("position ({row}, {col}) is already occupied")]
    Occupied { row: i32, col: i32 },

    #[error("position ({row}, {col}) does not touch any placed card")]
    NotReachable { row: i32, col: i32 },

    #[error("placement would cover a hidden corner")]
    CoversHiddenCorner,

    #[error("requirements not respected")]
    RequirementsNotRespected,

    #[error("starter cards only go at the origin")]
    StarterMisplaced,

    #[error("rule evaluation failed")]
    EvaluationFailed,
}

/// A proposed placement.
#[derive(Clone, Debug)]
pub struct Placement<'a> {
    pub card: &'a Card,
    pub face_up: bool,
    pub position: Position,
}

/// What a legal placement changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementOutcome {
    /// Points gained by the player.
    pub points: u32,
    /// Visible symbol counts after the placement.
    pub symbols: BTreeMap<Symbol, u32>,
}

/// The rule-evaluation collaborator.
pub trait RuleEvaluator: Send + Sync {
    /// Judge a placement against a codex. Must not mutate anything.
    fn evaluate(&self, codex: &Codex, placement: &Placement<'_>) -> Result<PlacementOutcome, PlacementError>;

    /// Whether any card of `hand` fits anywhere on `codex`, on either side.
    fn has_legal_placement(&self, codex: &Codex, hand: &[Card]) -> bool;
}

/// Call the evaluator, counting a panic as an illegal placement.
pub fn evaluate_guarded(
    rules: &dyn RuleEvaluator,
    codex: &Codex,
    placement: &Placement<'_>,
) -> Result<PlacementOutcome, PlacementError> {
    match catch_unwind(AssertUnwindSafe(|| rules.evaluate(codex, placement))) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(card = placement.card.id, "rule evaluator panicked");
            Err(PlacementError::EvaluationFailed)
        }
    }
}

/// Legal-move check with the same panic policy.
pub fn has_legal_placement_guarded(rules: &dyn RuleEvaluator, codex: &Codex, hand: &[Card]) -> bool {
    catch_unwind(AssertUnwindSafe(|| rules.has_legal_placement(codex, hand))).unwrap_or(false)
}

/// The standard placement rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardRules;

impl StandardRules {
    fn check_position(codex: &Codex, position: Position) -> Result<(), PlacementError> {
        if codex.is_occupied(position) {
            return Err(PlacementError::Occupied { row: position.row, col: position.col });
        }

        let mut touches = false;
        for (corner, neighbour) in position.diagonals() {
            if let Some(placed) = codex.get(neighbour) {
                touches = true;
                // the neighbour's corner pointing back at us gets covered
                if placed.corner(corner.opposite()) == Corner::Hidden {
                    return Err(PlacementError::CoversHiddenCorner);
                }
            }
        }

        if touches {
            Ok(())
        } else {
            Err(PlacementError::NotReachable { row: position.row, col: position.col })
        }
    }
}

impl RuleEvaluator for StandardRules {
    fn evaluate(&self, codex: &Codex, placement: &Placement<'_>) -> Result<PlacementOutcome, PlacementError> {
        let card = placement.card;

        if card.is_starter() || codex.is_empty() {
            if !(card.is_starter() && codex.is_empty() && placement.position == Position::ORIGIN) {
                return Err(PlacementError::StarterMisplaced);
            }
        } else {
            Self::check_position(codex, placement.position)?;
        }

        if placement.face_up && card.is_gold() {
            let counts = codex.symbol_counts();
            let met = card.requirement.iter().all(|(kingdom, needed)| {
                counts.get(&Symbol::Kingdom(*kingdom)).copied().unwrap_or(0) >= u32::from(*needed)
            });
            if !met {
                return Err(PlacementError::RequirementsNotRespected);
            }
        }

        let mut after = codex.clone();
        after.place(card.clone(), placement.face_up, placement.position);

        Ok(PlacementOutcome {
            points: if placement.face_up { card.points } else { 0 },
            symbols: after.symbol_counts(),
        })
    }

    fn has_legal_placement(&self, codex: &Codex, hand: &[Card]) -> bool {
        let frontier = codex.frontier();
        hand.iter().any(|card| {
            frontier.iter().any(|position| {
                // face down is requirement-free, so position legality decides
                let placement = Placement { card, face_up: false, position: *position };
                self.evaluate(codex, &placement).is_ok()
            })
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
