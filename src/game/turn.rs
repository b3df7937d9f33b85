//! Turn state machine
//!
//! Every operation validates status, action state and legality before it
//! touches the model. A rejected operation leaves the model exactly as it
//! was and queues no events.
//!
//! ```text
//! FIRSTMOVES ──starter + objective──► WAIT ──turn──► PLACE ──► DRAW ──► WAIT
//!      any non-ENDED state ──lost──► DISCONNECTED ──reconnect──► previous
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use super::card::CardSet;
use super::codex::Position;
use super::desk::{DeckType, Desk};
use super::events::GameEvent;
use super::rules::{evaluate_guarded, has_legal_placement_guarded, Placement, PlacementError, RuleEvaluator};
use super::state::{ChatMessage, GameModel, GameStatus, Player, PlayerAction};
use crate::core::rng::DeterministicRng;
use crate::{MAX_PLAYERS, MIN_PLAYERS};

/// Points that arm the final round.
pub const ENDGAME_POINTS: u32 = 20;

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_LEN: usize = 256;

/// Longest accepted nickname, in characters.
pub const MAX_NICKNAME_LEN: usize = 32;

/// Cards dealt to each player when the session turns ACTIVE.
const RESOURCE_HAND: usize = 2;
const GOLD_HAND: usize = 1;
const OBJECTIVE_OPTIONS: usize = 2;

/// Why a game operation was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("session is {actual:?}, expected {expected:?}")]
    WrongStatus { expected: GameStatus, actual: GameStatus },

    #[error("game full")]
    GameFull,

    #[error("nickname '{0}' is already taken")]
    NicknameTaken(String),

    #[error("nickname must be 1 to 32 characters")]
    InvalidNickname,

    #[error("game size has not been chosen yet")]
    SizeNotSet,

    #[error("game size is already set")]
    SizeAlreadySet,

    #[error("game size must be between 2 and 4, got {0}")]
    InvalidSize(u8),

    #[error("only the creator may set the game size")]
    NotCreator,

    #[error("no player named '{0}'")]
    UnknownPlayer(String),

    #[error("player is {actual:?}, expected {expected:?}")]
    WrongAction { expected: PlayerAction, actual: PlayerAction },

    #[error("player '{0}' is not disconnected")]
    NotDisconnected(String),

    #[error("starter card already placed")]
    StarterAlreadyPlaced,

    #[error("objective already chosen")]
    ObjectiveAlreadyChosen,

    #[error("no card at hand index {0}")]
    InvalidHandIndex(usize),

    #[error("no objective option at index {0}")]
    InvalidObjectiveIndex(usize),

    #[error("{0:?} deck is empty")]
    EmptyDeck(DeckType),

    #[error("no displayed {deck:?} card at index {index}")]
    EmptyDisplaySlot { deck: DeckType, index: usize },

    #[error("chat message must be 1 to 256 characters")]
    InvalidChat,

    #[error(transparent)]
    Placement(#[from] PlacementError),
}

/// Result of a game operation.
pub type ActionResult = Result<(), ActionError>;

impl GameModel {
    // =========================================================================
    // Lobby
    // =========================================================================

    /// Seat a new player. The first player is the creator and may join an
    /// unsized session; everybody else needs a chosen size and a free seat.
    pub fn add_player(&mut self, nickname: &str) -> ActionResult {
        let length = nickname.chars().count();
        if nickname.trim().is_empty() || length > MAX_NICKNAME_LEN {
            return Err(ActionError::InvalidNickname);
        }
        if let Some(size) = self.target_size {
            if self.players.len() >= size as usize {
                return Err(ActionError::GameFull);
            }
        }
        self.expect_status(GameStatus::Idle)?;
        if !self.players.is_empty() && self.target_size.is_none() {
            return Err(ActionError::SizeNotSet);
        }
        if self.player(nickname).is_some() {
            return Err(ActionError::NicknameTaken(nickname.to_string()));
        }

        self.players.push(Player::new(nickname));
        self.push_event(GameEvent::PlayerJoined { nickname: nickname.to_string() });
        debug!(session = self.id, nickname, seats = self.players.len(), "player seated");

        if self.target_size == Some(self.players.len() as u8) {
            self.start();
        }
        Ok(())
    }

    /// Choose the number of players. Creator only, once, while IDLE.
    pub fn set_size(&mut self, requester: &str, size: u8) -> ActionResult {
        self.expect_status(GameStatus::Idle)?;
        self.require_player(requester)?;
        if self.creator().map(|p| p.nickname.as_str()) != Some(requester) {
            return Err(ActionError::NotCreator);
        }
        if self.target_size.is_some() {
            return Err(ActionError::SizeAlreadySet);
        }
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&size) {
            return Err(ActionError::InvalidSize(size));
        }

        self.target_size = Some(size);
        if self.players.len() == size as usize {
            self.start();
        }
        Ok(())
    }

    /// Leave the session. While IDLE the seat is freed; once ACTIVE the
    /// player forfeits and stays on the table as ENDED.
    pub fn leave(&mut self, nickname: &str, rules: &dyn RuleEvaluator) -> ActionResult {
        self.require_player(nickname)?;
        match self.status {
            GameStatus::Idle => {
                self.remove_player(nickname);
                Ok(())
            }
            GameStatus::Active => {
                if let Some(player) = self.player_mut(nickname) {
                    player.action = PlayerAction::Ended;
                    player.resume_action = None;
                    player.connected = false;
                }
                self.push_event(GameEvent::PlayerLeft { nickname: nickname.to_string() });
                self.settle(rules);
                Ok(())
            }
            GameStatus::Ended => Err(ActionError::WrongStatus {
                expected: GameStatus::Active,
                actual: GameStatus::Ended,
            }),
        }
    }

    // =========================================================================
    // First moves
    // =========================================================================

    /// Put the dealt starter card on the origin, either side up.
    pub fn place_starter(&mut self, nickname: &str, face_up: bool, rules: &dyn RuleEvaluator) -> ActionResult {
        self.expect_status(GameStatus::Active)?;
        let index = self.expect_action(nickname, PlayerAction::FirstMoves)?;

        let player = &self.players[index];
        let starter = player.starter.as_ref().ok_or(ActionError::StarterAlreadyPlaced)?;
        let placement = Placement { card: starter, face_up, position: Position::ORIGIN };
        evaluate_guarded(rules, &player.codex, &placement)?;

        let player = &mut self.players[index];
        if let Some(starter) = player.starter.take() {
            player.codex.place(starter, face_up, Position::ORIGIN);
        }
        self.after_first_move(index, rules);
        Ok(())
    }

    /// Keep one of the two dealt objective options.
    pub fn select_objective(&mut self, nickname: &str, option: usize, rules: &dyn RuleEvaluator) -> ActionResult {
        self.expect_status(GameStatus::Active)?;
        let index = self.expect_action(nickname, PlayerAction::FirstMoves)?;

        let player = &mut self.players[index];
        if player.objective.is_some() {
            return Err(ActionError::ObjectiveAlreadyChosen);
        }
        if option >= player.objective_options.len() {
            return Err(ActionError::InvalidObjectiveIndex(option));
        }

        player.objective = Some(player.objective_options.remove(option));
        player.objective_options.clear();
        self.after_first_move(index, rules);
        Ok(())
    }

    fn after_first_move(&mut self, index: usize, rules: &dyn RuleEvaluator) {
        if self.players[index].first_moves_done() {
            self.players[index].action = PlayerAction::Wait;
            self.maybe_begin_turns(rules);
        }
    }

    // =========================================================================
    // Turns
    // =========================================================================

    /// Place a card from the hand during PLACE.
    pub fn place_card(
        &mut self,
        nickname: &str,
        hand_index: usize,
        face_up: bool,
        position: Position,
        rules: &dyn RuleEvaluator,
    ) -> ActionResult {
        self.expect_status(GameStatus::Active)?;
        let index = self.expect_action(nickname, PlayerAction::Place)?;

        let player = &self.players[index];
        let card = player.hand.get(hand_index).ok_or(ActionError::InvalidHandIndex(hand_index))?;
        let placement = Placement { card, face_up, position };
        let outcome = evaluate_guarded(rules, &player.codex, &placement)?;

        let player = &mut self.players[index];
        let card = player.hand.remove(hand_index);
        player.codex.place(card, face_up, position);
        player.points += outcome.points;
        let points = player.points;

        if points >= ENDGAME_POINTS {
            self.arm_final_round();
        }

        if self.desk.is_exhausted() {
            // nothing left to draw, the turn ends here
            self.arm_final_round();
            self.complete_turn(index, rules);
        } else {
            self.players[index].action = PlayerAction::Draw;
        }
        Ok(())
    }

    /// Draw the top card of a deck during DRAW.
    pub fn draw_from_deck(&mut self, nickname: &str, deck: DeckType, rules: &dyn RuleEvaluator) -> ActionResult {
        self.expect_status(GameStatus::Active)?;
        let index = self.expect_action(nickname, PlayerAction::Draw)?;

        let card = self.desk.draw_from_deck(deck).ok_or(ActionError::EmptyDeck(deck))?;
        self.players[index].hand.push(card);
        self.after_draw(index, rules);
        Ok(())
    }

    /// Take one of the displayed cards during DRAW.
    pub fn draw_displayed(
        &mut self,
        nickname: &str,
        deck: DeckType,
        slot: usize,
        rules: &dyn RuleEvaluator,
    ) -> ActionResult {
        self.expect_status(GameStatus::Active)?;
        let index = self.expect_action(nickname, PlayerAction::Draw)?;

        let card = self
            .desk
            .draw_displayed(deck, slot)
            .ok_or(ActionError::EmptyDisplaySlot { deck, index: slot })?;
        self.players[index].hand.push(card);
        self.after_draw(index, rules);
        Ok(())
    }

    fn after_draw(&mut self, index: usize, rules: &dyn RuleEvaluator) {
        if self.desk.is_exhausted() {
            self.arm_final_round();
        }
        self.complete_turn(index, rules);
    }

    // =========================================================================
    // Chat
    // =========================================================================

    /// Append a public chat message.
    pub fn post_chat(&mut self, nickname: &str, text: &str, sent_at: DateTime<Utc>) -> ActionResult {
        if self.status == GameStatus::Ended {
            return Err(ActionError::WrongStatus {
                expected: GameStatus::Active,
                actual: GameStatus::Ended,
            });
        }
        self.require_player(nickname)?;

        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
            return Err(ActionError::InvalidChat);
        }

        let message = ChatMessage {
            sender: nickname.to_string(),
            text: text.to_string(),
            sent_at,
        };
        self.chat.push(message.clone());
        self.push_event(GameEvent::ChatPosted(message));
        Ok(())
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    /// Connection to a player lost. Idempotent.
    ///
    /// While IDLE this is a leave. During ACTIVE the player keeps its seat:
    /// a PLACE turn is skipped, a pending DRAW is completed from the first
    /// source that still has cards, and the state to restore on reconnect is
    /// kept aside.
    pub fn disconnect(&mut self, nickname: &str, rules: &dyn RuleEvaluator) {
        let Some(index) = self.player_index(nickname) else {
            return;
        };

        match self.status {
            GameStatus::Idle => self.remove_player(nickname),
            GameStatus::Ended => self.players[index].connected = false,
            GameStatus::Active => {
                let player = &self.players[index];
                if !player.connected {
                    return;
                }
                let prior = player.action;

                self.players[index].connected = false;
                if prior != PlayerAction::Ended {
                    let resume = match prior {
                        PlayerAction::Place => self.turn_over_state(),
                        PlayerAction::Draw => {
                            if let Some(card) = self.desk.draw_any() {
                                self.players[index].hand.push(card);
                            }
                            if self.desk.is_exhausted() {
                                self.arm_final_round();
                            }
                            self.turn_over_state()
                        }
                        other => other,
                    };
                    let player = &mut self.players[index];
                    player.action = PlayerAction::Disconnected;
                    player.resume_action = Some(resume);
                }

                info!(session = self.id, nickname, ?prior, "player disconnected");
                self.push_event(GameEvent::PlayerDisconnected { nickname: nickname.to_string() });
                self.settle(rules);
            }
        }
    }

    /// Reattach a DISCONNECTED player and restore its previous state.
    pub fn reconnect(&mut self, nickname: &str, rules: &dyn RuleEvaluator) -> ActionResult {
        self.expect_status(GameStatus::Active)?;
        let index = self.require_player(nickname)?;

        let player = &mut self.players[index];
        if player.action != PlayerAction::Disconnected {
            return Err(ActionError::NotDisconnected(nickname.to_string()));
        }
        player.action = player.resume_action.take().unwrap_or(PlayerAction::Wait);
        player.connected = true;
        let restored = player.action;

        info!(session = self.id, nickname, ?restored, "player reconnected");
        self.push_event(GameEvent::PlayerRejoined { nickname: nickname.to_string() });
        self.settle(rules);
        Ok(())
    }

    /// End a session nobody came back to.
    pub fn abandon(&mut self) {
        if self.status != GameStatus::Ended {
            info!(session = self.id, "session abandoned");
            self.finish();
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn expect_status(&self, expected: GameStatus) -> ActionResult {
        if self.status == expected {
            Ok(())
        } else {
            Err(ActionError::WrongStatus { expected, actual: self.status })
        }
    }

    fn require_player(&self, nickname: &str) -> Result<usize, ActionError> {
        self.player_index(nickname)
            .ok_or_else(|| ActionError::UnknownPlayer(nickname.to_string()))
    }

    fn expect_action(&self, nickname: &str, expected: PlayerAction) -> Result<usize, ActionError> {
        let index = self.require_player(nickname)?;
        let actual = self.players[index].action;
        if actual == expected {
            Ok(index)
        } else {
            Err(ActionError::WrongAction { expected, actual })
        }
    }

    fn remove_player(&mut self, nickname: &str) {
        if let Some(index) = self.player_index(nickname) {
            self.players.remove(index);
            self.push_event(GameEvent::PlayerLeft { nickname: nickname.to_string() });
        }
    }

    /// IDLE → ACTIVE: shuffle the desk and deal.
    fn start(&mut self) {
        let mut rng = DeterministicRng::new(self.seed);
        let mut desk = Desk::shuffled(&CardSet::standard(), &mut rng);

        for player in &mut self.players {
            player.action = PlayerAction::FirstMoves;
            for _ in 0..RESOURCE_HAND {
                player.hand.extend(desk.draw_from_deck(DeckType::Resource));
            }
            for _ in 0..GOLD_HAND {
                player.hand.extend(desk.draw_from_deck(DeckType::Gold));
            }
            player.starter = desk.draw_starter();
            for _ in 0..OBJECTIVE_OPTIONS {
                player.objective_options.extend(desk.draw_objective());
            }
        }

        self.desk = desk;
        self.status = GameStatus::Active;
        info!(session = self.id, players = self.players.len(), "session active");
    }

    /// Start turn play once no connected player is still on first moves.
    /// Absent players get the default first moves.
    fn maybe_begin_turns(&mut self, rules: &dyn RuleEvaluator) {
        if self.turns_started || self.status != GameStatus::Active {
            return;
        }
        if self.players.iter().any(|p| p.action == PlayerAction::FirstMoves) {
            return;
        }

        for player in &mut self.players {
            if player.resume_action == Some(PlayerAction::FirstMoves) {
                if let Some(starter) = player.starter.take() {
                    player.codex.place(starter, true, Position::ORIGIN);
                }
                if player.objective.is_none() && !player.objective_options.is_empty() {
                    player.objective = Some(player.objective_options.remove(0));
                    player.objective_options.clear();
                }
                player.resume_action = Some(PlayerAction::Wait);
            }
        }

        self.turns_started = true;
        debug!(session = self.id, "turn play begins");
        self.advance_turn(rules);
    }

    fn arm_final_round(&mut self) {
        if self.final_round.is_none() {
            self.final_round = Some(self.round + 1);
            info!(session = self.id, last_round = self.round + 1, "final round armed");
        }
    }

    /// State of a player whose turn just ended.
    fn turn_over_state(&self) -> PlayerAction {
        if self.final_round == Some(self.round) {
            PlayerAction::Ended
        } else {
            PlayerAction::Wait
        }
    }

    fn complete_turn(&mut self, index: usize, rules: &dyn RuleEvaluator) {
        self.players[index].action = self.turn_over_state();
        self.advance_turn(rules);
    }

    /// Repair the rotation after a connectivity change.
    fn settle(&mut self, rules: &dyn RuleEvaluator) {
        if self.status != GameStatus::Active {
            return;
        }
        if !self.turns_started {
            self.maybe_begin_turns(rules);
        } else if self.current_player().is_none() {
            self.advance_turn(rules);
        }
    }

    /// Hand the turn to the next waiting player in join order.
    fn advance_turn(&mut self, rules: &dyn RuleEvaluator) {
        let count = self.players.len();
        let mut rounds_exhausted = false;

        for step in 1..=count {
            let index = match self.turn_cursor {
                Some(cursor) => (cursor + step) % count,
                None => step - 1,
            };
            if index == 0 && self.turn_cursor.is_some() {
                self.round += 1;
                if self.final_round.map_or(false, |last| self.round > last) {
                    rounds_exhausted = true;
                    break;
                }
            }

            let player = &self.players[index];
            if player.action != PlayerAction::Wait {
                continue;
            }
            if !has_legal_placement_guarded(rules, &player.codex, &player.hand) {
                info!(session = self.id, nickname = %player.nickname, "no legal placement left");
                self.players[index].action = PlayerAction::Ended;
                continue;
            }

            self.players[index].action = PlayerAction::Place;
            self.turn_cursor = Some(index);
            let nickname = self.players[index].nickname.clone();
            debug!(session = self.id, %nickname, round = self.round, "turn advanced");
            self.push_event(GameEvent::TurnAdvanced { nickname, round: self.round });
            return;
        }

        // Nobody can take the turn. Unless the last round is behind us, a
        // disconnected player may still come back and play.
        let recoverable = self.players.iter().any(|p| p.action == PlayerAction::Disconnected);
        if rounds_exhausted || self.connected_count() > 0 || !recoverable {
            self.finish();
        }
    }

    fn finish(&mut self) {
        let best = self.players.iter().map(|p| p.points).max().unwrap_or(0);
        self.winners = self
            .players
            .iter()
            .filter(|p| p.points == best)
            .map(|p| p.nickname.clone())
            .collect();

        for player in &mut self.players {
            if player.action.is_in_play() || player.action == PlayerAction::FirstMoves {
                player.action = PlayerAction::Ended;
            }
        }

        self.status = GameStatus::Ended;
        info!(session = self.id, winners = ?self.winners, "session ended");
        self.push_event(GameEvent::GameEnded { winners: self.winners.clone() });
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::card::{Card, CardKind, Corner, Kingdom, Side};
    use crate::game::rules::StandardRules;
    use proptest::prelude::*;

    const RULES: StandardRules = StandardRules;

    fn lobby(size: u8, names: &[&str]) -> GameModel {
        let mut model = GameModel::new(1, 99);
        model.add_player(names[0]).unwrap();
        model.set_size(names[0], size).unwrap();
        for name in &names[1..] {
            model.add_player(name).unwrap();
        }
        model.take_events();
        model
    }

    fn in_turns(names: &[&str]) -> GameModel {
        let mut model = lobby(names.len() as u8, names);
        for name in names {
            model.place_starter(name, true, &RULES).unwrap();
            model.select_objective(name, 0, &RULES).unwrap();
        }
        model.take_events();
        model
    }

    /// First legal face-down placement for the player holding the turn.
    fn legal_move(model: &GameModel, nickname: &str) -> (usize, Position) {
        let player = model.player(nickname).unwrap();
        for (index, card) in player.hand.iter().enumerate() {
            for position in player.codex.frontier() {
                let placement = Placement { card, face_up: false, position };
                if RULES.evaluate(&player.codex, &placement).is_ok() {
                    return (index, position);
                }
            }
        }
        panic!("no legal move for {nickname}");
    }

    fn play_turn(model: &mut GameModel, nickname: &str) {
        let (index, position) = legal_move(model, nickname);
        model.place_card(nickname, index, false, position, &RULES).unwrap();
        if model.player(nickname).unwrap().action == PlayerAction::Draw {
            let deck = if model.desk.deck_len(DeckType::Resource) > 0 {
                DeckType::Resource
            } else {
                DeckType::Gold
            };
            model.draw_from_deck(nickname, deck, &RULES).unwrap();
        }
    }

    fn actions(model: &GameModel) -> Vec<PlayerAction> {
        model.players.iter().map(|p| p.action).collect()
    }

    #[test]
    fn test_full_session_turns_active() {
        let model = lobby(2, &["alice", "bob"]);
        assert_eq!(model.status, GameStatus::Active);
        assert_eq!(actions(&model), vec![PlayerAction::FirstMoves; 2]);

        for player in &model.players {
            assert_eq!(player.hand.len(), 3);
            assert_eq!(player.hand.iter().filter(|c| c.is_gold()).count(), 1);
            assert!(player.starter.is_some());
            assert_eq!(player.objective_options.len(), 2);
        }
        assert_eq!(model.desk.common_objectives.len(), 2);
    }

    #[test]
    fn test_join_rules() {
        let mut model = GameModel::new(1, 1);
        model.add_player("alice").unwrap();
        assert_eq!(model.add_player("bob"), Err(ActionError::SizeNotSet));

        assert_eq!(model.set_size("bob", 2), Err(ActionError::UnknownPlayer("bob".into())));
        assert_eq!(model.set_size("alice", 5), Err(ActionError::InvalidSize(5)));
        model.set_size("alice", 3).unwrap();
        assert_eq!(model.set_size("alice", 2), Err(ActionError::SizeAlreadySet));

        assert_eq!(model.add_player("alice"), Err(ActionError::NicknameTaken("alice".into())));
        assert_eq!(model.add_player(""), Err(ActionError::InvalidNickname));
        model.add_player("Alice").unwrap();
        model.add_player("carol").unwrap();
        assert_eq!(model.add_player("dave"), Err(ActionError::GameFull));
        assert_eq!(model.status, GameStatus::Active);
    }

    #[test]
    fn test_only_creator_sets_size() {
        let mut model = GameModel::new(1, 1);
        model.add_player("alice").unwrap();
        model.players.push(Player::new("mallory"));
        assert_eq!(model.set_size("mallory", 2), Err(ActionError::NotCreator));
    }

    #[test]
    fn test_first_moves_then_first_turn() {
        let mut model = lobby(2, &["alice", "bob"]);

        model.place_starter("alice", false, &RULES).unwrap();
        assert_eq!(model.place_starter("alice", true, &RULES), Err(ActionError::StarterAlreadyPlaced));
        assert_eq!(model.select_objective("alice", 2, &RULES), Err(ActionError::InvalidObjectiveIndex(2)));
        model.select_objective("alice", 1, &RULES).unwrap();
        assert_eq!(model.player("alice").unwrap().action, PlayerAction::Wait);
        assert!(!model.turns_started);

        model.select_objective("bob", 0, &RULES).unwrap();
        model.place_starter("bob", true, &RULES).unwrap();

        assert!(model.turns_started);
        assert_eq!(actions(&model), vec![PlayerAction::Place, PlayerAction::Wait]);
        assert!(model
            .take_events()
            .contains(&GameEvent::TurnAdvanced { nickname: "alice".into(), round: 0 }));
    }

    #[test]
    fn test_turn_rotation() {
        let mut model = in_turns(&["alice", "bob"]);

        let (index, position) = legal_move(&model, "bob");
        assert_eq!(
            model.place_card("bob", index, false, position, &RULES),
            Err(ActionError::WrongAction { expected: PlayerAction::Place, actual: PlayerAction::Wait })
        );

        let (index, position) = legal_move(&model, "alice");
        model.place_card("alice", index, false, position, &RULES).unwrap();
        assert_eq!(model.player("alice").unwrap().hand.len(), 2);
        assert_eq!(actions(&model), vec![PlayerAction::Draw, PlayerAction::Wait]);

        model.draw_displayed("alice", DeckType::Gold, 0, &RULES).unwrap();
        assert_eq!(model.player("alice").unwrap().hand.len(), 3);
        assert_eq!(actions(&model), vec![PlayerAction::Wait, PlayerAction::Place]);

        play_turn(&mut model, "bob");
        assert_eq!(model.round, 1);
        assert_eq!(actions(&model), vec![PlayerAction::Place, PlayerAction::Wait]);
    }

    #[test]
    fn test_requirements_not_respected_leaves_board_unchanged() {
        let mut model = in_turns(&["alice", "bob"]);
        let gold = Card {
            id: 999,
            kind: CardKind::Gold,
            kingdom: Some(Kingdom::Animal),
            front: Side::new([Corner::Empty; 4]),
            back: Side::kingdom_back(Kingdom::Animal),
            points: 5,
            requirement: vec![(Kingdom::Animal, 5)],
        };
        model.players[0].hand[0] = gold;
        let before = model.clone();

        let err = model
            .place_card("alice", 0, true, Position::new(1, 1), &RULES)
            .unwrap_err();
        assert_eq!(err, ActionError::Placement(PlacementError::RequirementsNotRespected));
        assert_eq!(err.to_string(), "requirements not respected");
        assert_eq!(model, before);
    }

    #[test]
    fn test_disconnect_during_place_skips_turn() {
        let mut model = in_turns(&["alice", "bob"]);
        let hand = model.players[0].hand.clone();

        model.disconnect("alice", &RULES);
        assert_eq!(actions(&model), vec![PlayerAction::Disconnected, PlayerAction::Place]);
        assert!(model
            .take_events()
            .contains(&GameEvent::PlayerDisconnected { nickname: "alice".into() }));

        // idempotent
        model.disconnect("alice", &RULES);
        assert!(model.take_events().is_empty());

        model.reconnect("alice", &RULES).unwrap();
        assert_eq!(actions(&model), vec![PlayerAction::Wait, PlayerAction::Place]);
        assert_eq!(model.players[0].hand, hand);
        assert!(model.players[0].connected);
        assert_eq!(
            model.take_events(),
            vec![GameEvent::PlayerRejoined { nickname: "alice".into() }]
        );
    }

    #[test]
    fn test_disconnect_during_draw_completes_draw() {
        let mut model = in_turns(&["alice", "bob"]);
        let (index, position) = legal_move(&model, "alice");
        model.place_card("alice", index, false, position, &RULES).unwrap();

        model.disconnect("alice", &RULES);
        assert_eq!(model.players[0].hand.len(), 3);
        assert_eq!(model.players[0].resume_action, Some(PlayerAction::Wait));
        assert_eq!(model.players[1].action, PlayerAction::Place);
    }

    #[test]
    fn test_reconnect_rules() {
        let mut model = in_turns(&["alice", "bob"]);
        assert_eq!(
            model.reconnect("alice", &RULES),
            Err(ActionError::NotDisconnected("alice".into()))
        );

        model.disconnect("bob", &RULES);
        model.abandon();
        assert!(matches!(model.reconnect("bob", &RULES), Err(ActionError::WrongStatus { .. })));
    }

    #[test]
    fn test_absent_player_gets_default_first_moves() {
        let mut model = lobby(2, &["alice", "bob"]);
        model.disconnect("bob", &RULES);
        assert_eq!(model.players[1].resume_action, Some(PlayerAction::FirstMoves));

        model.place_starter("alice", true, &RULES).unwrap();
        model.select_objective("alice", 0, &RULES).unwrap();

        assert!(model.turns_started);
        let bob = &model.players[1];
        assert_eq!(bob.codex.len(), 1);
        assert!(bob.objective.is_some());
        assert_eq!(bob.resume_action, Some(PlayerAction::Wait));
        assert_eq!(model.players[0].action, PlayerAction::Place);

        model.reconnect("bob", &RULES).unwrap();
        assert_eq!(model.players[1].action, PlayerAction::Wait);
    }

    #[test]
    fn test_everyone_disconnected_stalls_until_abandoned() {
        let mut model = in_turns(&["alice", "bob"]);
        model.disconnect("alice", &RULES);
        model.disconnect("bob", &RULES);

        assert_eq!(model.status, GameStatus::Active);
        assert!(model.current_player().is_none());

        model.reconnect("bob", &RULES).unwrap();
        assert_eq!(model.players[1].action, PlayerAction::Place);

        model.disconnect("bob", &RULES);
        model.abandon();
        assert_eq!(model.status, GameStatus::Ended);
    }

    #[test]
    fn test_leave() {
        let mut idle = GameModel::new(1, 1);
        idle.add_player("alice").unwrap();
        idle.set_size("alice", 3).unwrap();
        idle.add_player("bob").unwrap();
        idle.take_events();
        idle.leave("bob", &RULES).unwrap();
        assert_eq!(idle.players.len(), 1);
        assert_eq!(idle.take_events(), vec![GameEvent::PlayerLeft { nickname: "bob".into() }]);

        let mut model = in_turns(&["alice", "bob", "carol"]);
        model.leave("alice", &RULES).unwrap();
        assert_eq!(
            actions(&model),
            vec![PlayerAction::Ended, PlayerAction::Place, PlayerAction::Wait]
        );
    }

    #[test]
    fn test_last_player_standing_ends_game() {
        let mut model = in_turns(&["alice", "bob"]);
        model.leave("bob", &RULES).unwrap();
        model.leave("alice", &RULES).unwrap();
        assert_eq!(model.status, GameStatus::Ended);

        let mut model = in_turns(&["alice", "bob"]);
        model.players[1].points = 7;
        model.leave("alice", &RULES).unwrap();
        assert_eq!(model.players[1].action, PlayerAction::Place);

        model.final_round = Some(model.round);
        play_turn(&mut model, "bob");
        assert_eq!(model.status, GameStatus::Ended);
        assert_eq!(model.winners, vec!["bob".to_string()]);
    }

    #[test]
    fn test_only_disconnected_left_waits() {
        let mut model = in_turns(&["alice", "bob"]);
        model.disconnect("bob", &RULES);
        model.leave("alice", &RULES).unwrap();
        assert_eq!(model.status, GameStatus::Active);
        assert_eq!(model.connected_count(), 0);
    }

    #[test]
    fn test_game_over_ends_even_with_nobody_connected() {
        let mut model = in_turns(&["alice", "bob"]);
        model.disconnect("bob", &RULES);
        model.final_round = Some(model.round);
        model.players[1].points = 3;

        let (index, position) = legal_move(&model, "alice");
        model.place_card("alice", index, false, position, &RULES).unwrap();
        // alice drops during her last draw, bob is still away
        model.disconnect("alice", &RULES);

        assert_eq!(model.connected_count(), 0);
        assert_eq!(model.status, GameStatus::Ended);
        assert_eq!(model.winners, vec!["bob".to_string()]);
        assert!(model
            .take_events()
            .contains(&GameEvent::GameEnded { winners: vec!["bob".into()] }));
    }

    #[test]
    fn test_final_round() {
        let mut model = in_turns(&["alice", "bob"]);
        model.players[0].points = ENDGAME_POINTS;

        play_turn(&mut model, "alice");
        assert_eq!(model.final_round, Some(1));
        play_turn(&mut model, "bob");
        assert_eq!(actions(&model), vec![PlayerAction::Place, PlayerAction::Wait]);

        play_turn(&mut model, "alice");
        assert_eq!(actions(&model), vec![PlayerAction::Ended, PlayerAction::Place]);
        play_turn(&mut model, "bob");

        assert_eq!(model.status, GameStatus::Ended);
        assert_eq!(model.winners, vec!["alice".to_string()]);
        assert!(model
            .take_events()
            .contains(&GameEvent::GameEnded { winners: vec!["alice".into()] }));
    }

    #[test]
    fn test_no_legal_placement_ends_player() {
        let mut model = in_turns(&["alice", "bob"]);
        let blocked = Side::new([Corner::Hidden; 4]);
        // surround bob's board with a starter that exposes no corners
        model.players[1].codex = Default::default();
        model.players[1].codex.place(
            Card {
                id: 500,
                kind: CardKind::Starter,
                kingdom: None,
                front: blocked.clone(),
                back: blocked,
                points: 0,
                requirement: Vec::new(),
            },
            true,
            Position::ORIGIN,
        );

        play_turn(&mut model, "alice");
        assert_eq!(model.players[1].action, PlayerAction::Ended);
        assert_eq!(model.players[0].action, PlayerAction::Place);
    }

    #[test]
    fn test_chat() {
        let mut model = lobby(2, &["alice", "bob"]);
        let now = Utc::now();

        model.post_chat("alice", "hello", now).unwrap();
        assert_eq!(model.chat.len(), 1);
        assert_eq!(model.chat[0].sender, "alice");

        assert_eq!(model.post_chat("alice", "   ", now), Err(ActionError::InvalidChat));
        let long = "x".repeat(MAX_CHAT_LEN + 1);
        assert_eq!(model.post_chat("alice", &long, now), Err(ActionError::InvalidChat));
        assert!(matches!(model.post_chat("eve", "hi", now), Err(ActionError::UnknownPlayer(_))));
        assert_eq!(model.chat.len(), 1);
    }

    // =========================================================================
    // Properties
    // =========================================================================

    #[derive(Clone, Debug)]
    enum Step {
        Play(usize),
        Disconnect(usize),
        Reconnect(usize),
        Leave(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            6 => (0..3usize).prop_map(Step::Play),
            2 => (0..3usize).prop_map(Step::Disconnect),
            2 => (0..3usize).prop_map(Step::Reconnect),
            1 => (0..3usize).prop_map(Step::Leave),
        ]
    }

    /// Play a whole session with random legal moves until it ends.
    fn random_playout(seed: u64, names: &[&str]) -> GameModel {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = lobby(names.len() as u8, names);
        for name in names {
            model.place_starter(name, rng.gen(), &RULES).unwrap();
            model.select_objective(name, rng.gen_range(0..2), &RULES).unwrap();
        }

        for _ in 0..10_000 {
            if model.is_ended() {
                break;
            }
            let current = model.current_player().unwrap().nickname.clone();
            let player = model.player(&current).unwrap();

            let mut moves = Vec::new();
            for (index, card) in player.hand.iter().enumerate() {
                for position in player.codex.frontier() {
                    for face_up in [true, false] {
                        let placement = Placement { card, face_up, position };
                        if RULES.evaluate(&player.codex, &placement).is_ok() {
                            moves.push((index, face_up, position));
                        }
                    }
                }
            }
            let &(index, face_up, position) = moves.choose(&mut rng).unwrap();
            model.place_card(&current, index, face_up, position, &RULES).unwrap();

            if model.player(&current).unwrap().action == PlayerAction::Draw {
                let deck = *[DeckType::Resource, DeckType::Gold].choose(&mut rng).unwrap();
                let drawn = if rng.gen_bool(0.5) {
                    model.draw_from_deck(&current, deck, &RULES)
                } else {
                    model.draw_displayed(&current, deck, rng.gen_range(0..2), &RULES)
                };
                if drawn.is_err() {
                    // that source ran dry, take whatever is left
                    let fallback = [DeckType::Resource, DeckType::Gold]
                        .into_iter()
                        .find(|d| model.desk.deck_len(*d) > 0 || !model.desk.displayed(*d).is_empty())
                        .unwrap();
                    if model.desk.deck_len(fallback) > 0 {
                        model.draw_from_deck(&current, fallback, &RULES).unwrap();
                    } else {
                        model.draw_displayed(&current, fallback, 0, &RULES).unwrap();
                    }
                }
            }

            let holders = model.players.iter().filter(|p| p.action.is_turn()).count();
            assert!(holders <= 1);
        }
        model
    }

    #[test]
    fn test_random_playouts_end_with_winners() {
        for seed in 0..8u64 {
            let names = ["alice", "bob", "carol", "dave"];
            let model = random_playout(seed, &names[..2 + (seed as usize % 3)]);

            assert!(model.is_ended(), "seed {seed} did not finish");
            let best = model.players.iter().map(|p| p.points).max().unwrap();
            assert!(!model.winners.is_empty());
            for winner in &model.winners {
                assert_eq!(model.player(winner).unwrap().points, best);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_at_most_one_turn_holder(steps in prop::collection::vec(step(), 0..60)) {
            let names = ["alice", "bob", "carol"];
            let mut model = in_turns(&names);
            let mut last_status = model.status;

            for step in steps {
                match step {
                    Step::Play(i) => {
                        if model.players[i].action == PlayerAction::Place {
                            play_turn(&mut model, names[i]);
                        }
                    }
                    Step::Disconnect(i) => model.disconnect(names[i], &RULES),
                    Step::Reconnect(i) => {
                        let _ = model.reconnect(names[i], &RULES);
                    }
                    Step::Leave(i) => {
                        let _ = model.leave(names[i], &RULES);
                    }
                }

                let holders = model
                    .players
                    .iter()
                    .filter(|p| p.connected && p.action.is_turn())
                    .count();
                prop_assert!(holders <= 1);
                prop_assert!(model.status >= last_status);
                last_status = model.status;
            }
        }

        #[test]
        fn prop_join_count_matches_size(size in 2u8..=4, extra in 1usize..4) {
            let mut model = GameModel::new(1, 5);
            model.add_player("p0").unwrap();
            model.set_size("p0", size).unwrap();

            let mut joined = 1usize;
            let mut full = 0usize;
            for i in 1..(size as usize + extra) {
                match model.add_player(&format!("p{i}")) {
                    Ok(()) => joined += 1,
                    Err(ActionError::GameFull) => full += 1,
                    Err(other) => prop_assert!(false, "unexpected {other}"),
                }
            }
            prop_assert_eq!(joined, size as usize);
            prop_assert_eq!(full, extra);
            prop_assert_eq!(model.status, GameStatus::Active);
        }
    }
}
