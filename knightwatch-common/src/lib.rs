// Copyright (C) 2026 Knightwatch
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Side assignment on the board. The platform serializes colors lowercase.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PieceColor {
    White,
    Black,
}

/// One notification on the account-wide event stream.
///
/// The `type` field discriminates. Types this client does not know collapse
/// into `Unknown` so that new platform event kinds never break dispatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotificationEvent {
    GameStart { game: GameSummary },
    GameFinish { game: FinishedGame },
    Challenge { challenge: ChallengeSummary },
    #[serde(other)]
    Unknown,
}

/// The game payload of a `gameStart` notification, also the element shape of
/// the ongoing-games listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub game_id: String,
    pub color: PieceColor,
    #[serde(default)]
    pub fen: Option<String>,
    #[serde(default)]
    pub has_moved: bool,
    #[serde(default)]
    pub is_my_turn: bool,
    #[serde(default)]
    pub last_move: Option<String>,
}

/// The game payload of a `gameFinish` notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedGame {
    pub game_id: String,
    pub color: PieceColor,
    #[serde(default)]
    pub winner: Option<PieceColor>,
    #[serde(default)]
    pub status: Option<GameStatusName>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameStatusName {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeSummary {
    pub id: String,
    pub challenger: Challenger,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Challenger {
    pub id: String,
    pub name: String,
}

/// Response envelope of the ongoing-games lookup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OngoingGames {
    pub now_playing: Vec<GameSummary>,
}

/// One line on a per-game event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    GameFull(GameFull),
    GameState(GameStateEvent),
    ChatLine(ChatLineEvent),
    #[serde(other)]
    Unknown,
}

/// Authoritative view of a game, sent once when its stream opens. The state
/// field is replaced wholesale by every later `gameState` event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFull {
    pub initial_fen: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub state: GameStateEvent,
}

/// Clock and move-history snapshot of a game.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GameStateEvent {
    #[serde(default)]
    pub moves: String,
    pub wtime: u64,
    pub btime: u64,
    #[serde(default)]
    pub status: String,
}

impl GameStateEvent {
    /// Number of half-moves played so far.
    pub fn move_count(&self) -> usize {
        self.moves.split_whitespace().count()
    }

    /// Whose move the position expects. White opens, then the colors
    /// alternate with every half-move.
    pub fn on_turn(&self) -> PieceColor {
        if self.move_count() % 2 == 0 {
            PieceColor::White
        } else {
            PieceColor::Black
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatLineEvent {
    #[serde(default)]
    pub username: String,
    pub text: String,
    #[serde(default)]
    pub room: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(moves: &str) -> GameStateEvent {
        GameStateEvent {
            moves: moves.to_string(),
            wtime: 60_000,
            btime: 60_000,
            status: "started".to_string(),
        }
    }

    #[test]
    fn white_opens_an_empty_game() {
        assert_eq!(state("").on_turn(), PieceColor::White);
    }

    #[test]
    fn black_replies_after_the_first_half_move() {
        assert_eq!(state("e2e4").on_turn(), PieceColor::Black);
    }

    #[test]
    fn turn_parity_alternates_with_history_length() {
        assert_eq!(state("e2e4 e7e5").on_turn(), PieceColor::White);
        assert_eq!(state("e2e4 e7e5 g1f3").on_turn(), PieceColor::Black);
        assert_eq!(state("e2e4 e7e5 g1f3 b8c6").on_turn(), PieceColor::White);
    }

    #[test]
    fn move_count_matches_history_length() {
        assert_eq!(state("").move_count(), 0);
        assert_eq!(state("e2e4").move_count(), 1);
        assert_eq!(state("e2e4 e7e5").move_count(), 2);
    }

    #[test]
    fn game_start_notification_decodes() {
        let line = r#"{"type":"gameStart","game":{"gameId":"abc123","color":"black","fen":"rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1","hasMoved":false,"isMyTurn":false,"lastMove":""}}"#;
        match serde_json::from_str::<NotificationEvent>(line).unwrap() {
            NotificationEvent::GameStart { game } => {
                assert_eq!(game.game_id, "abc123");
                assert_eq!(game.color, PieceColor::Black);
                assert!(!game.is_my_turn);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn game_finish_notification_carries_the_winner() {
        let line = r#"{"type":"gameFinish","game":{"gameId":"abc123","color":"black","winner":"white","status":{"id":30,"name":"mate"}}}"#;
        match serde_json::from_str::<NotificationEvent>(line).unwrap() {
            NotificationEvent::GameFinish { game } => {
                assert_eq!(game.winner, Some(PieceColor::White));
                assert_eq!(game.status.unwrap().name, "mate");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn challenge_notification_decodes() {
        let line = r#"{"type":"challenge","challenge":{"id":"ch-1","challenger":{"id":"someone","name":"Someone"}}}"#;
        match serde_json::from_str::<NotificationEvent>(line).unwrap() {
            NotificationEvent::Challenge { challenge } => {
                assert_eq!(challenge.id, "ch-1");
                assert_eq!(challenge.challenger.name, "Someone");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_notification_types_fall_back_to_unknown() {
        let line = r#"{"type":"challengeCanceled","challenge":{"id":"ch-1"}}"#;
        assert!(matches!(
            serde_json::from_str::<NotificationEvent>(line).unwrap(),
            NotificationEvent::Unknown
        ));
    }

    #[test]
    fn full_game_event_embeds_the_initial_state() {
        let line = r#"{"type":"gameFull","initialFen":"startpos","createdAt":1700000000000,"state":{"type":"gameState","moves":"","wtime":300000,"btime":300000,"status":"started"}}"#;
        match serde_json::from_str::<GameEvent>(line).unwrap() {
            GameEvent::GameFull(full) => {
                assert_eq!(full.initial_fen, "startpos");
                assert_eq!(full.created_at.timestamp_millis(), 1_700_000_000_000);
                assert_eq!(full.state.on_turn(), PieceColor::White);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn state_event_decodes_clocks_and_moves() {
        let line = r#"{"type":"gameState","moves":"e2e4 c7c5","wtime":298000,"btime":296500,"status":"started"}"#;
        match serde_json::from_str::<GameEvent>(line).unwrap() {
            GameEvent::GameState(state) => {
                assert_eq!(state.move_count(), 2);
                assert_eq!(state.wtime, 298_000);
                assert_eq!(state.btime, 296_500);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn chat_event_decodes() {
        let line = r#"{"type":"chatLine","username":"someone","text":"good luck","room":"spectator"}"#;
        match serde_json::from_str::<GameEvent>(line).unwrap() {
            GameEvent::ChatLine(chat) => {
                assert_eq!(chat.text, "good luck");
                assert_eq!(chat.username, "someone");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_game_event_types_fall_back_to_unknown() {
        let line = r#"{"type":"opponentGone","gone":true,"claimWinInSeconds":8}"#;
        assert!(matches!(
            serde_json::from_str::<GameEvent>(line).unwrap(),
            GameEvent::Unknown
        ));
    }
}
