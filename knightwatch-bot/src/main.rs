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

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    process::Stdio,
    sync::Arc,
};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream::BoxStream};
use knightwatch_common::{
    ChatLineEvent, GameEvent, GameFull, GameStateEvent, NotificationEvent, OngoingGames,
    PieceColor,
};
use rand::Rng;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    process::Command,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const DEFAULT_API_BASE_URL: &str = "https://lichess.org/api";
const CHAT_KEY_BYTES: usize = 3;

#[derive(Clone)]
struct LichessApi {
    client: reqwest::Client,
    base_url: String,
}

/// Why a per-game stream stopped producing events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
enum StreamError {
    #[error("game stream could not be established: {0}")]
    Unavailable(String),
    #[error("game stream closed before the game ended")]
    Closed,
    #[error("game stream failed: {0}")]
    Failed(String),
}

/// One game's event stream, demultiplexed into a state queue and a chat
/// queue by a background task. Dropping the session aborts that task and
/// releases the stream.
struct GameSession {
    full_game: Arc<Mutex<Option<GameFull>>>,
    state_rx: mpsc::UnboundedReceiver<GameStateEvent>,
    chat_rx: mpsc::UnboundedReceiver<ChatLineEvent>,
    demux: Option<JoinHandle<anyhow::Result<()>>>,
    outcome: Option<StreamError>,
}

#[derive(Default)]
struct GameRegistry {
    workers: HashMap<String, JoinHandle<()>>,
}

struct LineFramer {
    chunks: BoxStream<'static, reqwest::Result<Bytes>>,
    pending: VecDeque<String>,
    partial: Vec<u8>,
    done: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "knightwatch_bot=debug".to_string()),
        )
        .init();

    let token =
        std::env::var("LICHESS_TOKEN").context("LICHESS_TOKEN must be set to a bot API token")?;
    let engine_path = std::env::var("ENGINE_PATH")
        .context("ENGINE_PATH must point to the engine executable")?;
    let base_url = std::env::var("LICHESS_BASE_URL")
        .ok()
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

    if !Path::new(&engine_path).is_file() {
        anyhow::bail!("engine executable not found at {engine_path}");
    }

    let api = LichessApi::new(base_url, &token)?;
    let username = api
        .account_username()
        .await
        .context("could not verify the lichess token")?;
    info!(username = %username, engine = %engine_path, "authenticated; watching for games");

    run_dispatcher(&api, &engine_path).await
}

impl LichessApi {
    fn new(base_url: String, token: &str) -> anyhow::Result<Self> {
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("access token contains characters not allowed in a header")?;
        auth.set_sensitive(true);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build the http client")?;
        Ok(Self { client, base_url })
    }

    async fn account_username(&self) -> anyhow::Result<String> {
        let response = self
            .client
            .get(format!("{}/account", self.base_url))
            .send()
            .await
            .context("account lookup request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("account lookup returned {status}");
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("invalid account payload")?;
        body.get("username")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("account payload is missing a username"))
    }

    async fn ongoing_games(&self) -> anyhow::Result<Vec<knightwatch_common::GameSummary>> {
        let response = self
            .client
            .get(format!("{}/account/playing", self.base_url))
            .send()
            .await
            .context("ongoing games request failed")?
            .error_for_status()
            .context("ongoing games lookup rejected")?;

        let games: OngoingGames = response
            .json()
            .await
            .context("invalid ongoing games payload")?;
        Ok(games.now_playing)
    }

    async fn stream_events(
        &self,
    ) -> anyhow::Result<impl Stream<Item = anyhow::Result<String>> + Send> {
        let response = self
            .client
            .get(format!("{}/stream/event", self.base_url))
            .send()
            .await
            .context("failed to open the account event stream")?
            .error_for_status()
            .context("account event stream rejected")?;
        Ok(ndjson_lines(response))
    }

    async fn open_game(&self, game_id: &str) -> Result<GameSession, StreamError> {
        let response = self
            .client
            .get(format!("{}/bot/game/stream/{}", self.base_url, game_id))
            .send()
            .await
            .map_err(|error| StreamError::Unavailable(error.to_string()))?
            .error_for_status()
            .map_err(|error| StreamError::Unavailable(error.to_string()))?;
        Ok(GameSession::start(
            game_id.to_string(),
            ndjson_lines(response),
        ))
    }

    async fn make_move(&self, game_id: &str, candidate: &str) -> anyhow::Result<bool> {
        let response = self
            .client
            .post(format!(
                "{}/bot/game/{}/move/{}",
                self.base_url, game_id, candidate
            ))
            .send()
            .await
            .context("move submission request failed")?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            game_id = %game_id,
            candidate = %candidate,
            status = %status,
            body = %body.trim(),
            "move submission rejected"
        );
        Ok(false)
    }

    async fn send_chat(&self, game_id: &str, text: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/bot/game/{}/chat", self.base_url, game_id))
            .form(&[("room", "spectator"), ("text", text)])
            .send()
            .await
            .context("chat request failed")?;
        if !response.status().is_success() {
            warn!(game_id = %game_id, status = %response.status(), "chat message rejected");
        }
        Ok(())
    }
}

fn ndjson_lines(response: reqwest::Response) -> impl Stream<Item = anyhow::Result<String>> + Send {
    let framer = LineFramer {
        chunks: response.bytes_stream().boxed(),
        pending: VecDeque::new(),
        partial: Vec::new(),
        done: false,
    };
    futures_util::stream::unfold(framer, |mut framer| async move {
        framer.next_line().await.map(|line| (line, framer))
    })
}

impl LineFramer {
    async fn next_line(&mut self) -> Option<anyhow::Result<String>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => split_frames(&mut self.partial, &chunk, &mut self.pending),
                Some(Err(error)) => {
                    self.done = true;
                    return Some(Err(anyhow::Error::new(error).context("stream read failed")));
                }
                None => {
                    self.done = true;
                    if !self.partial.is_empty() {
                        let tail = String::from_utf8_lossy(&self.partial)
                            .trim_end_matches('\r')
                            .to_string();
                        self.partial.clear();
                        self.pending.push_back(tail);
                    }
                }
            }
        }
    }
}

fn split_frames(partial: &mut Vec<u8>, chunk: &[u8], lines: &mut VecDeque<String>) {
    for byte in chunk {
        if *byte == b'\n' {
            lines.push_back(
                String::from_utf8_lossy(partial)
                    .trim_end_matches('\r')
                    .to_string(),
            );
            partial.clear();
        } else {
            partial.push(*byte);
        }
    }
}

impl GameSession {
    fn start<S>(game_id: String, lines: S) -> Self
    where
        S: Stream<Item = anyhow::Result<String>> + Send + 'static,
    {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let full_game = Arc::new(Mutex::new(None));
        let demux = tokio::spawn(demux_game_stream(
            game_id,
            lines,
            Arc::clone(&full_game),
            state_tx,
            chat_tx,
        ));

        Self {
            full_game,
            state_rx,
            chat_rx,
            demux: Some(demux),
            outcome: None,
        }
    }

    /// Next state snapshot, in stream order. Buffered snapshots are drained
    /// even after the stream has died; once the queue is empty a dead stream
    /// surfaces as an error instead of a hang.
    async fn receive_state(&mut self) -> Result<GameStateEvent, StreamError> {
        match self.state_rx.recv().await {
            Some(state) => Ok(state),
            None => Err(self.demux_outcome().await),
        }
    }

    /// Next chat message, in stream order.
    async fn receive_chat(&mut self) -> Result<ChatLineEvent, StreamError> {
        match self.chat_rx.recv().await {
            Some(chat) => Ok(chat),
            None => Err(self.demux_outcome().await),
        }
    }

    async fn latest_full_game(&self) -> Option<GameFull> {
        self.full_game.lock().await.clone()
    }

    async fn demux_outcome(&mut self) -> StreamError {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        let outcome = match self.demux.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => StreamError::Closed,
                Ok(Err(error)) => StreamError::Failed(format!("{error:#}")),
                Err(join_error) if join_error.is_cancelled() => StreamError::Closed,
                Err(join_error) => StreamError::Failed(join_error.to_string()),
            },
            None => StreamError::Closed,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.demux {
            handle.abort();
        }
    }
}

async fn demux_game_stream<S>(
    game_id: String,
    lines: S,
    full_game: Arc<Mutex<Option<GameFull>>>,
    state_tx: mpsc::UnboundedSender<GameStateEvent>,
    chat_tx: mpsc::UnboundedSender<ChatLineEvent>,
) -> anyhow::Result<()>
where
    S: Stream<Item = anyhow::Result<String>>,
{
    tokio::pin!(lines);
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<GameEvent>(&line) {
            Ok(event) => event,
            Err(error) => {
                warn!(game_id = %game_id, error = %error, "skipping a malformed game event line");
                continue;
            }
        };

        match event {
            GameEvent::GameFull(full) => {
                debug!(game_id = %game_id, initial_fen = %full.initial_fen, "full game received");
                let state = full.state.clone();
                *full_game.lock().await = Some(full);
                if state_tx.send(state).is_err() {
                    break;
                }
            }
            GameEvent::GameState(state) => {
                if let Some(full) = full_game.lock().await.as_mut() {
                    full.state = state.clone();
                }
                if state_tx.send(state).is_err() {
                    break;
                }
            }
            GameEvent::ChatLine(chat) => {
                if chat_tx.send(chat).is_err() {
                    break;
                }
            }
            GameEvent::Unknown => {}
        }
    }
    Ok(())
}

fn engine_request_line(state: &GameStateEvent) -> String {
    format!(
        "{} {} {} {}",
        state.wtime,
        state.btime,
        state.move_count(),
        state.moves
    )
}

/// Ask the engine for one move. The engine is spawned fresh per call, fed a
/// single request line on stdin, and always reaped before this returns. A
/// non-zero exit means "no candidate".
async fn run_engine(engine_path: &str, state: &GameStateEvent) -> anyhow::Result<Option<String>> {
    let mut child = Command::new(engine_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn the engine process")?;

    let request = engine_request_line(state);
    if let Some(mut stdin) = child.stdin.take() {
        // The exit status below is the failure signal, a dead stdin is not.
        if let Err(error) = stdin.write_all(request.as_bytes()).await {
            debug!(error = %error, "engine stopped reading its request");
        }
        let _ = stdin.write_all(b"\n").await;
    }

    let output = child
        .wait_with_output()
        .await
        .context("failed to collect the engine output")?;
    if !output.status.success() {
        error!(
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "engine exited with a failure status"
        );
        return Ok(None);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let candidate = stdout.lines().next().unwrap_or("").trim().to_string();
    if candidate.is_empty() {
        warn!("engine exited cleanly but produced no move");
        return Ok(None);
    }
    Ok(Some(candidate))
}

fn fresh_chat_key(previous: Option<&str>) -> String {
    loop {
        let bytes: [u8; CHAT_KEY_BYTES] = rand::rng().random();
        let key: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
        if previous != Some(key.as_str()) {
            return key;
        }
    }
}

fn parse_keyed_move(key: &str, text: &str) -> Option<String> {
    let candidate = text.strip_prefix(key)?.trim();
    if candidate.is_empty() {
        return None;
    }
    Some(candidate.to_string())
}

/// Human-intervention protocol, entered when no automated move was accepted.
/// A keyed chat reply names the move to play; every rejected attempt
/// invalidates the key and issues a fresh one. There is no timeout, the loop
/// runs until a move is accepted or the game worker is cancelled.
async fn await_human_move(
    api: &LichessApi,
    session: &mut GameSession,
    game_id: &str,
) -> anyhow::Result<()> {
    let mut key = fresh_chat_key(None);
    error!(game_id = %game_id, key = %key, "no playable engine move; waiting for human intervention");
    api.send_chat(
        game_id,
        &format!("The engine move was rejected. Reply with '{key} <move>' to play for it."),
    )
    .await?;

    loop {
        let message = session.receive_chat().await?;
        let Some(candidate) = parse_keyed_move(&key, &message.text) else {
            continue;
        };

        debug!(
            game_id = %game_id,
            candidate = %candidate,
            from = %message.username,
            "submitting a human move"
        );
        if api.make_move(game_id, &candidate).await? {
            info!(game_id = %game_id, candidate = %candidate, "human move accepted");
            return Ok(());
        }

        key = fresh_chat_key(Some(&key));
        error!(game_id = %game_id, key = %key, "human move rejected; issued a fresh key");
        api.send_chat(
            game_id,
            &format!("That move was rejected too. Reply with '{key} <move>' to try again."),
        )
        .await?;
    }
}

/// Per-game control loop: wait for our turn, ask the engine, submit, recover
/// through human intervention when the submission is rejected. Runs until the
/// dispatcher cancels it or the game stream dies.
async fn run_game_loop(
    api: LichessApi,
    engine_path: String,
    game_id: String,
    color: PieceColor,
) -> anyhow::Result<()> {
    let mut session = api.open_game(&game_id).await?;
    info!(game_id = %game_id, color = ?color, "game session opened");

    let mut announced = false;
    loop {
        let state = session.receive_state().await?;
        if !announced {
            if let Some(full) = session.latest_full_game().await {
                info!(
                    game_id = %game_id,
                    initial_fen = %full.initial_fen,
                    created_at = %full.created_at,
                    "playing from the received position"
                );
            }
            announced = true;
        }

        if state.on_turn() != color {
            debug!(game_id = %game_id, moves = state.move_count(), "opponent to move; waiting");
            continue;
        }

        debug!(
            game_id = %game_id,
            moves = state.move_count(),
            wtime = state.wtime,
            btime = state.btime,
            "on turn; consulting the engine"
        );
        let candidate = match run_engine(&engine_path, &state).await {
            Ok(candidate) => candidate,
            Err(error) => {
                let detail = format!("{error:#}");
                error!(game_id = %game_id, error = %detail, "engine invocation failed");
                None
            }
        };

        let accepted = match candidate {
            Some(candidate) => {
                debug!(game_id = %game_id, candidate = %candidate, "submitting the engine move");
                api.make_move(&game_id, &candidate).await?
            }
            None => false,
        };

        if !accepted {
            await_human_move(&api, &mut session, &game_id).await?;
        }
    }
}

impl GameRegistry {
    fn is_active(&self, game_id: &str) -> bool {
        self.workers
            .get(game_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    fn insert(&mut self, game_id: String, handle: JoinHandle<()>) {
        if let Some(stale) = self.workers.insert(game_id, handle) {
            stale.abort();
        }
    }

    fn cancel(&mut self, game_id: &str) -> bool {
        match self.workers.remove(game_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn shutdown(&mut self) {
        for (_, handle) in self.workers.drain() {
            handle.abort();
        }
    }

    fn len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for GameRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_game_worker(
    api: LichessApi,
    engine_path: String,
    game_id: String,
    color: PieceColor,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = run_game_loop(api, engine_path, game_id.clone(), color).await {
            let detail = format!("{error:#}");
            warn!(game_id = %game_id, error = %detail, "game worker stopped with error");
        }
    })
}

fn handle_notification(
    registry: &mut GameRegistry,
    api: &LichessApi,
    engine_path: &str,
    event: NotificationEvent,
) {
    match event {
        NotificationEvent::GameStart { game } => {
            if registry.is_active(&game.game_id) {
                debug!(game_id = %game.game_id, "game-start for a game already handled; ignoring");
                return;
            }
            info!(game_id = %game.game_id, color = ?game.color, "starting a game worker");
            let handle = spawn_game_worker(
                api.clone(),
                engine_path.to_string(),
                game.game_id.clone(),
                game.color,
            );
            registry.insert(game.game_id, handle);
        }
        NotificationEvent::GameFinish { game } => {
            let won = game.winner.is_some_and(|winner| winner == game.color);
            if registry.cancel(&game.game_id) {
                info!(game_id = %game.game_id, won, "game finished; worker cancelled");
            } else {
                debug!(game_id = %game.game_id, "game-finish for an untracked game; ignoring");
            }
        }
        NotificationEvent::Challenge { challenge } => {
            info!(
                challenge_id = %challenge.id,
                challenger = %challenge.challenger.name,
                "challenge received; not handled automatically"
            );
        }
        NotificationEvent::Unknown => {}
    }
}

/// Consume the account event stream and keep the per-game worker registry in
/// sync with it. A dead account stream is fatal: without notifications no new
/// or finished games can be observed.
async fn run_dispatcher(api: &LichessApi, engine_path: &str) -> anyhow::Result<()> {
    let mut registry = GameRegistry::default();

    match api.ongoing_games().await {
        Ok(games) => {
            for game in games {
                info!(game_id = %game.game_id, color = ?game.color, "resuming a game already in progress");
                let handle = spawn_game_worker(
                    api.clone(),
                    engine_path.to_string(),
                    game.game_id.clone(),
                    game.color,
                );
                registry.insert(game.game_id, handle);
            }
        }
        Err(error) => {
            let detail = format!("{error:#}");
            warn!(error = %detail, "could not list ongoing games; starting without resume");
        }
    }

    let events = api.stream_events().await?;
    tokio::pin!(events);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break Ok(());
            }
            line = events.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(error)) => break Err(error.context("account event stream failed")),
            None => break Err(anyhow::anyhow!("account event stream ended unexpectedly")),
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<NotificationEvent>(&line) {
            Ok(event) => handle_notification(&mut registry, api, engine_path, event),
            Err(error) => warn!(error = %error, "skipping a malformed notification line"),
        }
    };

    info!(active_games = registry.len(), "cancelling all game workers");
    registry.shutdown();
    outcome
}
