//! Manual test harness: drives a single in-process `GameEngine` from a
//! terminal loop. Not a server -- there is no HTTP layer here, just a REPL
//! over `process_player_action` for exercising the engine by hand.

use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use labyrinthia_engine::config::EngineConfig;
use labyrinthia_engine::llm_client::{LlmClient, NullLlmClient};
use labyrinthia_engine::map_provider::LocalMapProvider;
use labyrinthia_engine::model::entity::{
    Abilities, AcComponents, CombatRuntime, Entity, EntityCore, PlayerEntity, Position, Stats,
};
use labyrinthia_engine::model::state::GameState;
use labyrinthia_engine::save_store::SaveStore;
use labyrinthia_engine::GameEngine;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "labyrinthia_cli")]
#[command(about = "Manual REPL harness for the labyrinthia game engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a brand-new game and drop into the action REPL
    New {
        /// User id the save/session is registered under
        #[arg(short, long, default_value = "local")]
        user: String,
        /// Hero name
        #[arg(short, long, default_value = "Hero")]
        name: String,
    },
    /// Resume a previously saved game and drop into the action REPL
    Resume {
        /// User id the save was written under
        #[arg(short, long, default_value = "local")]
        user: String,
        /// Save id, as shown by `list`
        save: String,
    },
    /// List saves for a user
    List {
        #[arg(short, long, default_value = "local")]
        user: String,
    },
}

fn new_player(name: &str) -> Entity {
    Entity::Player(PlayerEntity {
        core: EntityCore {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            class: "adventurer".to_string(),
            creature_type: "humanoid".to_string(),
            abilities: Abilities::default(),
            stats: Stats {
                ac_components: AcComponents { base: 10, ..Default::default() },
                ..Default::default()
            },
            combat_runtime: CombatRuntime::default(),
            resistances: HashMap::new(),
            vulnerabilities: HashMap::new(),
            immunities: HashSet::new(),
            equipped_items: HashMap::new(),
            inventory: Vec::new(),
            position: Position { x: 1, y: 1 },
            saving_throw_proficiencies: HashSet::new(),
            skill_proficiencies: HashSet::new(),
            proficiency_bonus: 2,
        },
    })
}

fn new_game_state(name: &str) -> GameState {
    let (map, _monster_hints) = LocalMapProvider.generate_map(20, 20, 1, "normal", None, 10, false);
    let now = chrono::Utc::now();
    GameState {
        id: uuid::Uuid::new_v4().to_string(),
        player: new_player(name),
        current_map: map,
        monsters: Vec::new(),
        quests: Vec::new(),
        turn_count: 0,
        game_time: 0,
        created_at: now,
        last_saved: now,
        is_game_over: false,
        game_over_reason: None,
        pending_events: Vec::new(),
        pending_effects: Vec::new(),
        pending_choice_context: None,
        pending_quest_completion: None,
        pending_new_quest_generation: false,
        pending_map_transition: None,
        undo_tokens: Vec::new(),
        combat_rules: Default::default(),
        combat_rule_version: 1,
        combat_authority_mode: Default::default(),
        combat_snapshot: None,
        generation_metrics: Default::default(),
        migration_history: Vec::new(),
    }
}

/// Parses `action key=value key2=value2 ...` into `(action, params)`. Values
/// that parse as JSON (numbers, booleans, quoted strings) are kept typed;
/// everything else is taken as a bare string.
fn parse_command(line: &str) -> Option<(String, Value)> {
    let mut tokens = line.split_whitespace();
    let action = tokens.next()?.to_string();
    let mut params = serde_json::Map::new();
    for token in tokens {
        let Some((key, raw)) = token.split_once('=') else { continue };
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Some((action, Value::Object(params)))
}

async fn repl(engine: Arc<GameEngine>, user_id: String, game_id: String) {
    println!("type an action (move x=1 y=2 / attack target_id=... / rest / quit)");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let Some(Ok(line)) = lines.next() else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        let Some((action, params)) = parse_command(line) else { continue };
        let result = engine.process_player_action(&user_id, &game_id, &action, params, None).await;
        match serde_json::to_string_pretty(&result) {
            Ok(pretty) => println!("{pretty}"),
            Err(e) => eprintln!("failed to render result: {e}"),
        }
    }
    if let Err(e) = engine.close_game(&user_id, &game_id).await {
        eprintln!("close_game failed: {e}");
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let config = EngineConfig::default();
    let llm_client: Arc<dyn LlmClient> = Arc::new(NullLlmClient);

    match cli.command {
        Commands::New { user, name } => {
            let engine = GameEngine::new(config, llm_client);
            engine.spawn_session_cleanup();
            let state = new_game_state(&name);
            let game_id = state.id.clone();
            println!("new game {game_id} for {user}");
            engine.register_game(&user, &game_id, state).await;
            repl(engine, user, game_id).await;
        }
        Commands::Resume { user, save } => {
            let save_store = SaveStore::new(config.storage.saves_dir.clone());
            let state = match save_store.load_game(&user, &save).await {
                Ok(state) => state,
                Err(e) => {
                    eprintln!("failed to load save {save} for {user}: {e}");
                    return;
                }
            };
            let game_id = state.id.clone();
            let engine = GameEngine::new(config, llm_client);
            engine.spawn_session_cleanup();
            engine.register_game(&user, &game_id, state).await;
            repl(engine, user, game_id).await;
        }
        Commands::List { user } => {
            let save_store = SaveStore::new(config.storage.saves_dir.clone());
            match save_store.list_saves(&user).await {
                Ok(saves) => {
                    for save in saves {
                        println!(
                            "{}  {} (lvl {})  turn {}  {}",
                            save.id, save.player_name, save.player_level, save.turn_count, save.map_name
                        );
                    }
                }
                Err(e) => eprintln!("failed to list saves for {user}: {e}"),
            }
        }
    }
}
