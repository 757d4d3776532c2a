use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use zonecast::config::AppConfig;
use zonecast::controller::Controller;
use zonecast::playback::{Backend, PlaybackEngine};
use zonecast::rehydrate;
use zonecast::scheduler;
use zonecast::store::{JsonStore, ScheduleDoc, ScheduleStatus, Store};
use zonecast::task::Repeat;
use zonecast::tts::TtsEngine;
use zonecast::zones::{Target, ZoneMap, ALL_ZONES};

#[derive(Parser)]
#[command(name = "zonecast", about = "Zoned PA broadcast controller")]
struct Cli {
    /// Path to the appliance config file
    #[arg(short, long, default_value = "zonecast_config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broadcast controller and scheduler
    Serve,
    /// Print the published system state
    Status,
    /// Zone configuration
    Zones {
        #[command(subcommand)]
        action: ZonesCmd,
    },
    /// Speak a one-shot announcement and exit
    Say {
        /// Text to synthesize
        text: String,
        /// Voice alias or model stem
        #[arg(short, long, default_value = "female")]
        voice: String,
        /// Target zones (default: all)
        #[arg(short, long)]
        zones: Vec<String>,
        /// Skip the intro chime
        #[arg(long)]
        no_chime: bool,
    },
    /// Scheduled announcement management
    Schedule {
        #[command(subcommand)]
        action: ScheduleCmd,
    },
    /// List discovered TTS voices
    Voices,
}

#[derive(Subcommand)]
enum ZonesCmd {
    /// List configured zones and their targets
    List,
    /// Show which targets a zone request resolves to
    Resolve {
        /// Zone names to resolve
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ScheduleCmd {
    /// List pending schedules
    List,
    /// Add a schedule
    Add {
        /// Firing date, YYYY-MM-DD
        date: String,
        /// Firing time, HH:MM
        time: String,
        /// Announcement text
        message: String,
        #[arg(short, long, default_value = "female")]
        voice: String,
        #[arg(short, long)]
        zones: Vec<String>,
        /// once, daily or weekly
        #[arg(short, long, default_value = "once")]
        repeat: String,
        #[arg(short, long, default_value = "Admin")]
        user: String,
    },
    /// Remove a schedule by id
    Remove { id: String },
}

fn main() {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config);

    let result = match cli.command {
        Commands::Serve => cmd_serve(config),
        Commands::Status => cmd_status(config),
        Commands::Zones { action } => cmd_zones(config, action),
        Commands::Say {
            text,
            voice,
            zones,
            no_chime,
        } => cmd_say(config, &text, &voice, zones, no_chime),
        Commands::Schedule { action } => cmd_schedule(config, action),
        Commands::Voices => cmd_voices(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_zone_map(config: &AppConfig) -> ZoneMap {
    let fallback = Target::stereo(config.fallback_device);
    match ZoneMap::load(&config.zone_config, fallback) {
        Ok(map) => map,
        Err(e) => {
            eprintln!("Warning: {} — every request will use the fallback device", e);
            ZoneMap::empty(fallback)
        }
    }
}

fn build_engine(config: &AppConfig) -> Result<PlaybackEngine, String> {
    let backend = Backend::from_str_loose(&config.backend)?;
    Ok(PlaybackEngine::new(backend, load_zone_map(config)))
}

fn cmd_serve(config: AppConfig) -> Result<(), String> {
    let engine = build_engine(&config)?;
    let tts = TtsEngine::new(&config.tts_dir);
    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&config.store_dir)?);

    let controller = Controller::new(config, engine, tts, store);
    rehydrate::rehydrate_queue(&controller);
    let _scheduler = scheduler::spawn_scheduler(controller);

    println!("zonecast serving; press Ctrl-C to stop");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}

fn cmd_status(config: AppConfig) -> Result<(), String> {
    let store = JsonStore::open(&config.store_dir)?;
    match store.load_state()? {
        Some(state) => {
            println!("Mode:      {}", state.mode);
            println!("Priority:  {}", state.priority);
            println!("Timestamp: {}", state.timestamp);
            match state.active_task {
                Some(task) => {
                    println!("Active:    {} ({})", task.id, task.task_type);
                    println!("Owner:     {}", task.data.user);
                    println!("Zones:     {}", task.data.zones.join(", "));
                }
                None => println!("Active:    none"),
            }
        }
        None => println!("No state published yet — is the service running?"),
    }
    Ok(())
}

fn cmd_zones(config: AppConfig, action: ZonesCmd) -> Result<(), String> {
    let map = load_zone_map(&config);
    match action {
        ZonesCmd::List => {
            for name in map.zone_names() {
                let targets = map.resolve(&[name.to_string()]);
                let rendered: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
                println!("{:<20} -> {}", name, rendered.join(", "));
            }
        }
        ZonesCmd::Resolve { names } => {
            for target in map.resolve(&names) {
                println!("{}", target);
            }
        }
    }
    Ok(())
}

fn cmd_say(
    config: AppConfig,
    text: &str,
    voice: &str,
    zones: Vec<String>,
    no_chime: bool,
) -> Result<(), String> {
    let engine = build_engine(&config)?;
    let tts = TtsEngine::new(&config.tts_dir);
    let zones = if zones.is_empty() {
        vec![ALL_ZONES.to_string()]
    } else {
        zones
    };

    let chime = config.chime_path();
    let intro = if no_chime { None } else { Some(chime.as_path()) };
    match tts.synthesize_with_fallback(text, voice) {
        Some(wav) => engine.play_announcement(intro, Some(&wav), &zones),
        None => {
            eprintln!("Synthesis failed; falling back to system speech");
            engine.speak_espeak(text);
        }
    }
    engine.stop();
    Ok(())
}

fn cmd_schedule(config: AppConfig, action: ScheduleCmd) -> Result<(), String> {
    let store = JsonStore::open(&config.store_dir)?;
    match action {
        ScheduleCmd::List => {
            let mut pending = store.pending_schedules()?;
            pending.sort_by(|a, b| (&a.1.date, &a.1.time).cmp(&(&b.1.date, &b.1.time)));
            if pending.is_empty() {
                println!("No pending schedules.");
            }
            for (id, doc) in pending {
                println!(
                    "{}  {} {}  [{}]  {}",
                    id,
                    doc.date,
                    doc.time,
                    doc.repeat,
                    doc.message.as_deref().unwrap_or("(recorded audio)")
                );
            }
        }
        ScheduleCmd::Add {
            date,
            time,
            message,
            voice,
            zones,
            repeat,
            user,
        } => {
            // Validate before persisting
            rehydrate::parse_schedule_time(&date, &time)?;
            let doc = ScheduleDoc {
                date,
                time,
                message: Some(message),
                audio: None,
                voice: Some(voice),
                zones,
                repeat: Repeat::from_str_loose(&repeat),
                status: ScheduleStatus::Pending,
                user,
            };
            let id = store.add_schedule(&doc)?;
            println!("Schedule added: {} ({} {})", id, doc.date, doc.time);
            println!("The running service picks it up on its next restart or rehydration.");
        }
        ScheduleCmd::Remove { id } => {
            store.delete_schedule(&id)?;
            println!("Schedule {} removed.", id);
        }
    }
    Ok(())
}

fn cmd_voices(config: AppConfig) -> Result<(), String> {
    let tts = TtsEngine::new(&config.tts_dir);
    let keys = tts.voice_keys();
    if keys.is_empty() {
        println!("No voices found under '{}'.", config.tts_dir.display());
    }
    for key in keys {
        println!("{}", key);
    }
    Ok(())
}
