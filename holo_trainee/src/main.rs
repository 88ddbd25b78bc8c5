use anyhow::Context;
use clap::Parser;
use console::{Key, Term};
use holo_link::config::{load_host_file, DEFAULT_SERVER_ADDR};
use holo_link::{
    Entity, LinkNode, NodeCommand, Registry, Role, StepResult, SyncDirection, Transform, Vec3,
};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// holo_trainee - headset side of a coach/trainee link
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address (overrides the host file)
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// File holding the server `ip:port`
    #[arg(long, default_value = "host.ip")]
    host_file: PathBuf,

    /// JSON file describing the synchronized objects
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// User id
    #[arg(short, long, default_value_t = 1)]
    id: i32,

    /// User name
    #[arg(short, long)]
    name: Option<String>,
}

/// Objects used when no registry file is given
fn demo_registry() -> holo_link::Result<Registry> {
    Registry::from_entities([
        Entity::new(0, "BigCup"),
        Entity::new(1, "Shaker"),
        Entity::new(2, "Lime"),
    ])
}

/// Nudge a pose as if a hand was moving it
fn jitter(transform: &Transform, rng: &mut impl Rng) -> Transform {
    let mut step = || rng.random_range(-0.005..0.005);
    Transform {
        position: Vec3::new(
            transform.position.x + step(),
            transform.position.y + step(),
            transform.position.z + step(),
        ),
        rotation: Vec3::new(
            transform.rotation.x,
            (transform.rotation.y + 1.0) % 360.0,
            transform.rotation.z,
        ),
        scale: transform.scale,
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let server = match args.server {
        Some(addr) => addr,
        None => load_host_file(&args.host_file, DEFAULT_SERVER_ADDR.parse()?),
    };
    let registry = match &args.registry {
        Some(path) => Registry::load(path)
            .with_context(|| format!("Failed to load registry {}", path.display()))?,
        None => demo_registry()?,
    };

    let mut node_builder = LinkNode::connect(server)
        .user_id(args.id)
        .registry(registry)
        .step_timeout_ms(100);
    if let Some(name) = args.name.clone() {
        node_builder = node_builder.user_name(name);
    }
    let mut node = node_builder.await?;

    println!("=== holo_trainee ===");
    println!("User: {}", node.identity());
    println!("Server: {}", server);
    println!("Controls:");
    println!("  c/t - Log in as coach / trainee");
    println!("  1/2 - Stream headset to PC / PC to headset");
    println!("  Space - Toggle streaming");
    println!("  q - Quit");
    println!();

    let node_sender = node.sender();

    // Spawn keyboard input task
    let keyboard_sender = node_sender.clone();
    let keyboard_task = tokio::task::spawn_blocking(move || {
        let input_term = Term::stdout();
        let mut streaming = true;
        loop {
            let Ok(key) = input_term.read_key() else {
                continue;
            };
            let command = match key {
                Key::Char('c') => Some(NodeCommand::LoginAs(Role::Coach)),
                Key::Char('t') => Some(NodeCommand::LoginAs(Role::Trainee)),
                Key::Char('1') => Some(NodeCommand::RequestDirection(SyncDirection::ClientToServer)),
                Key::Char('2') => Some(NodeCommand::RequestDirection(SyncDirection::ServerToClient)),
                Key::Char(' ') => {
                    streaming = !streaming;
                    println!("→ Streaming {}", if streaming { "resumed" } else { "paused" });
                    Some(NodeCommand::SetStreaming(streaming))
                }
                Key::Char('q') | Key::Escape => {
                    println!("→ Quit requested");
                    let _ = keyboard_sender.send(NodeCommand::Stop);
                    break;
                }
                _ => None,
            };

            if let Some(command) = command {
                if keyboard_sender.send(command).is_err() {
                    break;
                }
            }
        }
    });

    let mut rng = rand::rng();
    let mut last_status = Instant::now();
    let status_interval = Duration::from_secs(5);
    let mut last_move = Instant::now();
    let move_interval = Duration::from_millis(100);

    // Main step loop
    loop {
        match node.step().await? {
            StepResult::Stop => {
                println!("Node stopped");
                break;
            }
            StepResult::Event(event) => println!("{}", event),
            StepResult::Timeout => {}
        }

        if node.is_transmitting() && last_move.elapsed() >= move_interval {
            last_move = Instant::now();
            for entity in node.registry().iter() {
                let transform = jitter(&entity.transform, &mut rng);
                node_sender.send(NodeCommand::UpdateTransform {
                    id: entity.id,
                    transform,
                })?;
            }
        }

        if last_status.elapsed() >= status_interval {
            println!("{}", node.node_state());
            println!("{}", node.stats());
            last_status = Instant::now();
        }
    }

    node.flushed().await;
    keyboard_task.abort();
    let _ = keyboard_task.await;

    Ok(())
}
