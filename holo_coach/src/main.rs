use anyhow::Context;
use clap::Parser;
use console::{Key, Term};
use holo_link::config::{load_host_file, DEFAULT_BIND_ADDR};
use holo_link::{ActionCommand, LinkNode, NodeCommand, Registry, StepResult, Vec3};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Offset applied to the ice animation on the headset
const ICE_OFFSET_TAG: &str = "ICEOffset";

/// holo_coach - PC side of a coach/trainee link
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (overrides the host file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// File holding the `ip:port` to listen on
    #[arg(long, default_value = "host.ip")]
    host_file: PathBuf,

    /// JSON file describing the synchronized objects
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// User name
    #[arg(short, long)]
    name: Option<String>,

    /// Make the PC the transform authority for new sessions
    #[arg(short, long)]
    server_to_client: bool,

    /// Object-camera-hand angle threshold sent with `u`
    #[arg(short, long, default_value_t = 20.0)]
    threshold: f32,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let bind = match args.bind {
        Some(addr) => addr,
        None => load_host_file(&args.host_file, DEFAULT_BIND_ADDR.parse()?),
    };
    let registry = match &args.registry {
        Some(path) => Registry::load(path)
            .with_context(|| format!("Failed to load registry {}", path.display()))?,
        None => Registry::new(),
    };

    let mut node_builder = LinkNode::listen(bind)
        .server_to_client(args.server_to_client)
        .registry(registry);
    if let Some(name) = args.name.clone() {
        node_builder = node_builder.user_name(name);
    }
    let mut node = node_builder.await?;

    println!("=== holo_coach ===");
    println!("User: {}", node.identity());
    println!("Objects: {}", node.registry().len());
    println!("Controls:");
    println!("  0-7 - Select object for capture");
    println!("  c - Capture selected object");
    println!("  s - Start tutoring");
    println!("  h/p - Stream headset to PC / PC to headset");
    println!("  d - Send ice offset");
    println!("  u - Send threshold ({})", args.threshold);
    println!("  a - Switch all objects");
    println!("  m - Toggle inbound transforms");
    println!("  q - Quit remote app and exit");
    println!("  x - Exit");
    println!();

    let node_sender = node.sender();

    // Spawn keyboard input task
    let keyboard_sender = node_sender.clone();
    let threshold = args.threshold;
    let keyboard_task = tokio::task::spawn_blocking(move || {
        let input_term = Term::stdout();
        let mut object_id = 0;
        let mut inbound = true;
        loop {
            let Ok(key) = input_term.read_key() else {
                continue;
            };
            let command = match key {
                Key::Char(c @ '0'..='7') => {
                    object_id = c.to_digit(10).map_or(0, |d| d as i32);
                    println!("→ Object {} selected", object_id);
                    None
                }
                Key::Char('c') => Some(NodeCommand::SendAction(ActionCommand::Capture(object_id))),
                Key::Char('s') => Some(NodeCommand::SendAction(ActionCommand::Start)),
                Key::Char('h') => Some(NodeCommand::SendAction(ActionCommand::HeadsetToPc)),
                Key::Char('p') => Some(NodeCommand::SendAction(ActionCommand::PcToHeadset)),
                Key::Char('u') => Some(NodeCommand::SendAction(ActionCommand::Threshold(threshold))),
                Key::Char('a') => Some(NodeCommand::SendAction(ActionCommand::SwitchAll)),
                Key::Char('d') => Some(NodeCommand::SendData {
                    tag: ICE_OFFSET_TAG.to_string(),
                    value: Vec3::new(-0.01, -0.05, 0.05),
                }),
                Key::Char('m') => {
                    inbound = !inbound;
                    println!("→ Inbound transforms {}", if inbound { "on" } else { "muted" });
                    Some(NodeCommand::SetStreaming(inbound))
                }
                Key::Char('q') => {
                    println!("→ Quit requested");
                    let _ = keyboard_sender.send(NodeCommand::SendAction(ActionCommand::QuitApp));
                    let _ = keyboard_sender.send(NodeCommand::Stop);
                    break;
                }
                Key::Char('x') | Key::Escape => {
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

    // Main step loop
    loop {
        match node.step().await? {
            StepResult::Stop => {
                println!("Node stopped");
                break;
            }
            StepResult::Event(event) => println!("{}", event),
            StepResult::Timeout => {
                println!("{}", node.node_state());
                for (id, session) in node.sessions() {
                    println!("  {} {}", id, session);
                }
                println!("{}", node.stats());
            }
        }
    }

    node.flushed().await;
    keyboard_task.abort();
    let _ = keyboard_task.await;

    Ok(())
}
