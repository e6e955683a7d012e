use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;

use midibridge::config::Config;
use midibridge::discovery::NullDiscovery;
use midibridge::event;
use midibridge::port::midir_backend::MidirBackend;
use midibridge::router::Daemon;
use midibridge::session::loopback::LoopbackBackend;

#[derive(Parser)]
#[command(
    name = "midibridged",
    about = "RTP-MIDI bridging daemon: local virtual MIDI ports routed to and from network peers"
)]
struct Args {
    /// Announced daemon name
    #[arg(long, short, default_value = "midibridge")]
    name: String,

    /// UDP service to accept inbound sessions on (repeatable)
    #[arg(long = "port", short)]
    ports: Vec<String>,

    /// Remote to connect to: name, name:host, or name:host:service
    /// (repeatable; host may be a bracketed IPv6 literal)
    #[arg(long = "connect", short)]
    connect_to: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = Config::new(&args.name);
    config.ports = args.ports;
    config.connect_to = args.connect_to;

    let (events, inbox) = event::channel();
    let midi = MidirBackend::new(&config.name, events.clone());

    let mut daemon = match Daemon::new(
        &config,
        Box::new(midi),
        Box::new(LoopbackBackend::new()),
        Box::new(NullDiscovery),
        events,
        inbox,
    ) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("Failed to start daemon: {e}");
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    println!("{} running — press Enter to stop", args.name);
    {
        let running = running.clone();
        thread::spawn(move || {
            let mut input = String::new();
            let _ = io::stdin().read_line(&mut input);
            running.store(false, Ordering::SeqCst);
        });
    }

    daemon.run(running);
}
