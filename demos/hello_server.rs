//! Minimal publishing server: creates a `hello` topic, publishes numbered
//! greeting strings at a fixed rate, and answers `reset` on the control
//! pipe.
//!
//! Try it with a shell as the client:
//!
//! ```text
//! cargo run --example hello_server
//! cat /run/mpa/hello/info
//! echo -n me > /run/mpa/hello/request && cat /run/mpa/hello/me0
//! echo -n reset > /run/mpa/hello/control
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use pipebus::{PipeServer, ServerFlags, TopicInfo};

#[derive(Parser)]
#[command(version, about = "hello-world pipe server")]
struct Args {
    /// Topic name or full location
    #[clap(long, default_value = "hello")]
    topic: String,

    /// Publish frequency in Hz
    #[clap(short, long, default_value_t = 2.0)]
    frequency: f64,
}

fn main() -> Result<(), pipebus::Error> {
    env_logger::init();
    let args = Args::parse();

    let server = Arc::new(PipeServer::new());
    let channel = server.next_available_channel()?;

    let mut info = TopicInfo::new(args.topic.clone());
    info.type_tag = "text".to_string();
    info.server_name = "hello-server".to_string();

    let counter = Arc::new(AtomicU64::new(0));

    server.set_connect_callback(channel, |ch, client, name| {
        println!("channel {ch}: client {name} connected (id {client})");
    })?;
    server.set_disconnect_callback(channel, |ch, client, name| {
        println!("channel {ch}: client {name} disconnected (id {client})");
    })?;
    let control_counter = Arc::clone(&counter);
    server.set_control_callback(channel, move |ch, bytes| {
        let command = String::from_utf8_lossy(bytes);
        let command = command.trim_end_matches('\0');
        match command {
            "reset" => {
                control_counter.store(0, Ordering::Relaxed);
                println!("channel {ch}: counter reset");
            }
            other => println!("channel {ch}: unknown command {other:?}"),
        }
    })?;

    server.create(channel, info, ServerFlags::CONTROL_PIPE)?;
    server.set_available_control_commands(channel, "reset")?;
    println!("serving topic {:?} on channel {channel}", args.topic);

    let period = Duration::from_secs_f64(1.0 / args.frequency.max(0.1));
    loop {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        server.write_string(channel, &format!("hello{n}"))?;
        thread::sleep(period);
    }
}
