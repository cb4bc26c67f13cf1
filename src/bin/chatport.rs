//! Host-side runner playing the part of the legacy program.
//!
//! The prompt comes from the command line. The engine polls on its own
//! thread while the main thread drives the ports byte by byte, the way a
//! program on the emulated machine would.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chatport::{ports, ChatRequest, Config, PortBus, Status};

#[macro_use]
extern crate log;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

fn main() -> ExitCode {
    pretty_env_logger::init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.is_empty() {
        eprintln!("usage: chatport <prompt>");
        return ExitCode::FAILURE;
    }

    let model = std::env::var("CHATPORT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

    match run(&model, &prompt) {
        Ok(Status::Eof) => ExitCode::SUCCESS,
        Ok(status) => {
            eprintln!("request ended with {:?}", status);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(model: &str, prompt: &str) -> Result<Status, Box<dyn std::error::Error>> {
    let config = Config::from_env();
    let body = ChatRequest::new(model).user(prompt).to_body()?;

    if body.len() > usize::from(config.max_content_length) {
        return Err(chatport::Error::ContentLengthTooLarge(
            body.len() as u32,
            config.max_content_length,
        )
        .into());
    }

    let (bridge, mut engine) = chatport::init_tls(config)?;

    let running = Arc::new(AtomicBool::new(true));
    let network = {
        let running = running.clone();
        thread::Builder::new()
            .name("chatport-net".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    engine.poll();
                    if engine.is_idle() {
                        thread::sleep(POLL_INTERVAL);
                    } else {
                        thread::yield_now();
                    }
                }
                if let Some(e) = engine.last_error() {
                    warn!("Last error: {}", e);
                }
            })?
    };

    let mut bus = PortBus::new();
    bus.attach(bridge);

    let status = converse(&mut bus, &body);

    running.store(false, Ordering::Relaxed);
    if network.join().is_err() {
        error!("Network thread panicked");
    }

    Ok(status)
}

/// The port conversation for one request.
fn converse(bus: &mut PortBus, body: &[u8]) -> Status {
    let [lo, hi] = (body.len() as u16).to_le_bytes();

    bus.output(ports::REQUEST, 0);
    bus.output(ports::LENGTH_LO, lo);
    bus.output(ports::LENGTH_HI, hi);

    if bus.input(ports::REQUEST) != 1 {
        error!("Trigger refused");
        return Status::Failed;
    }

    for b in body.iter().copied().chain([0]) {
        loop {
            match Status::try_from(bus.input(ports::STATUS)) {
                Ok(Status::Busy) => thread::sleep(POLL_INTERVAL),
                Ok(Status::Failed) => return Status::Failed,
                _ => break,
            }
        }
        bus.output(ports::BODY, b);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();

    loop {
        match Status::try_from(bus.input(ports::STATUS)) {
            Ok(Status::DataReady) => {
                let b = bus.input(ports::READ);
                let _ = out.write_all(&[b]);
            }
            Ok(s @ (Status::Eof | Status::Failed)) => {
                let _ = writeln!(out);
                return s;
            }
            _ => {
                let _ = out.flush();
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}
