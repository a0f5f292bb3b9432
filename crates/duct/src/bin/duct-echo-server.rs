//! Echo server: accepts connections on a duct URI and echoes every frame
//! back until the peer closes.
//!
//! Usage: duct-echo-server <uri>
//!
//! Exit codes: 0 success, 1 operational failure, 2 usage error.

use std::process::ExitCode;

use duct::{ListenOptions, Pipe, RecvOptions, SendOptions, StatusCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(uri) = args.next() else {
        eprintln!("usage: duct-echo-server <uri>");
        return ExitCode::from(2);
    };
    if args.next().is_some() {
        eprintln!("usage: duct-echo-server <uri>");
        return ExitCode::from(2);
    }

    let listener = match duct::listen(&uri, &ListenOptions::default()) {
        Ok(listener) => listener,
        Err(st) => {
            error!("listen failed: {st}");
            return ExitCode::from(1);
        }
    };
    match listener.local_address() {
        Ok(local) => info!("listening on {local}"),
        Err(_) => info!("listening on {uri}"),
    }

    loop {
        match listener.accept() {
            Ok(pipe) => {
                std::thread::spawn(move || serve(pipe));
            }
            Err(st) if st.code() == StatusCode::Closed => return ExitCode::SUCCESS,
            Err(st) => {
                error!("accept failed: {st}");
                return ExitCode::from(1);
            }
        }
    }
}

fn serve(pipe: Box<dyn Pipe>) {
    info!("connection accepted");
    loop {
        match pipe.recv(&RecvOptions::default()) {
            Ok(msg) => {
                if let Err(st) = pipe.send(&msg, &SendOptions::default()) {
                    info!("connection ended: {st}");
                    return;
                }
            }
            Err(st) => {
                info!("connection ended: {st}");
                return;
            }
        }
    }
}
