//! Echo client: dials a duct URI, sends one message, prints the echo.
//!
//! Usage: duct-echo-client <uri> [<message>]
//!
//! Exit codes: 0 success, 1 operational failure, 2 usage error.

use std::process::ExitCode;
use std::time::Duration;

use duct::{DialOptions, Message, RecvOptions, SendOptions};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(uri) = args.next() else {
        eprintln!("usage: duct-echo-client <uri> [<message>]");
        return ExitCode::from(2);
    };
    let body = args.next().unwrap_or_else(|| "hello".to_string());
    if args.next().is_some() {
        eprintln!("usage: duct-echo-client <uri> [<message>]");
        return ExitCode::from(2);
    }

    let opt = DialOptions {
        timeout: Duration::from_secs(5),
        ..DialOptions::default()
    };
    let pipe = match duct::dial(&uri, &opt) {
        Ok(pipe) => pipe,
        Err(st) => {
            error!("dial failed: {st}");
            return ExitCode::from(1);
        }
    };

    if let Err(st) = pipe.send(&Message::from_string(&body), &SendOptions::default()) {
        error!("send failed: {st}");
        return ExitCode::from(1);
    }

    match pipe.recv(&RecvOptions {
        timeout: Duration::from_secs(5),
    }) {
        Ok(echo) => {
            println!("{}", String::from_utf8_lossy(echo.data()));
            ExitCode::SUCCESS
        }
        Err(st) => {
            error!("recv failed: {st}");
            ExitCode::from(1)
        }
    }
}
